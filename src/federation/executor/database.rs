// SPDX-License-Identifier: Apache-2.0

//! Relational range executor.

use tracing::{debug, instrument};

use crate::engine::error::{ExecutionError, ExecutionResult};
use crate::engine::sql_generator::RangeRequest;
use crate::engine::traits::{Backend, EntityMetadata, SqlGenerator};
use crate::engine::types::{Parameters, ResultRow, ResultSet};
use crate::observability::Sensitive;
use crate::query::ast::RangeSource;

use super::{RangeContext, RangeExecutor};

/// Fetches entity ranges through generated SQL
pub struct DatabaseExecutor<'e> {
    backend: &'e dyn Backend,
    generator: &'e dyn SqlGenerator,
    metadata: &'e dyn EntityMetadata,
}

impl<'e> DatabaseExecutor<'e> {
    pub fn new(
        backend: &'e dyn Backend,
        generator: &'e dyn SqlGenerator,
        metadata: &'e dyn EntityMetadata,
    ) -> Self {
        Self {
            backend,
            generator,
            metadata,
        }
    }
}

impl RangeExecutor for DatabaseExecutor<'_> {
    #[instrument(skip_all, fields(range = %context.range.name, driver = self.backend.driver_id()))]
    fn execute(
        &self,
        context: &RangeContext<'_>,
        parameters: &Parameters,
    ) -> ExecutionResult<ResultSet> {
        let range = context.range;
        let RangeSource::Entity { entity } = &range.source else {
            return Err(ExecutionError::invalid_plan(format!(
                "range '{}' is not backed by an entity",
                range.name
            )));
        };
        let table = self.metadata.table_name(entity).ok_or_else(|| {
            ExecutionError::invalid_plan(format!("unknown entity '{entity}' in range '{}'", range.name))
        })?;

        let request = RangeRequest {
            table,
            alias: &range.name,
            columns: range
                .referenced_columns()
                .into_iter()
                .map(str::to_string)
                .collect(),
            conditions: context.conditions.clone(),
            order_by: context.order_by.clone(),
            distinct: context.distinct,
        };

        let generated = self.generator.to_sql(&request, parameters)?;
        debug!(
            sql = %generated.text,
            params = ?Sensitive::new(&generated.params),
            "fetching range"
        );

        let result = self.backend.execute(&generated.text, &generated.params)?;

        let keys: Vec<String> = result
            .columns
            .iter()
            .map(|c| format!("{}.{}", range.name, c.name))
            .collect();

        let rows = result
            .rows
            .into_iter()
            .map(|row| {
                let mut out = ResultRow::with_capacity(keys.len());
                for (key, value) in keys.iter().zip(row.values) {
                    out.insert(key, value);
                }
                out
            })
            .collect::<ResultSet>();

        debug!(rows = rows.len(), "range fetched");
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::engine::error::BackendFailure;
    use crate::engine::metadata::{EntityDefinition, StaticMetadata};
    use crate::engine::sql_generator::AnsiSqlGenerator;
    use crate::engine::types::{ColumnInfo, QueryResult, Row, Value};
    use crate::query::ast::{CompareOp, Expr, Range};
    use crate::query::reference;
    use crate::query::{QueryPlan, SelectItem};

    /// Records the SQL it receives and returns a canned result
    struct RecordingBackend {
        seen: Mutex<Vec<(String, Vec<Value>)>>,
        result: Result<QueryResult, BackendFailure>,
    }

    impl Backend for RecordingBackend {
        fn driver_id(&self) -> &'static str {
            "recording"
        }

        fn execute(&self, sql: &str, params: &[Value]) -> Result<QueryResult, BackendFailure> {
            self.seen
                .lock()
                .unwrap()
                .push((sql.to_string(), params.to_vec()));
            self.result.clone()
        }
    }

    fn users_result() -> QueryResult {
        QueryResult {
            columns: vec![
                ColumnInfo {
                    name: "id".into(),
                    data_type: "INTEGER".into(),
                    nullable: false,
                },
                ColumnInfo {
                    name: "name".into(),
                    data_type: "VARCHAR".into(),
                    nullable: true,
                },
            ],
            rows: vec![
                Row {
                    values: vec![Value::Int(1), Value::from("Ada")],
                },
                Row {
                    values: vec![Value::Int(2), Value::from("Grace")],
                },
            ],
            execution_time_ms: 0.1,
        }
    }

    fn metadata() -> StaticMetadata {
        StaticMetadata::new().with_entity("User", EntityDefinition::table("users", &["id"]))
    }

    #[test]
    fn fetches_referenced_columns_with_qualified_keys() {
        let backend = RecordingBackend {
            seen: Mutex::new(Vec::new()),
            result: Ok(users_result()),
        };
        let generator = AnsiSqlGenerator::default();
        let metadata = metadata();
        let executor = DatabaseExecutor::new(&backend, &generator, &metadata);

        let mut plan = QueryPlan::new()
            .with_range(Range::entity("u", "User"))
            .with_value(SelectItem::new(Expr::ident("u", "id")))
            .with_value(SelectItem::new(Expr::ident("u", "name")));
        reference::annotate(&mut plan);

        let cond = Expr::compare(CompareOp::Gt, Expr::ident("u", "id"), Expr::lit(0));
        let mut context = RangeContext::new(&plan.ranges[0]);
        context.conditions.push(&cond);

        let rows = executor.execute(&context, &Parameters::new()).unwrap();
        assert_eq!(
            rows,
            vec![
                ResultRow::new().with("u.id", 1).with("u.name", "Ada"),
                ResultRow::new().with("u.id", 2).with("u.name", "Grace"),
            ]
        );

        let seen = backend.seen.lock().unwrap();
        assert_eq!(
            seen[0].0,
            "SELECT \"u\".\"id\", \"u\".\"name\" FROM \"users\" AS \"u\" WHERE (\"u\".\"id\" > ?)"
        );
        assert_eq!(seen[0].1, vec![Value::Int(0)]);
    }

    #[test]
    fn backend_failures_become_backend_errors() {
        let backend = RecordingBackend {
            seen: Mutex::new(Vec::new()),
            result: Err(BackendFailure::new("relation \"users\" does not exist")),
        };
        let generator = AnsiSqlGenerator::default();
        let metadata = metadata();
        let executor = DatabaseExecutor::new(&backend, &generator, &metadata);

        let range = Range::entity("u", "User");
        let err = executor
            .execute(&RangeContext::new(&range), &Parameters::new())
            .unwrap_err();
        match err {
            ExecutionError::BackendError { message } => assert!(message.contains("does not exist")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn generation_failures_become_backend_errors() {
        let backend = RecordingBackend {
            seen: Mutex::new(Vec::new()),
            result: Ok(users_result()),
        };
        let generator = AnsiSqlGenerator::default();
        let metadata = metadata();
        let executor = DatabaseExecutor::new(&backend, &generator, &metadata);

        let range = Range::entity("u", "User");
        let cond = Expr::eq(Expr::ident("u", "id"), Expr::param("missing"));
        let mut context = RangeContext::new(&range);
        context.conditions.push(&cond);

        let err = executor.execute(&context, &Parameters::new()).unwrap_err();
        assert!(matches!(err, ExecutionError::BackendError { .. }));
        assert!(backend.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn unknown_entity_is_an_invalid_plan() {
        let backend = RecordingBackend {
            seen: Mutex::new(Vec::new()),
            result: Ok(QueryResult::empty()),
        };
        let generator = AnsiSqlGenerator::default();
        let metadata = metadata();
        let executor = DatabaseExecutor::new(&backend, &generator, &metadata);

        let range = Range::entity("x", "Ghost");
        let err = executor
            .execute(&RangeContext::new(&range), &Parameters::new())
            .unwrap_err();
        assert!(matches!(err, ExecutionError::InvalidPlan { .. }));
    }
}
