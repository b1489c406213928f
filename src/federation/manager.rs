// SPDX-License-Identifier: Apache-2.0

//! Federation execution manager.
//!
//! Orchestrates the full pipeline for one plan:
//! annotate → paginate → fetch each range → join → residual filter → sort →
//! project → unique → window.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tokio::time::{timeout, Duration};
use tracing::{debug, instrument, warn, Span};

use crate::config::EngineConfig;
use crate::engine::error::{ExecutionError, ExecutionResult, ResultExt};
use crate::engine::traits::{Backend, EntityMetadata, SourceReader, SqlGenerator};
use crate::engine::types::{Parameters, QueryId, ResultRow, ResultSet, Value};
use crate::metrics;
use crate::observability::Sensitive;
use crate::query::ast::{ExprKind, QueryPlan, RangeSource, SortDirection, SortItem};
use crate::query::eval::ConditionEvaluator;
use crate::query::reference;

use super::executor::{DatabaseExecutor, JsonExecutor, RangeExecutor};
use super::join::strategy_for;
use super::pagination::PaginationTransformer;
use super::planner::build_plan;
use super::types::{ExecutionMetadata, RangeFetchResult};

/// Executes query plans against one relational backend and any number of
/// JSON documents.
pub struct QueryEngine {
    backend: Arc<dyn Backend>,
    generator: Arc<dyn SqlGenerator>,
    reader: Arc<dyn SourceReader>,
    metadata: Arc<dyn EntityMetadata>,
    query_timeout: Option<Duration>,
}

/// Rows and per-range fetch results of one pipeline run
struct PipelineOutput {
    rows: ResultSet,
    range_results: Vec<RangeFetchResult>,
    join_time_ms: f64,
}

impl QueryEngine {
    pub fn new(
        backend: Arc<dyn Backend>,
        generator: Arc<dyn SqlGenerator>,
        reader: Arc<dyn SourceReader>,
        metadata: Arc<dyn EntityMetadata>,
    ) -> Self {
        Self {
            backend,
            generator,
            reader,
            metadata,
            query_timeout: None,
        }
    }

    /// Builds an engine from configuration with the bundled generator,
    /// filesystem reader and static metadata.
    pub fn from_config(config: &EngineConfig, backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            generator: Arc::new(config.sql_generator()),
            reader: Arc::new(config.source_reader()),
            metadata: Arc::new(config.metadata()),
            query_timeout: config.query_timeout(),
        }
    }

    pub fn with_timeout(mut self, query_timeout: Option<Duration>) -> Self {
        self.query_timeout = query_timeout;
        self
    }

    pub fn query_timeout(&self) -> Option<Duration> {
        self.query_timeout
    }

    /// Executes a plan and returns its rows.
    pub fn execute_plan(
        &self,
        plan: QueryPlan,
        parameters: &Parameters,
    ) -> ExecutionResult<ResultSet> {
        self.execute_plan_with_metadata(plan, parameters)
            .map(|(rows, _)| rows)
    }

    /// Executes a plan and returns its rows with per-range fetch metadata.
    #[instrument(skip_all, fields(query_id = tracing::field::Empty, ranges = plan.ranges.len()))]
    pub fn execute_plan_with_metadata(
        &self,
        mut plan: QueryPlan,
        parameters: &Parameters,
    ) -> ExecutionResult<(ResultSet, ExecutionMetadata)> {
        let total_start = Instant::now();
        let mut meta = ExecutionMetadata::new(QueryId::new());
        Span::current().record("query_id", tracing::field::display(&meta.query_id));
        debug!(params = %Sensitive::new(parameters), "executing plan");

        let result = self.execute_inner(&mut plan, parameters, &mut meta);
        let total_time_ms = total_start.elapsed().as_secs_f64() * 1000.0;

        match result {
            Ok(rows) => {
                meta.total_time_ms = total_time_ms;
                meta.row_count = rows.len() as u64;
                metrics::record_plan(total_time_ms, rows.len(), true);
                debug!(
                    rows = rows.len(),
                    total_ms = total_time_ms,
                    pagination = ?meta.pagination,
                    "plan executed"
                );
                Ok((rows, meta))
            }
            Err(err) => {
                metrics::record_plan(total_time_ms, 0, false);
                warn!(error = %err, "plan execution failed");
                Err(err)
            }
        }
    }

    /// Executes a plan on a blocking worker, bounded by the configured
    /// timeout. Without a timeout the plan still runs off the async runtime.
    ///
    /// On timeout the worker is abandoned, not cancelled.
    pub async fn execute_plan_with_timeout(
        self: &Arc<Self>,
        plan: QueryPlan,
        parameters: Parameters,
    ) -> ExecutionResult<ResultSet> {
        let engine = Arc::clone(self);
        let task =
            tokio::task::spawn_blocking(move || engine.execute_plan(plan, &parameters));

        let joined = match self.query_timeout {
            Some(limit) => match timeout(limit, task).await {
                Ok(joined) => joined,
                Err(_) => {
                    metrics::record_timeout();
                    let timeout_ms = limit.as_millis() as u64;
                    warn!(timeout_ms, "plan execution timed out");
                    return Err(ExecutionError::Timeout { timeout_ms });
                }
            },
            None => task.await,
        };

        joined.map_err(|e| ExecutionError::internal(format!("execution task failed: {e}")))?
    }

    fn execute_inner(
        &self,
        plan: &mut QueryPlan,
        parameters: &Parameters,
        meta: &mut ExecutionMetadata,
    ) -> ExecutionResult<ResultSet> {
        resolve_sort_aliases(plan);

        let probe_start = Instant::now();
        let transformer = PaginationTransformer::new(self.metadata.as_ref());
        meta.pagination = transformer.apply(plan, |probe| {
            self.run_pipeline(probe, parameters, false)
                .map(|output| output.rows)
        })?;
        if meta.pagination.is_native() {
            meta.probe_time_ms = probe_start.elapsed().as_secs_f64() * 1000.0;
        }

        let output = self.run_pipeline(plan, parameters, !meta.pagination.is_native())?;
        meta.range_results = output.range_results;
        meta.join_time_ms = output.join_time_ms;
        Ok(output.rows)
    }

    fn run_pipeline(
        &self,
        plan: &mut QueryPlan,
        parameters: &Parameters,
        apply_window: bool,
    ) -> ExecutionResult<PipelineOutput> {
        reference::annotate(plan);
        let plan: &QueryPlan = plan;
        let exec = build_plan(plan)?;
        let evaluator = ConditionEvaluator::new(parameters);

        let database = DatabaseExecutor::new(
            self.backend.as_ref(),
            self.generator.as_ref(),
            self.metadata.as_ref(),
        );
        let json = JsonExecutor::new(self.reader.as_ref());

        let mut rows: Option<ResultSet> = None;
        let mut range_results = Vec::with_capacity(exec.ranges.len());
        let mut join_time_ms = 0.0;

        for step in &exec.ranges {
            let range = step.range;
            let context = step.context();
            let fetch_start = Instant::now();
            let executor: &dyn RangeExecutor = match &range.source {
                RangeSource::Entity { .. } => &database,
                RangeSource::Json { .. } => &json,
            };
            let fetched = executor
                .execute(&context, parameters)
                .context(|| format!("fetching range '{}'", range.name))?;

            range_results.push(RangeFetchResult {
                range: range.name.clone(),
                source: describe_source(&range.source),
                row_count: fetched.len() as u64,
                pushed_conditions: step.local.len(),
                fetch_time_ms: fetch_start.elapsed().as_secs_f64() * 1000.0,
            });

            rows = Some(match (rows.take(), step.kind) {
                (None, _) => fetched,
                (Some(accumulated), Some(kind)) => {
                    let join_start = Instant::now();
                    let joined = strategy_for(kind, evaluator)
                        .join(accumulated, fetched, step.condition)
                        .context(|| format!("joining range '{}'", range.name))?;
                    join_time_ms += join_start.elapsed().as_secs_f64() * 1000.0;
                    debug!(range = %range.name, %kind, rows = joined.len(), "range joined");
                    joined
                }
                (Some(_), None) => {
                    return Err(ExecutionError::invalid_plan(format!(
                        "range '{}' has no join kind",
                        range.name
                    )))
                }
            });
        }
        let mut rows = rows.unwrap_or_default();

        complete_nulls(plan, &mut rows);

        for condition in &exec.residual {
            rows = evaluator.filter(rows, Some(condition))?;
        }

        let sort = plan.sort.as_ref().filter(|s| !s.in_application);
        if let Some(sort) = sort {
            sort_rows(&evaluator, &mut rows, &sort.items)?;
        }

        let mut rows = project(plan, &evaluator, rows)?;

        if plan.unique {
            rows = dedupe(rows)?;
        }

        let delegated = plan.sort.as_ref().is_some_and(|s| s.in_application);
        if apply_window && !delegated {
            if let (Some(window), Some(size)) = (plan.window, plan.window_size) {
                let start = usize::try_from(window.saturating_mul(size)).unwrap_or(usize::MAX);
                let len = usize::try_from(size).unwrap_or(usize::MAX);
                rows = rows.into_iter().skip(start).take(len).collect();
            }
        }

        Ok(PipelineOutput {
            rows,
            range_results,
            join_time_ms,
        })
    }
}

/// Replaces ORDER BY alias references with the aliased SELECT expression so
/// the sort survives the probe's projection rewrite.
fn resolve_sort_aliases(plan: &mut QueryPlan) {
    let Some(mut sort) = plan.sort.take() else {
        return;
    };
    for item in &mut sort.items {
        if let ExprKind::AliasRef(alias) = &item.expr.kind {
            if let Some(selected) = plan.select_by_alias(alias) {
                item.expr = selected.expr.clone();
            }
        }
    }
    plan.sort = Some(sort);
}

fn describe_source(source: &RangeSource) -> String {
    match source {
        RangeSource::Entity { entity } => format!("entity:{entity}"),
        RangeSource::Json { path, .. } => format!("json:{path}"),
    }
}

/// Fills every referenced column missing from a row with null, so rows of a
/// left join without matches and empty joined ranges still resolve.
fn complete_nulls(plan: &QueryPlan, rows: &mut ResultSet) {
    let expected: Vec<String> = plan
        .ranges
        .iter()
        .flat_map(|range| {
            range
                .referenced_columns()
                .into_iter()
                .map(move |column| format!("{}.{column}", range.name))
        })
        .collect();

    for row in rows.iter_mut() {
        for key in &expected {
            if !row.contains_key(key) {
                row.insert(key, Value::Null);
            }
        }
    }
}

/// Stable in-memory sort. Nulls sort first ascending, last descending.
fn sort_rows(
    evaluator: &ConditionEvaluator<'_>,
    rows: &mut ResultSet,
    items: &[SortItem],
) -> ExecutionResult<()> {
    if items.is_empty() || rows.len() < 2 {
        return Ok(());
    }

    let mut keyed = Vec::with_capacity(rows.len());
    for row in rows.drain(..) {
        let mut keys = Vec::with_capacity(items.len());
        for item in items {
            keys.push(evaluator.scalar(&item.expr, &row)?);
        }
        keyed.push((keys, row));
    }

    keyed.sort_by(|(a, _), (b, _)| {
        for ((x, y), item) in a.iter().zip(b).zip(items) {
            let ord = match item.direction {
                SortDirection::Asc => x.sort_cmp(y),
                SortDirection::Desc => y.sort_cmp(x),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });

    rows.extend(keyed.into_iter().map(|(_, row)| row));
    Ok(())
}

/// Projects rows to the SELECT items. Plans with aggregates produce exactly
/// one row; plans without SELECT items return the joined rows as they are.
fn project(
    plan: &QueryPlan,
    evaluator: &ConditionEvaluator<'_>,
    rows: ResultSet,
) -> ExecutionResult<ResultSet> {
    if plan.values.is_empty() {
        return Ok(rows);
    }

    if plan.has_aggregates() {
        let mut out = ResultRow::with_capacity(plan.values.len());
        for item in &plan.values {
            out.insert(item.output_name(), evaluator.aggregate(&item.expr, &rows)?);
        }
        return Ok(vec![out]);
    }

    let mut projected = Vec::with_capacity(rows.len());
    for row in &rows {
        let mut out = ResultRow::with_capacity(plan.values.len());
        for item in &plan.values {
            out.insert(item.output_name(), evaluator.scalar(&item.expr, row)?);
        }
        projected.push(out);
    }
    Ok(projected)
}

/// Drops repeated rows, keeping the first occurrence.
fn dedupe(rows: ResultSet) -> ExecutionResult<ResultSet> {
    let mut seen = HashSet::with_capacity(rows.len());
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let rendered = serde_json::to_string(&row)
            .map_err(|e| ExecutionError::internal(format!("failed to render row: {e}")))?;
        if seen.insert(rendered) {
            out.push(row);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io;

    use crate::engine::error::BackendFailure;
    use crate::engine::metadata::{EntityDefinition, StaticMetadata};
    use crate::engine::sql_generator::AnsiSqlGenerator;
    use crate::engine::types::QueryResult;
    use crate::federation::types::PaginationOutcome;
    use crate::query::ast::{AggregateFunc, Expr, Range, SelectItem};

    /// Backend that fails the test if called
    struct NoBackend;

    impl Backend for NoBackend {
        fn driver_id(&self) -> &'static str {
            "none"
        }

        fn execute(&self, sql: &str, _params: &[Value]) -> Result<QueryResult, BackendFailure> {
            Err(BackendFailure::new(format!("unexpected query: {sql}")))
        }
    }

    struct MemoryReader {
        files: HashMap<&'static str, &'static str>,
    }

    impl SourceReader for MemoryReader {
        fn read(&self, path: &str) -> io::Result<Vec<u8>> {
            self.files
                .get(path)
                .map(|s| s.as_bytes().to_vec())
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.to_string()))
        }
    }

    fn engine() -> QueryEngine {
        let reader = MemoryReader {
            files: HashMap::from([
                (
                    "people.json",
                    r#"[{"id": 1, "name": "Ada", "team": "a"},
                        {"id": 2, "name": "Alan", "team": "b"},
                        {"id": 3, "name": "Grace", "team": "a"}]"#,
                ),
                (
                    "teams.json",
                    r#"[{"code": "a", "label": "Core"}, {"code": "c", "label": "Ops"}]"#,
                ),
            ]),
        };
        QueryEngine::new(
            Arc::new(NoBackend),
            Arc::new(AnsiSqlGenerator::default()),
            Arc::new(reader),
            Arc::new(StaticMetadata::new().with_entity("User", EntityDefinition::table("users", &["id"]))),
        )
    }

    fn names(rows: &ResultSet, key: &str) -> Vec<Value> {
        rows.iter().filter_map(|r| r.get(key).cloned()).collect()
    }

    #[test]
    fn left_join_between_json_ranges_keeps_unmatched_rows() {
        let plan = QueryPlan::new()
            .with_range(Range::json("p", "people.json"))
            .with_range(
                Range::json("t", "teams.json")
                    .via(Expr::eq(Expr::ident("t", "code"), Expr::ident("p", "team")), false),
            )
            .with_value(SelectItem::aliased(Expr::ident("p", "name"), "name"))
            .with_value(SelectItem::aliased(Expr::ident("t", "label"), "team"))
            .with_sort(SortItem::asc(Expr::ident("p", "id")));

        let rows = engine().execute_plan(plan, &Parameters::new()).unwrap();
        assert_eq!(
            rows,
            vec![
                ResultRow::new().with("name", "Ada").with("team", "Core"),
                ResultRow::new().with("name", "Alan").with("team", Value::Null),
                ResultRow::new().with("name", "Grace").with("team", "Core"),
            ]
        );
    }

    #[test]
    fn residual_conditions_sort_and_window_apply_in_memory() {
        let plan = QueryPlan::new()
            .with_range(Range::json("p", "people.json"))
            .with_condition(Expr::eq(Expr::ident("p", "team"), Expr::lit("a")).or(
                Expr::eq(Expr::ident("p", "name"), Expr::lit("Alan")),
            ))
            .with_value(SelectItem::aliased(Expr::ident("p", "name"), "name"))
            .with_sort(SortItem::desc(Expr::alias_ref("name")))
            .with_window(0, 2);

        let (rows, meta) = engine()
            .execute_plan_with_metadata(plan, &Parameters::new())
            .unwrap();
        assert_eq!(names(&rows, "name"), vec![Value::from("Grace"), Value::from("Alan")]);
        assert!(matches!(meta.pagination, PaginationOutcome::Skipped { .. }));
        assert_eq!(meta.range_results[0].row_count, 3);
    }

    #[test]
    fn aggregates_collapse_to_one_row() {
        let plan = QueryPlan::new()
            .with_range(Range::json("p", "people.json"))
            .with_value(SelectItem::aliased(
                Expr::aggregate(AggregateFunc::Count, None, None),
                "people",
            ))
            .with_value(SelectItem::aliased(
                Expr::aggregate(
                    AggregateFunc::Max,
                    Some(Expr::ident("p", "id")),
                    Some(Expr::eq(Expr::ident("p", "team"), Expr::lit("a"))),
                ),
                "last_a",
            ));
        let rows = engine().execute_plan(plan, &Parameters::new()).unwrap();
        assert_eq!(
            rows,
            vec![ResultRow::new().with("people", 3).with("last_a", 3)]
        );
    }

    #[test]
    fn unique_drops_repeated_projections() {
        let plan = QueryPlan::new()
            .with_range(Range::json("p", "people.json"))
            .with_value(SelectItem::aliased(Expr::ident("p", "team"), "team"))
            .with_unique(true);
        let rows = engine().execute_plan(plan, &Parameters::new()).unwrap();
        assert_eq!(names(&rows, "team"), vec![Value::from("a"), Value::from("b")]);
    }

    #[test]
    fn in_application_sort_leaves_order_and_window_to_caller() {
        let mut plan = QueryPlan::new()
            .with_range(Range::json("p", "people.json"))
            .with_value(SelectItem::aliased(Expr::ident("p", "id"), "id"))
            .with_sort(SortItem::desc(Expr::ident("p", "id")))
            .with_window(0, 1);
        if let Some(sort) = plan.sort.as_mut() {
            sort.in_application = true;
        }
        let rows = engine().execute_plan(plan, &Parameters::new()).unwrap();
        assert_eq!(
            names(&rows, "id"),
            vec![Value::Int(1), Value::Int(2), Value::Int(3)]
        );
    }

    #[test]
    fn fetch_failures_name_the_range() {
        let plan = QueryPlan::new().with_range(Range::json("x", "missing.json"));
        let err = engine().execute_plan(plan, &Parameters::new()).unwrap_err();
        assert_eq!(err.to_string().split(':').next(), Some("fetching range 'x'"));
        assert!(matches!(err.root(), ExecutionError::SourceNotFound { .. }));
    }

    #[tokio::test]
    async fn timeout_wrapper_runs_plans_off_the_runtime() {
        let engine = Arc::new(engine().with_timeout(Some(Duration::from_secs(5))));
        let plan = QueryPlan::new()
            .with_range(Range::json("p", "people.json"))
            .with_value(SelectItem::aliased(Expr::ident("p", "id"), "id"));
        let rows = engine
            .execute_plan_with_timeout(plan, Parameters::new())
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);
    }
}
