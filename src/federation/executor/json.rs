// SPDX-License-Identifier: Apache-2.0

//! JSON document range executor.
//!
//! A JSON source has no query capability: the whole document is read,
//! optionally narrowed by a JSON path, flattened one row per object and then
//! filtered in memory.

use serde_json::Value as Json;
use tracing::{debug, instrument};

use crate::engine::error::{ExecutionError, ExecutionResult};
use crate::engine::traits::SourceReader;
use crate::engine::types::{Parameters, ResultRow, ResultSet, Value};
use crate::federation::json_path::JsonPath;
use crate::query::ast::RangeSource;
use crate::query::eval::ConditionEvaluator;

use super::{RangeContext, RangeExecutor};

/// Fetches JSON ranges through a `SourceReader`
pub struct JsonExecutor<'e> {
    reader: &'e dyn SourceReader,
}

impl<'e> JsonExecutor<'e> {
    pub fn new(reader: &'e dyn SourceReader) -> Self {
        Self { reader }
    }
}

impl RangeExecutor for JsonExecutor<'_> {
    #[instrument(skip_all, fields(range = %context.range.name))]
    fn execute(
        &self,
        context: &RangeContext<'_>,
        parameters: &Parameters,
    ) -> ExecutionResult<ResultSet> {
        let range = context.range;
        let RangeSource::Json { path, filter } = &range.source else {
            return Err(ExecutionError::invalid_plan(format!(
                "range '{}' is not backed by a JSON document",
                range.name
            )));
        };

        let bytes = self
            .reader
            .read(path)
            .map_err(|e| ExecutionError::source_not_found(path.as_str(), e.to_string()))?;
        let document: Json = serde_json::from_slice(&bytes)
            .map_err(|e| ExecutionError::malformed_source(path.as_str(), e.to_string()))?;

        let selected: Vec<&Json> = match filter {
            Some(expression) => {
                let json_path = JsonPath::parse(expression)
                    .map_err(|e| ExecutionError::filter(expression.as_str(), e.to_string()))?;
                json_path.select(&document)
            }
            None => vec![&document],
        };

        let mut rows = ResultSet::new();
        for node in selected {
            match node {
                Json::Array(items) => {
                    for item in items {
                        rows.push(flatten(&range.name, path, item)?);
                    }
                }
                other => rows.push(flatten(&range.name, path, other)?),
            }
        }
        let loaded = rows.len();

        // Objects of one document need not share keys; a missing key reads
        // as null here just as it does after joining.
        let expected = expected_keys(context);
        for row in rows.iter_mut() {
            for key in &expected {
                if !row.contains_key(key) {
                    row.insert(key, Value::Null);
                }
            }
        }

        let evaluator = ConditionEvaluator::new(parameters);
        let mut kept = ResultSet::with_capacity(rows.len());
        'rows: for row in rows {
            for condition in &context.conditions {
                if !evaluator.evaluate(condition, &row)? {
                    continue 'rows;
                }
            }
            kept.push(row);
        }

        debug!(loaded, kept = kept.len(), "json range loaded");
        Ok(kept)
    }
}

/// Row keys the range is read through: its referenced columns and the head
/// column of every identifier in its local conditions.
fn expected_keys(context: &RangeContext<'_>) -> Vec<String> {
    let range = context.range;
    let mut keys: Vec<String> = range
        .referenced_columns()
        .into_iter()
        .map(|column| format!("{}.{column}", range.name))
        .collect();
    let local = context
        .conditions
        .iter()
        .flat_map(|condition| condition.identifiers())
        .filter(|ident| ident.range == range.name);
    for ident in local {
        let Some(head) = ident.path.first() else {
            continue;
        };
        let key = format!("{}.{head}", ident.range);
        if !keys.contains(&key) {
            keys.push(key);
        }
    }
    keys
}

/// One object becomes one row with keys prefixed by the range alias.
fn flatten(alias: &str, path: &str, item: &Json) -> ExecutionResult<ResultRow> {
    let Json::Object(map) = item else {
        return Err(ExecutionError::malformed_source(
            path,
            format!("expected an object per item, found {}", kind(item)),
        ));
    };

    let mut row = ResultRow::with_capacity(map.len());
    for (key, value) in map {
        row.insert(format!("{alias}.{key}"), Value::from_json(value.clone()));
    }
    Ok(row)
}

fn kind(value: &Json) -> &'static str {
    match value {
        Json::Null => "null",
        Json::Bool(_) => "a boolean",
        Json::Number(_) => "a number",
        Json::String(_) => "a string",
        Json::Array(_) => "an array",
        Json::Object(_) => "an object",
    }
}
