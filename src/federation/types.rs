// SPDX-License-Identifier: Apache-2.0

//! Types describing one plan execution.

use serde::Serialize;

use crate::engine::types::QueryId;

/// Result metadata for one range fetch.
#[derive(Debug, Clone, Serialize)]
pub struct RangeFetchResult {
    /// Range alias
    pub range: String,
    /// `entity:<name>` or `json:<path>`
    pub source: String,
    /// Number of rows after range-local filtering
    pub row_count: u64,
    /// Number of conjuncts evaluated by the executor instead of after joining
    pub pushed_conditions: usize,
    /// Fetch duration in milliseconds
    pub fetch_time_ms: f64,
}

/// What the pagination transformer did with the plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PaginationOutcome {
    /// No window was requested
    NotRequested,
    /// A window was requested but could not be applied natively; the
    /// result is windowed in memory (or left to the application)
    Skipped { reason: String },
    /// An existing primary-key `IN` list was sliced to the page
    InValuesSliced { page_keys: usize },
    /// Keys were probed and the page injected as a primary-key `IN`
    KeysProbed { total_keys: usize, page_keys: usize },
    /// The page lies past the last key; an always-false condition was added
    EmptyPage { total_keys: usize },
}

impl PaginationOutcome {
    /// Whether the plan now returns only the requested page.
    pub fn is_native(&self) -> bool {
        matches!(
            self,
            PaginationOutcome::InValuesSliced { .. }
                | PaginationOutcome::KeysProbed { .. }
                | PaginationOutcome::EmptyPage { .. }
        )
    }
}

/// Extended execution response with per-range metadata.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionMetadata {
    pub query_id: QueryId,
    /// Per-range fetch results of the final run, in join order
    pub range_results: Vec<RangeFetchResult>,
    pub pagination: PaginationOutcome,
    /// Time spent probing primary keys in milliseconds
    pub probe_time_ms: f64,
    /// Time spent joining in milliseconds
    pub join_time_ms: f64,
    /// Total pipeline time in milliseconds
    pub total_time_ms: f64,
    /// Rows returned to the caller
    pub row_count: u64,
}

impl ExecutionMetadata {
    pub fn new(query_id: QueryId) -> Self {
        Self {
            query_id,
            range_results: Vec::new(),
            pagination: PaginationOutcome::NotRequested,
            probe_time_ms: 0.0,
            join_time_ms: 0.0,
            total_time_ms: 0.0,
            row_count: 0,
        }
    }
}
