// SPDX-License-Identifier: Apache-2.0

//! Range executors.
//!
//! One executor per source kind. Each fetches the rows of a single range,
//! already narrowed by the conjuncts that only concern that range, and keys
//! every column as `alias.column`.

pub mod database;
pub mod json;

pub use database::DatabaseExecutor;
pub use json::JsonExecutor;

use crate::engine::error::ExecutionResult;
use crate::engine::types::{Parameters, ResultSet};
use crate::query::ast::{Expr, Range, SortItem};

/// Everything an executor needs to know about the range it fetches
#[derive(Debug, Clone)]
pub struct RangeContext<'a> {
    pub range: &'a Range,
    /// Conjuncts whose identifiers all belong to this range
    pub conditions: Vec<&'a Expr>,
    /// Sort items the source may apply natively
    pub order_by: Vec<&'a SortItem>,
    /// Duplicate rows over the fetched columns may be dropped
    pub distinct: bool,
}

impl<'a> RangeContext<'a> {
    pub fn new(range: &'a Range) -> Self {
        Self {
            range,
            conditions: Vec::new(),
            order_by: Vec::new(),
            distinct: false,
        }
    }
}

pub trait RangeExecutor {
    fn execute(&self, context: &RangeContext<'_>, parameters: &Parameters)
        -> ExecutionResult<ResultSet>;
}
