// SPDX-License-Identifier: Apache-2.0

//! Join strategies.
//!
//! Combine the accumulated rows of the ranges joined so far with the rows of
//! the next range. Every strategy is a nested loop over the two sides and
//! evaluates the borrowed `via` condition against the merged row.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::error::{ExecutionError, ExecutionResult, ResultExt};
use crate::engine::types::{ResultRow, ResultSet, Value};
use crate::query::ast::Expr;
use crate::query::eval::ConditionEvaluator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinKind {
    Cross,
    Inner,
    Left,
}

impl fmt::Display for JoinKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JoinKind::Cross => "CROSS",
            JoinKind::Inner => "INNER",
            JoinKind::Left => "LEFT",
        };
        f.write_str(name)
    }
}

pub trait JoinStrategy {
    fn join_type(&self) -> JoinKind;

    fn requires_condition(&self) -> bool;

    /// Combines `left` and `right`. On key collision the right-hand value
    /// wins in the merged row.
    fn join(
        &self,
        left: ResultSet,
        right: ResultSet,
        condition: Option<&Expr>,
    ) -> ExecutionResult<ResultSet>;
}

/// Returns the strategy for a join kind.
pub fn strategy_for<'p>(
    kind: JoinKind,
    evaluator: ConditionEvaluator<'p>,
) -> Box<dyn JoinStrategy + 'p> {
    match kind {
        JoinKind::Cross => Box::new(CrossJoin),
        JoinKind::Inner => Box::new(InnerJoin::new(evaluator)),
        JoinKind::Left => Box::new(LeftJoin::new(evaluator)),
    }
}

/// Cartesian product. The condition, if any, is ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrossJoin;

impl JoinStrategy for CrossJoin {
    fn join_type(&self) -> JoinKind {
        JoinKind::Cross
    }

    fn requires_condition(&self) -> bool {
        false
    }

    fn join(
        &self,
        left: ResultSet,
        right: ResultSet,
        _condition: Option<&Expr>,
    ) -> ExecutionResult<ResultSet> {
        if left.is_empty() {
            return Ok(right);
        }
        if right.is_empty() {
            return Ok(left);
        }

        let mut out = Vec::with_capacity(left.len() * right.len());
        for l in &left {
            for r in &right {
                out.push(l.merge(r));
            }
        }
        debug!(left = left.len(), right = right.len(), rows = out.len(), "cross join");
        Ok(out)
    }
}

/// Keeps the merged pairs for which the condition holds.
#[derive(Debug, Clone, Copy)]
pub struct InnerJoin<'p> {
    evaluator: ConditionEvaluator<'p>,
}

impl<'p> InnerJoin<'p> {
    pub fn new(evaluator: ConditionEvaluator<'p>) -> Self {
        Self { evaluator }
    }
}

impl JoinStrategy for InnerJoin<'_> {
    fn join_type(&self) -> JoinKind {
        JoinKind::Inner
    }

    fn requires_condition(&self) -> bool {
        true
    }

    fn join(
        &self,
        left: ResultSet,
        right: ResultSet,
        condition: Option<&Expr>,
    ) -> ExecutionResult<ResultSet> {
        let condition =
            condition.ok_or_else(|| ExecutionError::missing_join_condition(self.join_type()))?;
        if left.is_empty() || right.is_empty() {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        for l in &left {
            for r in &right {
                let merged = l.merge(r);
                if matches(&self.evaluator, condition, &merged)? {
                    out.push(merged);
                }
            }
        }
        debug!(left = left.len(), right = right.len(), rows = out.len(), "inner join");
        Ok(out)
    }
}

/// Like `InnerJoin`, but a left row without any match is kept once with every
/// right-hand column set to null.
#[derive(Debug, Clone, Copy)]
pub struct LeftJoin<'p> {
    evaluator: ConditionEvaluator<'p>,
}

impl<'p> LeftJoin<'p> {
    pub fn new(evaluator: ConditionEvaluator<'p>) -> Self {
        Self { evaluator }
    }
}

impl JoinStrategy for LeftJoin<'_> {
    fn join_type(&self) -> JoinKind {
        JoinKind::Left
    }

    fn requires_condition(&self) -> bool {
        true
    }

    fn join(
        &self,
        left: ResultSet,
        right: ResultSet,
        condition: Option<&Expr>,
    ) -> ExecutionResult<ResultSet> {
        let condition =
            condition.ok_or_else(|| ExecutionError::missing_join_condition(self.join_type()))?;
        if left.is_empty() {
            return Ok(Vec::new());
        }
        // Nothing to infer the right-hand columns from.
        if right.is_empty() {
            return Ok(left);
        }

        let null_right: ResultRow = right[0]
            .keys()
            .map(|key| (key.to_string(), Value::Null))
            .collect();

        let mut out = Vec::with_capacity(left.len());
        for l in &left {
            let mut matched = false;
            for r in &right {
                let merged = l.merge(r);
                if matches(&self.evaluator, condition, &merged)? {
                    out.push(merged);
                    matched = true;
                }
            }
            if !matched {
                out.push(l.merge(&null_right));
            }
        }
        debug!(left = left.len(), right = right.len(), rows = out.len(), "left join");
        Ok(out)
    }
}

fn matches(
    evaluator: &ConditionEvaluator<'_>,
    condition: &Expr,
    row: &ResultRow,
) -> ExecutionResult<bool> {
    evaluator
        .evaluate(condition, row)
        .context(|| "failed to evaluate join condition")
}
