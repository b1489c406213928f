// SPDX-License-Identifier: Apache-2.0

//! Execution planner.
//!
//! Orders the ranges for joining, picks a join strategy per range and splits
//! the WHERE tree into conjuncts each range can evaluate while fetching and
//! the residual conjuncts evaluated after joining.

use crate::engine::error::{ExecutionError, ExecutionResult};
use crate::query::ast::{contains_aggregate, Expr, ExprKind, QueryPlan, Range, SortItem};

use super::executor::RangeContext;
use super::join::JoinKind;

/// Fetch and join instructions for one range
#[derive(Debug, Clone)]
pub struct RangePlan<'a> {
    pub range: &'a Range,
    /// `None` for the base range
    pub kind: Option<JoinKind>,
    /// Conjuncts pushed into the range executor
    pub local: Vec<&'a Expr>,
    pub order_by: Vec<&'a SortItem>,
    pub distinct: bool,
    /// The range's `via` condition
    pub condition: Option<&'a Expr>,
}

impl<'a> RangePlan<'a> {
    pub fn context(&self) -> RangeContext<'a> {
        RangeContext {
            range: self.range,
            conditions: self.local.clone(),
            order_by: self.order_by.clone(),
            distinct: self.distinct,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionPlan<'a> {
    /// Base range first, then the joined ranges in plan order
    pub ranges: Vec<RangePlan<'a>>,
    /// Conjuncts evaluated against the joined rows
    pub residual: Vec<&'a Expr>,
}

/// Builds the execution plan for an annotated query plan.
pub fn build_plan(plan: &QueryPlan) -> ExecutionResult<ExecutionPlan<'_>> {
    let base = plan
        .base_range()
        .ok_or_else(|| ExecutionError::invalid_plan("query has no range without a join property"))?;

    let mut ranges = Vec::with_capacity(plan.ranges.len());
    ranges.push(RangePlan {
        range: base,
        kind: None,
        local: Vec::new(),
        order_by: Vec::new(),
        distinct: false,
        condition: None,
    });
    for range in plan.ranges.iter().filter(|r| r.name != base.name) {
        let (kind, condition) = match &range.join {
            Some(join) if join.required => (JoinKind::Inner, Some(&join.condition)),
            Some(join) => (JoinKind::Left, Some(&join.condition)),
            None => (JoinKind::Cross, None),
        };
        ranges.push(RangePlan {
            range,
            kind: Some(kind),
            local: Vec::new(),
            order_by: Vec::new(),
            distinct: false,
            condition,
        });
    }

    // A cross join passes one side through unchanged when the other is empty,
    // so narrowing either side before it would change the result.
    let has_cross = ranges.iter().any(|r| r.kind == Some(JoinKind::Cross));

    let mut residual = Vec::new();
    if let Some(conditions) = &plan.conditions {
        for conjunct in conditions.conjuncts() {
            match pushdown_target(conjunct, &ranges).filter(|_| !has_cross) {
                Some(index) => ranges[index].local.push(conjunct),
                None => residual.push(conjunct),
            }
        }
    }

    // Joins iterate the accumulated rows in the outer loop, so a sort the base
    // source applies still holds after joining.
    if !base.is_json() {
        if let Some(sort) = &plan.sort {
            let native = !sort.in_application
                && sort.items.iter().all(|item| {
                    item.expr
                        .as_identifier()
                        .is_some_and(|ident| ident.range == base.name && ident.is_base())
                });
            if native {
                ranges[0].order_by = sort.items.iter().collect();
            }
        }
    }

    // Distinct may only be pushed when the range columns are the whole output.
    if ranges.len() == 1 && plan.unique && !plan.has_aggregates() {
        ranges[0].distinct = true;
    }

    Ok(ExecutionPlan { ranges, residual })
}

/// Index of the range a conjunct can be evaluated in while fetching.
fn pushdown_target(conjunct: &Expr, ranges: &[RangePlan<'_>]) -> Option<usize> {
    if contains_aggregate(conjunct) || contains_alias_ref(conjunct) {
        return None;
    }
    let identifiers = conjunct.identifiers();
    let first = identifiers.first()?;
    if identifiers.iter().any(|ident| ident.range != first.range) {
        return None;
    }

    let index = ranges.iter().position(|r| r.range.name == first.range)?;
    let target = &ranges[index];
    // Filtering the optional side before a left join would turn excluded
    // rows into null-filled rows instead of removing them.
    if target.kind == Some(JoinKind::Left) {
        return None;
    }
    if !target.range.is_json() && identifiers.iter().any(|ident| !ident.is_base()) {
        return None;
    }
    Some(index)
}

fn contains_alias_ref(expr: &Expr) -> bool {
    matches!(expr.kind, ExprKind::AliasRef(_)) || expr.children().into_iter().any(contains_alias_ref)
}
