// SPDX-License-Identifier: Apache-2.0

//! Range reference collection
//!
//! Walks the plan once per range and records which of the range's columns
//! are used, and where. Executors use the result to project only the columns
//! a query needs; pagination and null completion use it to know which keys a
//! row is expected to carry.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::ast::{Expr, ExprKind, NodeId, QueryPlan};

/// Syntactic position of a column usage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceContext {
    Select,
    Where,
    OrderBy,
    Aggregate,
    AggregateWhere,
}

/// One usage of a range's column
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    pub range: String,
    pub column: String,
    pub node: NodeId,
    pub context: ReferenceContext,
}

/// Per-pass traversal state. A fresh context is created for every range so
/// repeated or concurrent collections never share visited nodes.
struct TraversalContext<'a> {
    range: &'a str,
    visited: HashSet<NodeId>,
    references: Vec<Reference>,
}

impl<'a> TraversalContext<'a> {
    fn new(range: &'a str) -> Self {
        Self {
            range,
            visited: HashSet::new(),
            references: Vec::new(),
        }
    }

    fn walk(&mut self, plan: &QueryPlan, expr: &Expr, context: ReferenceContext) {
        if !self.visited.insert(expr.id) {
            return;
        }

        match &expr.kind {
            ExprKind::Identifier(ident) => {
                if ident.is_base() && ident.range == self.range {
                    self.references.push(Reference {
                        range: ident.range.clone(),
                        column: ident.column(),
                        node: expr.id,
                        context,
                    });
                }
            }
            ExprKind::AliasRef(alias) => {
                if let Some(item) = plan.select_by_alias(alias) {
                    self.walk(plan, &item.expr, context);
                }
            }
            ExprKind::Aggregate { arg, filter, .. } => {
                if let Some(arg) = arg {
                    self.walk(plan, arg, ReferenceContext::Aggregate);
                }
                if let Some(filter) = filter {
                    self.walk(plan, filter, ReferenceContext::AggregateWhere);
                }
            }
            _ => {
                for child in expr.children() {
                    self.walk(plan, child, context);
                }
            }
        }
    }

    /// Visits only the WHERE clauses of aggregate calls found in `expr`.
    fn walk_aggregate_filters(&mut self, plan: &QueryPlan, expr: &Expr) {
        if let ExprKind::Aggregate {
            filter: Some(filter),
            ..
        } = &expr.kind
        {
            self.walk(plan, filter, ReferenceContext::AggregateWhere);
        }
        for child in expr.children() {
            self.walk_aggregate_filters(plan, child);
        }
    }
}

/// Collects the references of one range without modifying the plan.
pub fn collect(plan: &QueryPlan, range: &str) -> Vec<Reference> {
    let mut ctx = TraversalContext::new(range);

    let sort_items = plan.sort.iter().flat_map(|s| s.items.iter());

    for item in &plan.values {
        ctx.walk_aggregate_filters(plan, &item.expr);
    }
    for item in sort_items.clone() {
        ctx.walk_aggregate_filters(plan, &item.expr);
    }

    if let Some(conditions) = &plan.conditions {
        ctx.walk(plan, conditions, ReferenceContext::Where);
    }
    for join in plan.ranges.iter().filter_map(|r| r.join.as_ref()) {
        ctx.walk(plan, &join.condition, ReferenceContext::Where);
    }

    for item in &plan.values {
        ctx.walk(plan, &item.expr, ReferenceContext::Select);
    }

    for item in sort_items {
        ctx.walk(plan, &item.expr, ReferenceContext::OrderBy);
    }

    ctx.references
}

/// Replaces every range's references with a fresh collection.
pub fn annotate(plan: &mut QueryPlan) {
    let collected: Vec<Vec<Reference>> = plan
        .ranges
        .iter()
        .map(|range| collect(plan, &range.name))
        .collect();

    for (range, references) in plan.ranges.iter_mut().zip(collected) {
        range.references = references;
    }
}
