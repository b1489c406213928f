// SPDX-License-Identifier: Apache-2.0

//! Query plan model
//!
//! The validated plan handed to the engine, the per-range reference
//! collector and the condition evaluator that interprets plan expressions.

pub mod ast;
pub mod eval;
pub mod reference;

pub use ast::{
    AggregateFunc, ArithmeticOp, CompareOp, Expr, ExprKind, Identifier, JoinProperty, NodeId,
    QueryPlan, Range, RangeSource, SelectItem, SortDirection, SortItem, SortSpec,
    IN_VALUES_ARE_FINAL,
};
pub use eval::ConditionEvaluator;
pub use reference::{Reference, ReferenceContext};
