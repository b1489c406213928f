// SPDX-License-Identifier: Apache-2.0

//! Federated range execution
//!
//! Fetches every range of a plan from its own source, relational tables
//! through generated SQL and JSON documents read whole, then combines the
//! row sets in memory with join strategies and the condition evaluator.

pub mod executor;
pub mod join;
pub mod json_path;
pub mod manager;
pub mod pagination;
pub mod planner;
pub mod types;

pub use join::{JoinKind, JoinStrategy};
pub use manager::QueryEngine;
pub use pagination::PaginationTransformer;
pub use types::{ExecutionMetadata, PaginationOutcome, RangeFetchResult};
