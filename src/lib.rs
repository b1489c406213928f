// rangeql - Federated range query execution
// Core library

pub mod config;
pub mod engine;
pub mod federation;
pub mod metrics;
pub mod observability;
pub mod query;

pub use config::{ConfigError, EngineConfig};
pub use engine::{ExecutionError, ExecutionResult, Parameters, ResultRow, ResultSet, Value};
pub use federation::{ExecutionMetadata, PaginationOutcome, QueryEngine};
pub use query::QueryPlan;
