// SPDX-License-Identifier: Apache-2.0

//! Normalized error types for the rangeql execution engine
//!
//! Source, backend, join and evaluation failures are all mapped to
//! `ExecutionError` so callers get one error type regardless of which range
//! or strategy failed. Lower layers wrap errors with context instead of
//! discarding them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::federation::join::JoinKind;

/// Unified error type for all plan execution operations
#[derive(Debug, Error, Serialize, Deserialize)]
pub enum ExecutionError {
    #[error("Source not found: {path}: {message}")]
    SourceNotFound { path: String, message: String },

    #[error("Malformed source {path}: {message}")]
    MalformedSource { path: String, message: String },

    #[error("JSON path filter '{expression}' failed: {message}")]
    FilterError { expression: String, message: String },

    #[error("Backend error: {message}")]
    BackendError { message: String },

    #[error("{join} join requires a join condition")]
    MissingJoinCondition { join: JoinKind },

    #[error("Evaluation error: {message}")]
    EvaluationError { message: String },

    #[error("Invalid plan: {message}")]
    InvalidPlan { message: String },

    #[error("Plan execution timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("{context}: {source}")]
    Context {
        context: String,
        source: Box<ExecutionError>,
    },
}

impl ExecutionError {
    pub fn source_not_found(path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::SourceNotFound {
            path: path.into(),
            message: msg.into(),
        }
    }

    pub fn malformed_source(path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::MalformedSource {
            path: path.into(),
            message: msg.into(),
        }
    }

    pub fn filter(expression: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::FilterError {
            expression: expression.into(),
            message: msg.into(),
        }
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        Self::BackendError { message: msg.into() }
    }

    pub fn missing_join_condition(join: JoinKind) -> Self {
        Self::MissingJoinCondition { join }
    }

    pub fn evaluation(msg: impl Into<String>) -> Self {
        Self::EvaluationError { message: msg.into() }
    }

    pub fn invalid_plan(msg: impl Into<String>) -> Self {
        Self::InvalidPlan { message: msg.into() }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal { message: msg.into() }
    }

    /// Wraps this error with a description of what was being attempted.
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Returns the innermost error, skipping any `Context` layers.
    pub fn root(&self) -> &ExecutionError {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Result type alias for execution operations
pub type ExecutionResult<T> = Result<T, ExecutionError>;

/// Failure reported by a `SqlGenerator`
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct SqlGenerationError {
    pub message: String,
}

impl SqlGenerationError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self { message: msg.into() }
    }
}

/// Failure reported by a `Backend`
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct BackendFailure {
    pub message: String,
}

impl BackendFailure {
    pub fn new(msg: impl Into<String>) -> Self {
        Self { message: msg.into() }
    }
}

impl From<SqlGenerationError> for ExecutionError {
    fn from(err: SqlGenerationError) -> Self {
        ExecutionError::backend(format!("SQL generation failed: {}", err.message))
    }
}

impl From<BackendFailure> for ExecutionError {
    fn from(err: BackendFailure) -> Self {
        ExecutionError::backend(err.message)
    }
}

/// Adds context to the error side of an `ExecutionResult`.
pub trait ResultExt<T> {
    fn context<C, F>(self, f: F) -> ExecutionResult<T>
    where
        C: Into<String>,
        F: FnOnce() -> C;
}

impl<T> ResultExt<T> for ExecutionResult<T> {
    fn context<C, F>(self, f: F) -> ExecutionResult<T>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.map_err(|e| e.context(f()))
    }
}
