// SPDX-License-Identifier: Apache-2.0

//! DuckDB Backend
//!
//! Implements the `Backend` trait for DuckDB using the native `duckdb` crate.
//!
//! ## DuckDB Specifics
//!
//! - DuckDB is a file-based embedded OLAP database
//! - Supports `:memory:` for in-memory databases
//! - Placeholders are positional `?`
//!
//! ## Concurrency Model
//!
//! The `duckdb` crate provides a synchronous API, which matches the engine's
//! sequential range fetching. The `Connection` is `Send` but `!Sync`, so it
//! is protected by a `std::sync::Mutex`.

use std::sync::Mutex;
use std::time::Instant;

use ::duckdb::{params_from_iter, types::Value as DuckValue, Connection};
use tracing::debug;

use crate::engine::error::{BackendFailure, ExecutionError, ExecutionResult};
use crate::engine::traits::Backend;
use crate::engine::types::{ColumnInfo, QueryResult, Row, Value};

/// DuckDB backend over a single connection.
pub struct DuckDbBackend {
    /// The DuckDB connection, protected by a std Mutex (Connection is !Sync).
    conn: Mutex<Connection>,
    /// The file path to the database (or ":memory:").
    pub db_path: String,
}

impl DuckDbBackend {
    /// Opens a DuckDB database. `:memory:` opens an in-memory database.
    pub fn open(path: &str) -> ExecutionResult<Self> {
        let path = path.trim();
        Self::validate_path(path)?;

        let conn = if path == ":memory:" {
            Connection::open_in_memory()
                .map_err(|e| ExecutionError::backend(format!("Failed to open DuckDB in-memory: {e}")))?
        } else {
            Connection::open(path).map_err(|e| {
                ExecutionError::backend(format!("Failed to open DuckDB file '{path}': {e}"))
            })?
        };

        Ok(Self {
            conn: Mutex::new(conn),
            db_path: path.to_string(),
        })
    }

    pub fn open_in_memory() -> ExecutionResult<Self> {
        Self::open(":memory:")
    }

    fn validate_path(path: &str) -> ExecutionResult<()> {
        if path.is_empty() {
            return Err(ExecutionError::backend("DuckDB path cannot be empty."));
        }
        if path != ":memory:" && path.contains("://") {
            return Err(ExecutionError::backend(format!(
                "Invalid DuckDB path format: {path}"
            )));
        }
        Ok(())
    }

    /// Runs one or more statements without results (schema setup, fixtures).
    pub fn execute_batch(&self, sql: &str) -> ExecutionResult<()> {
        let conn = self.lock()?;
        conn.execute_batch(sql)
            .map_err(|e| ExecutionError::from(classify_error(e.to_string())))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, BackendFailure> {
        self.conn
            .lock()
            .map_err(|e| BackendFailure::new(format!("Failed to lock DuckDB connection: {e}")))
    }
}

// ==================== Type Conversion ====================

/// Converts an engine Value to a DuckDB Value for parameter binding.
fn value_to_duckdb(value: &Value) -> DuckValue {
    match value {
        Value::Null => DuckValue::Null,
        Value::Bool(b) => DuckValue::Boolean(*b),
        Value::Int(i) => DuckValue::BigInt(*i),
        Value::Float(f) => DuckValue::Double(*f),
        Value::Text(s) => DuckValue::Text(s.clone()),
        Value::Bytes(b) => DuckValue::Blob(b.clone()),
        Value::Json(j) => DuckValue::Text(j.to_string()),
        Value::Array(arr) => DuckValue::Text(serde_json::to_string(arr).unwrap_or_default()),
    }
}

/// Extracts a value from a DuckDB row and converts it to an engine Value.
fn duckdb_value_to_engine(row: &::duckdb::Row<'_>, idx: usize) -> Value {
    match row.get::<_, DuckValue>(idx) {
        Ok(DuckValue::Null) => return Value::Null,
        Ok(DuckValue::Boolean(b)) => return Value::Bool(b),
        Ok(DuckValue::TinyInt(i)) => return Value::Int(i as i64),
        Ok(DuckValue::SmallInt(i)) => return Value::Int(i as i64),
        Ok(DuckValue::Int(i)) => return Value::Int(i as i64),
        Ok(DuckValue::BigInt(i)) => return Value::Int(i),
        Ok(DuckValue::UTinyInt(i)) => return Value::Int(i as i64),
        Ok(DuckValue::USmallInt(i)) => return Value::Int(i as i64),
        Ok(DuckValue::UInt(i)) => return Value::Int(i as i64),
        Ok(DuckValue::HugeInt(i)) => {
            return i64::try_from(i)
                .map(Value::Int)
                .unwrap_or(Value::Float(i as f64))
        }
        Ok(DuckValue::Float(f)) => return Value::Float(f as f64),
        Ok(DuckValue::Double(f)) => return Value::Float(f),
        Ok(DuckValue::Text(s)) => return Value::Text(s),
        Ok(DuckValue::Blob(b)) => return Value::Bytes(b),
        _ => {}
    }

    // Decimals, temporal types and anything else DuckDB can cast
    if let Ok(Some(f)) = row.get::<_, Option<f64>>(idx) {
        return Value::Float(f);
    }
    if let Ok(Some(s)) = row.get::<_, Option<String>>(idx) {
        return Value::Text(s);
    }
    Value::Null
}

/// Classifies a DuckDB error message.
fn classify_error(msg: String) -> BackendFailure {
    let lower = msg.to_lowercase();
    if lower.contains("syntax") || lower.contains("parser") {
        BackendFailure::new(format!("syntax error: {msg}"))
    } else {
        BackendFailure::new(msg)
    }
}

// ==================== Backend Implementation ====================

impl Backend for DuckDbBackend {
    fn driver_id(&self) -> &'static str {
        "duckdb"
    }

    /// Executes a SELECT-style query and returns a QueryResult.
    ///
    /// NOTE: DuckDB crate requires that `column_name()` is called AFTER the statement
    /// has been executed (i.e., after iterating rows). We collect rows first, then
    /// extract column names.
    fn execute(&self, sql: &str, params: &[Value]) -> Result<QueryResult, BackendFailure> {
        let start = Instant::now();
        let conn = self.lock()?;
        let bind_values: Vec<DuckValue> = params.iter().map(value_to_duckdb).collect();

        let mut stmt = conn.prepare(sql).map_err(|e| classify_error(e.to_string()))?;

        let rows_iter = stmt
            .query_map(params_from_iter(bind_values.iter()), |row| {
                let col_count = row.as_ref().column_count();
                let values: Vec<Value> = (0..col_count)
                    .map(|i| duckdb_value_to_engine(row, i))
                    .collect();
                Ok(Row { values })
            })
            .map_err(|e| classify_error(e.to_string()))?;

        let mut rows = Vec::new();
        for row_result in rows_iter {
            rows.push(row_result.map_err(|e| BackendFailure::new(e.to_string()))?);
        }

        // After iteration, statement has been executed: column_count/column_name work
        let column_count = stmt.column_count();
        let columns: Vec<ColumnInfo> = (0..column_count)
            .map(|i| ColumnInfo {
                name: stmt
                    .column_name(i)
                    .map(|s| s.to_string())
                    .unwrap_or_else(|_| format!("col_{i}")),
                data_type: "VARCHAR".to_string(),
                nullable: true,
            })
            .collect();

        let execution_time_ms = start.elapsed().as_micros() as f64 / 1000.0;
        debug!(rows = rows.len(), execution_time_ms, "duckdb query finished");

        Ok(QueryResult {
            columns,
            rows,
            execution_time_ms,
        })
    }
}

// ==================== Tests ====================
