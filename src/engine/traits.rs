//! Collaborator traits
//!
//! The engine never talks to a database, a dialect or the filesystem
//! directly. Each of those is consumed through one of the traits below so
//! callers can plug in their own driver, generator or metadata store.

use std::io;
use std::path::{Path, PathBuf};

use crate::engine::error::{BackendFailure, SqlGenerationError};
use crate::engine::sql_generator::{GeneratedSql, RangeRequest};
use crate::engine::types::{Parameters, QueryResult, Value};

/// A relational backend able to run generated SQL
///
/// Implementations are synchronous; the engine already runs on a blocking
/// worker when a timeout is requested.
pub trait Backend: Send + Sync {
    /// Returns the unique identifier for this backend (e.g., "duckdb")
    fn driver_id(&self) -> &'static str;

    /// Executes `sql` with positional `params` bound in order.
    fn execute(&self, sql: &str, params: &[Value]) -> Result<QueryResult, BackendFailure>;
}

/// Turns a per-range request into SQL text for one dialect
pub trait SqlGenerator: Send + Sync {
    fn to_sql(
        &self,
        request: &RangeRequest<'_>,
        parameters: &Parameters,
    ) -> Result<GeneratedSql, SqlGenerationError>;
}

/// Raw byte access to JSON sources
pub trait SourceReader: Send + Sync {
    fn read(&self, path: &str) -> io::Result<Vec<u8>>;
}

/// Entity to table mapping and key information
pub trait EntityMetadata: Send + Sync {
    /// Table backing `entity`, or `None` when the entity is unknown.
    fn table_name(&self, entity: &str) -> Option<String>;

    /// Primary key columns of `entity`, in key order. Empty when unknown.
    fn primary_key(&self, entity: &str) -> Vec<String>;

    /// Whether `entity` is backed by a view rather than a table.
    fn is_view(&self, _entity: &str) -> bool {
        false
    }
}

/// Reads JSON sources from the local filesystem.
///
/// Relative paths are resolved against `root` when one is set.
#[derive(Debug, Clone, Default)]
pub struct FsSourceReader {
    root: Option<PathBuf>,
}

impl FsSourceReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let candidate = Path::new(path);
        match &self.root {
            Some(root) if candidate.is_relative() => root.join(candidate),
            _ => candidate.to_path_buf(),
        }
    }
}

impl SourceReader for FsSourceReader {
    fn read(&self, path: &str) -> io::Result<Vec<u8>> {
        std::fs::read(self.resolve(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fs_reader_resolves_relative_paths_against_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("people.json"), b"[]").unwrap();

        let reader = FsSourceReader::with_root(dir.path());
        assert_eq!(reader.read("people.json").unwrap(), b"[]");

        let absolute = dir.path().join("people.json");
        let plain = FsSourceReader::new();
        assert_eq!(plain.read(absolute.to_str().unwrap()).unwrap(), b"[]");

        let err = reader.read("missing.json").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
