// SPDX-License-Identifier: Apache-2.0

//! Engine configuration
//!
//! Loaded from a JSON file; every field has a default so partial files and
//! missing files both work. Environment overrides are applied last.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::engine::metadata::{EntityDefinition, StaticMetadata};
use crate::engine::sql_generator::{AnsiSqlGenerator, SqlDialect};
use crate::engine::traits::FsSourceReader;

pub const ENV_JSON_ROOT: &str = "RANGEQL_JSON_ROOT";
pub const ENV_QUERY_TIMEOUT_MS: &str = "RANGEQL_QUERY_TIMEOUT_MS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {message}")]
    Read { path: String, message: String },

    #[error("Failed to parse config {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Invalid value for {name}: {value}")]
    InvalidOverride { name: String, value: String },
}

fn default_query_timeout_ms() -> u64 {
    30_000
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Base directory for relative JSON source paths
    #[serde(default)]
    pub json_root: Option<PathBuf>,
    /// Dialect used by the bundled SQL generator
    #[serde(default)]
    pub dialect: SqlDialect,
    /// Caller-level timeout for `execute_plan_with_timeout`; 0 disables it
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
    /// Entity catalogue for the bundled metadata store
    #[serde(default)]
    pub entities: HashMap<String, EntityDefinition>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            json_root: None,
            dialect: SqlDialect::default(),
            query_timeout_ms: default_query_timeout_ms(),
            entities: HashMap::new(),
        }
    }
}

impl EngineConfig {
    /// Loads configuration from `path`, falling back to defaults when the
    /// file does not exist, then applies environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
            let config: EngineConfig =
                serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
                    path: path.display().to_string(),
                    message: e.to_string(),
                })?;
            info!("Loaded engine configuration from {:?}", path);
            config
        } else {
            debug!("No engine config file found at {:?}, using defaults", path);
            EngineConfig::default()
        };

        config.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Applies `RANGEQL_*` overrides obtained through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup(ENV_JSON_ROOT).filter(|v| !v.trim().is_empty()) {
            self.json_root = Some(PathBuf::from(root));
        }
        if let Some(raw) = lookup(ENV_QUERY_TIMEOUT_MS) {
            self.query_timeout_ms =
                raw.trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidOverride {
                        name: ENV_QUERY_TIMEOUT_MS.to_string(),
                        value: raw.clone(),
                    })?;
        }
        Ok(())
    }

    pub fn query_timeout(&self) -> Option<Duration> {
        (self.query_timeout_ms > 0).then(|| Duration::from_millis(self.query_timeout_ms))
    }

    pub fn metadata(&self) -> StaticMetadata {
        StaticMetadata::from(self.entities.clone())
    }

    pub fn sql_generator(&self) -> AnsiSqlGenerator {
        AnsiSqlGenerator::new(self.dialect)
    }

    pub fn source_reader(&self) -> FsSourceReader {
        match &self.json_root {
            Some(root) => FsSourceReader::with_root(root),
            None => FsSourceReader::new(),
        }
    }
}
