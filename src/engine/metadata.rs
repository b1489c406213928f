// SPDX-License-Identifier: Apache-2.0

//! In-memory entity metadata
//!
//! A fixed entity catalogue, usually loaded from the engine configuration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::engine::traits::EntityMetadata;

/// Description of one entity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityDefinition {
    pub table: String,
    pub primary_key: Vec<String>,
    pub view: bool,
}

impl EntityDefinition {
    pub fn table(table: impl Into<String>, primary_key: &[&str]) -> Self {
        Self {
            table: table.into(),
            primary_key: primary_key.iter().map(|c| c.to_string()).collect(),
            view: false,
        }
    }

    pub fn view(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            primary_key: Vec::new(),
            view: true,
        }
    }
}

/// `EntityMetadata` over a map of entity definitions
#[derive(Debug, Clone, Default)]
pub struct StaticMetadata {
    entities: HashMap<String, EntityDefinition>,
}

impl StaticMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity: impl Into<String>, definition: EntityDefinition) -> Self {
        self.entities.insert(entity.into(), definition);
        self
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl From<HashMap<String, EntityDefinition>> for StaticMetadata {
    fn from(entities: HashMap<String, EntityDefinition>) -> Self {
        Self { entities }
    }
}

impl EntityMetadata for StaticMetadata {
    fn table_name(&self, entity: &str) -> Option<String> {
        self.entities.get(entity).map(|d| d.table.clone())
    }

    fn primary_key(&self, entity: &str) -> Vec<String> {
        self.entities
            .get(entity)
            .map(|d| d.primary_key.clone())
            .unwrap_or_default()
    }

    fn is_view(&self, entity: &str) -> bool {
        self.entities.get(entity).is_some_and(|d| d.view)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_tables_and_keys() {
        let metadata = StaticMetadata::new()
            .with_entity("User", EntityDefinition::table("users", &["id"]))
            .with_entity("Report", EntityDefinition::view("monthly_report"));

        assert_eq!(metadata.table_name("User").as_deref(), Some("users"));
        assert_eq!(metadata.primary_key("User"), vec!["id".to_string()]);
        assert!(metadata.is_view("Report"));
        assert!(metadata.primary_key("Report").is_empty());
        assert_eq!(metadata.table_name("Nope"), None);
    }

    #[test]
    fn definitions_deserialize_with_defaults() {
        let def: EntityDefinition = serde_json::from_str(r#"{"table": "orders"}"#).unwrap();
        assert_eq!(def.table, "orders");
        assert!(def.primary_key.is_empty());
        assert!(!def.view);
    }
}
