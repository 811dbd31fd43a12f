//! Per-structure configuration: backups, in-memory format, merge policy.
//!
//! Configuration is plain serde data so it can be loaded from JSON; unknown
//! structures fall back to `GridConfig::defaults`.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::value::InMemoryFormat;

/// Upper bound for `backup_count + async_backup_count`.
pub const MAX_BACKUP_COUNT: usize = 6;
/// Merge policy used when a structure does not name one.
pub const DEFAULT_MERGE_POLICY: &str = "put-if-absent";

/// Value semantics of a multimap key's collection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueCollectionType {
    /// Insertion ordered, duplicates allowed.
    #[default]
    List,
    /// Insertion ordered, equal values rejected.
    Set,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StructureConfig {
    /// Replicas that receive backups before the owner moves on.
    pub backup_count: usize,
    /// Replicas that receive fire-and-forget backups.
    pub async_backup_count: usize,
    pub in_memory_format: InMemoryFormat,
    pub value_collection_type: ValueCollectionType,
    /// Merge policy identifier, resolved by `MergePolicyRegistry`.
    pub merge_policy: String,
    pub statistics_enabled: bool,
}

impl Default for StructureConfig {
    fn default() -> Self {
        Self {
            backup_count: 1,
            async_backup_count: 0,
            in_memory_format: InMemoryFormat::Binary,
            value_collection_type: ValueCollectionType::List,
            merge_policy: DEFAULT_MERGE_POLICY.to_string(),
            statistics_enabled: true,
        }
    }
}

impl StructureConfig {
    pub fn total_backup_count(&self) -> usize {
        self.backup_count.saturating_add(self.async_backup_count)
    }

    pub fn with_backup_count(mut self, backup_count: usize) -> Self {
        self.backup_count = backup_count;
        self
    }

    pub fn with_async_backup_count(mut self, async_backup_count: usize) -> Self {
        self.async_backup_count = async_backup_count;
        self
    }

    pub fn with_in_memory_format(mut self, format: InMemoryFormat) -> Self {
        self.in_memory_format = format;
        self
    }

    pub fn with_value_collection_type(mut self, collection_type: ValueCollectionType) -> Self {
        self.value_collection_type = collection_type;
        self
    }

    pub fn with_merge_policy(mut self, policy: impl Into<String>) -> Self {
        self.merge_policy = policy.into();
        self
    }

    pub fn with_statistics_enabled(mut self, enabled: bool) -> Self {
        self.statistics_enabled = enabled;
        self
    }

    fn validate(&self, name: &str) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.total_backup_count() <= MAX_BACKUP_COUNT,
            "structure '{name}': backup_count ({}) + async_backup_count ({}) exceeds {MAX_BACKUP_COUNT}",
            self.backup_count,
            self.async_backup_count
        );
        anyhow::ensure!(
            !self.merge_policy.trim().is_empty(),
            "structure '{name}': merge_policy must not be empty"
        );
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub defaults: StructureConfig,
    pub structures: BTreeMap<String, StructureConfig>,
}

impl GridConfig {
    pub fn from_json_str(raw: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(raw).context("parse grid config json")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read grid config {}", path.display()))?;
        Self::from_json_str(&raw)
    }

    pub fn with_defaults(mut self, defaults: StructureConfig) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_structure(mut self, name: impl Into<String>, config: StructureConfig) -> Self {
        self.structures.insert(name.into(), config);
        self
    }

    /// Effective configuration for `name`.
    pub fn structure(&self, name: &str) -> &StructureConfig {
        self.structures.get(name).unwrap_or(&self.defaults)
    }

    /// Largest replica fan-out any structure needs; sizes each partition's replica set.
    pub fn max_backups(&self) -> usize {
        self.structures
            .values()
            .map(StructureConfig::total_backup_count)
            .chain(std::iter::once(self.defaults.total_backup_count()))
            .max()
            .unwrap_or(0)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.defaults.validate("<defaults>")?;
        for (name, structure) in &self.structures {
            structure.validate(name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_overrides_fall_back_to_defaults() {
        let config = GridConfig::from_json_str(
            r#"{
                "defaults": { "backup_count": 2 },
                "structures": {
                    "orders": { "merge_policy": "higher-hits", "in_memory_format": "object" }
                }
            }"#,
        )
        .expect("parse config");

        assert_eq!(config.structure("missing").backup_count, 2);
        let orders = config.structure("orders");
        assert_eq!(orders.merge_policy, "higher-hits");
        assert_eq!(orders.in_memory_format, InMemoryFormat::Object);
        // Per-structure entries start from StructureConfig::default, not from `defaults`.
        assert_eq!(orders.backup_count, 1);
        assert_eq!(config.max_backups(), 2);
    }

    #[test]
    fn rejects_too_many_backups() {
        let err = GridConfig::from_json_str(
            r#"{ "structures": { "c": { "backup_count": 4, "async_backup_count": 3 } } }"#,
        )
        .expect_err("7 backups must be rejected");
        assert!(err.to_string().contains("exceeds"), "unexpected error: {err}");
    }
}
