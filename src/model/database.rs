//! Model database.
//!
//! Per-model metadata the scheduler and the runners rely on: input/output
//! sizes, the measured per-item forward latency used for duty-cycle
//! budgeting, the prefix depth for shared-prefix families, and the declared
//! suffix heads of `tf_share` trunks. Databases are loaded from a TOML file
//! in production and built in code by tests.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("failed to read model database {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse model database: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("duplicate model entry: {0}")]
    DuplicateEntry(String),
}

/// Execution profile of one model.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelProfile {
    pub input_size: usize,
    pub output_size: usize,
    /// Measured forward latency per batch item, microseconds.
    pub forward_latency_us: u64,
}

/// One model database entry.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelEntry {
    pub framework: String,
    pub model_name: String,
    #[serde(flatten)]
    pub profile: ModelProfile,
    /// Number of input-side layers shareable with sibling models.
    #[serde(default)]
    pub prefix_length: u32,
    /// Suffix heads declared by a `tf_share` trunk.
    #[serde(default)]
    pub suffix_models: BTreeSet<String>,
}

#[derive(Debug, Deserialize)]
struct DatabaseFile {
    #[serde(rename = "model", default)]
    models: Vec<ModelEntry>,
}

/// In-memory model database keyed by model name.
#[derive(Debug, Default)]
pub struct ModelDatabase {
    entries: HashMap<String, ModelEntry>,
}

impl ModelDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: ModelEntry) {
        self.entries.insert(entry.model_name.clone(), entry);
    }

    pub fn get(&self, model_name: &str) -> Option<&ModelEntry> {
        self.entries.get(model_name)
    }

    /// Look up a `tf_share` trunk entry by name.
    pub fn tf_share_info(&self, model_name: &str) -> Option<&ModelEntry> {
        self.entries
            .get(model_name)
            .filter(|e| e.framework == "tf_share")
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn from_toml_str(text: &str) -> Result<Self, DatabaseError> {
        let file: DatabaseFile = toml::from_str(text)?;
        let mut db = Self::new();
        for entry in file.models {
            if db.entries.contains_key(&entry.model_name) {
                return Err(DatabaseError::DuplicateEntry(entry.model_name));
            }
            db.insert(entry);
        }
        Ok(db)
    }

    pub fn load(path: &Path) -> Result<Self, DatabaseError> {
        let text = std::fs::read_to_string(path).map_err(|source| DatabaseError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[[model]]
framework = "tensorflow"
model_name = "resnet50"
input_size = 64
output_size = 10
forward_latency_us = 2000
prefix_length = 4

[[model]]
framework = "tf_share"
model_name = "shared_trunk"
input_size = 64
output_size = 8
forward_latency_us = 3000
suffix_models = ["heads_a", "heads_b"]
"#;

    #[test]
    fn parses_toml_entries() {
        let db = ModelDatabase::from_toml_str(SAMPLE).unwrap();
        assert_eq!(db.len(), 2);
        let entry = db.get("resnet50").unwrap();
        assert_eq!(entry.profile.output_size, 10);
        assert_eq!(entry.prefix_length, 4);
    }

    #[test]
    fn tf_share_lookup_requires_trunk_framework() {
        let db = ModelDatabase::from_toml_str(SAMPLE).unwrap();
        assert!(db.tf_share_info("shared_trunk").is_some());
        assert!(db.tf_share_info("resnet50").is_none());
        let trunk = db.tf_share_info("shared_trunk").unwrap();
        assert!(trunk.suffix_models.contains("heads_a"));
    }

    #[test]
    fn duplicate_entries_rejected() {
        let doubled = format!("{SAMPLE}{SAMPLE}");
        assert!(matches!(
            ModelDatabase::from_toml_str(&doubled),
            Err(DatabaseError::DuplicateEntry(_))
        ));
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let db = ModelDatabase::load(&path).unwrap();
        assert_eq!(db.len(), 2);

        assert!(matches!(
            ModelDatabase::load(&dir.path().join("missing.toml")),
            Err(DatabaseError::Read { .. })
        ));
    }
}
