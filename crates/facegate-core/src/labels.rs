//! Class index → identity name lookup.
//!
//! The built-in map matches the shipped classifier. A replacement can be
//! loaded from a TOML file of `[[label]]` tables.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Name reported for a class index the map does not cover.
pub const UNKNOWN_LABEL: &str = "Unknown";

const DEFAULT_LABELS: [&str; 4] = ["Dominguezz", "Johan", "Rayleen", "Rhys"];

#[derive(Error, Debug)]
pub enum LabelMapError {
    #[error("labels file not found: {0}")]
    NotFound(String),
    #[error("cannot read labels file: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad labels TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("duplicate label index {0}")]
    DuplicateIndex(usize),
    #[error("labels file defines no labels")]
    Empty,
}

#[derive(Debug, Deserialize)]
struct LabelsFile {
    #[serde(default)]
    label: Vec<LabelEntry>,
}

#[derive(Debug, Deserialize)]
struct LabelEntry {
    index: usize,
    name: String,
}

/// Immutable class index → name map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMap {
    names: BTreeMap<usize, String>,
}

impl Default for LabelMap {
    fn default() -> Self {
        Self {
            names: DEFAULT_LABELS
                .iter()
                .enumerate()
                .map(|(i, n)| (i, n.to_string()))
                .collect(),
        }
    }
}

impl LabelMap {
    pub fn load(path: &str) -> Result<Self, LabelMapError> {
        if !Path::new(path).exists() {
            return Err(LabelMapError::NotFound(path.to_string()));
        }
        let map = Self::from_toml(&std::fs::read_to_string(path)?)?;
        tracing::info!(path, labels = map.len(), "loaded label map");
        Ok(map)
    }

    pub fn from_toml(src: &str) -> Result<Self, LabelMapError> {
        let file: LabelsFile = toml::from_str(src)?;
        if file.label.is_empty() {
            return Err(LabelMapError::Empty);
        }

        let mut names = BTreeMap::new();
        for entry in file.label {
            if names.insert(entry.index, entry.name).is_some() {
                return Err(LabelMapError::DuplicateIndex(entry.index));
            }
        }
        Ok(Self { names })
    }

    /// Name for `index`, or [`UNKNOWN_LABEL`].
    pub fn name(&self, index: usize) -> &str {
        self.names.get(&index).map(String::as_str).unwrap_or(UNKNOWN_LABEL)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
