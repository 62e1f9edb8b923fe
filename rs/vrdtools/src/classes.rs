//! Class name tables for entities and relations.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Result, VrdError};

/// 2.5VRD relative distance labels.
pub const DEFAULT_DISTANCE_NAMES: [&str; 3] = ["further", "closer", "same"];

/// 2.5VRD occlusion labels.
pub const DEFAULT_OCCLUSION_NAMES: [&str; 4] =
    ["no occlusion", "occludes", "occluded by", "mutually occluded"];

/// Names for every class id used by a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationClasses {
    pub entities: Vec<String>,
    #[serde(default = "default_distance_names")]
    pub distances: Vec<String>,
    #[serde(default = "default_occlusion_names")]
    pub occlusions: Vec<String>,
}

fn default_distance_names() -> Vec<String> {
    DEFAULT_DISTANCE_NAMES.iter().map(|s| s.to_string()).collect()
}

fn default_occlusion_names() -> Vec<String> {
    DEFAULT_OCCLUSION_NAMES.iter().map(|s| s.to_string()).collect()
}

impl RelationClasses {
    /// Anonymous entity names (`entity_0`, `entity_1`, ...) with 2.5VRD relation names.
    pub fn numbered(num_entities: usize) -> Self {
        Self {
            entities: (0..num_entities).map(|i| format!("entity_{i}")).collect(),
            distances: default_distance_names(),
            occlusions: default_occlusion_names(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| VrdError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| VrdError::Json {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn entity_name(&self, id: usize) -> String {
        self.entities
            .get(id)
            .cloned()
            .unwrap_or_else(|| format!("entity_{id}"))
    }

    /// Reverse lookup used when reading prediction tables back.
    pub fn entity_id(&self, name: &str) -> Option<usize> {
        self.entities.iter().position(|e| e == name)
    }

    pub fn distance_name(&self, id: usize) -> &str {
        self.distances.get(id).map(String::as_str).unwrap_or("unknown")
    }

    pub fn occlusion_name(&self, id: usize) -> &str {
        self.occlusions.get(id).map(String::as_str).unwrap_or("unknown")
    }
}
