//! Problem snapshots and drift comparison.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::problem::Problem;

#[derive(Debug, Error)]
pub enum BaselineError {
    #[error("failed to access baseline {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed baseline {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// A saved set of problems.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Baseline {
    pub timestamp: DateTime<Utc>,
    pub problems: Vec<Problem>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Baseline {
    pub fn new(problems: Vec<Problem>, metadata: BTreeMap<String, String>) -> Self {
        Self {
            timestamp: Utc::now(),
            problems,
            metadata,
        }
    }

    /// Write the snapshot as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> Result<(), BaselineError> {
        let data = serde_json::to_vec_pretty(self).map_err(|source| BaselineError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, data).map_err(|source| BaselineError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), problems = self.problems.len(), "baseline saved");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, BaselineError> {
        let data = std::fs::read(path).map_err(|source| BaselineError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&data).map_err(|source| BaselineError::Json {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ComparisonSummary {
    pub new_count: usize,
    pub resolved_count: usize,
    pub unchanged_count: usize,
}

/// Every problem ID from either side, classified.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Comparison {
    /// In current, not in baseline.
    pub new: Vec<Problem>,
    /// In baseline, not in current.
    pub resolved: Vec<Problem>,
    /// In both; the current copy is kept.
    pub unchanged: Vec<Problem>,
    pub summary: ComparisonSummary,
}

impl Comparison {
    pub fn has_drift(&self) -> bool {
        !self.new.is_empty()
    }
}

/// Classify `current` against `baseline` by problem ID.
pub fn compare(current: &[Problem], baseline: &Baseline) -> Comparison {
    let baseline_ids: HashSet<&str> = baseline.problems.iter().map(|p| p.id.as_str()).collect();
    let current_ids: HashSet<&str> = current.iter().map(|p| p.id.as_str()).collect();

    let mut comp = Comparison::default();
    let mut seen = HashSet::new();
    for p in current {
        if !seen.insert(p.id.as_str()) {
            continue;
        }
        if baseline_ids.contains(p.id.as_str()) {
            comp.unchanged.push(p.clone());
        } else {
            comp.new.push(p.clone());
        }
    }

    let mut seen = HashSet::new();
    for p in &baseline.problems {
        if seen.insert(p.id.as_str()) && !current_ids.contains(p.id.as_str()) {
            comp.resolved.push(p.clone());
        }
    }

    comp.summary = ComparisonSummary {
        new_count: comp.new.len(),
        resolved_count: comp.resolved.len(),
        unchanged_count: comp.unchanged.len(),
    };
    comp
}
