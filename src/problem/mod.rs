//! The unified problem record shared by detectors, the store, and every
//! presentation layer.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Base score per severity tier.
const SCORE_FATAL: f64 = 100.0;
const SCORE_CRITICAL: f64 = 50.0;
const SCORE_WARNING: f64 = 10.0;

/// Per-entity blast radius weight applied to the base score.
const BLAST_RADIUS_WEIGHT: f64 = 0.1;

/// Persistence is normalized to hours for scoring.
const SECONDS_PER_HOUR: f64 = 3600.0;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid severity: {0} (must be WARNING, CRITICAL, or FATAL)")]
pub struct ParseSeverityError(pub String);

/// Urgency of a problem. Variants are declared in ascending order so the
/// derived `Ord` matches severity ranking.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    /// Anomaly detected, no immediate impact.
    #[default]
    Warning,
    /// Degraded performance, risk of failure.
    Critical,
    /// Service down or data loss.
    Fatal,
}

impl Severity {
    pub const ALL: [Severity; 3] = [Severity::Fatal, Severity::Critical, Severity::Warning];

    /// Base weight used by [`Problem::score`].
    pub fn weight(self) -> f64 {
        match self {
            Severity::Fatal => SCORE_FATAL,
            Severity::Critical => SCORE_CRITICAL,
            Severity::Warning => SCORE_WARNING,
        }
    }

    /// True if `self` is at least as severe as `threshold`.
    pub fn at_least(self, threshold: Severity) -> bool {
        self >= threshold
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Fatal => "FATAL",
            Severity::Critical => "CRITICAL",
            Severity::Warning => "WARNING",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = ParseSeverityError;

    /// Case-insensitive parse.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "WARNING" => Ok(Severity::Warning),
            "CRITICAL" => Ok(Severity::Critical),
            "FATAL" => Ok(Severity::Fatal),
            _ => Err(ParseSeverityError(s.to_string())),
        }
    }
}

/// A unified infrastructure issue.
///
/// `id` is derived from entity and issue type and is the only key used for
/// deduplication. Temporal fields (`first_seen`, `last_seen`, `count`,
/// `persistence`) are owned by the problem store; detectors leave them at
/// their defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Problem {
    // Identity
    pub id: String,
    /// e.g. `namespace/pod/container`, `node-1:/var`.
    pub entity: String,
    pub entity_type: String,
    #[serde(rename = "type")]
    pub issue_type: String,

    // Classification
    pub severity: Severity,
    pub title: String,
    pub message: String,

    // Temporal
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub count: u64,

    // Impact
    pub blast_radius: u32,
    /// Seconds between `first_seen` and `last_seen`.
    pub persistence: f64,

    // Context
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Latest metric snapshot only.
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub hint: String,
}

impl Problem {
    /// Build the stable identifier for an entity and issue suffix.
    pub fn make_id(entity: &str, suffix: &str) -> String {
        format!("{}/{}", entity, suffix)
    }

    /// Importance used for ranking.
    ///
    /// `weight(severity) * (1 + blast_radius * 0.1) * (1 + persistence / 3600)`
    pub fn score(&self) -> f64 {
        let base = self.severity.weight();
        let blast = 1.0 + f64::from(self.blast_radius) * BLAST_RADIUS_WEIGHT;
        let persistence = 1.0 + self.persistence / SECONDS_PER_HOUR;
        base * blast * persistence
    }

    /// Recompute `persistence` from the observation window.
    pub fn update_persistence(&mut self) {
        let elapsed = self.last_seen - self.first_seen;
        self.persistence = elapsed.num_milliseconds() as f64 / 1000.0;
    }
}
