//! Batch-mode reports and CI gating.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::baseline::Comparison;
use crate::config::ConfigError;
use crate::metrics::MetricsError;
use crate::problem::{Problem, Severity};

/// Process exit codes for the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Ok,
    /// Severity gate tripped or baseline drift found.
    Gate,
    InvalidConfig,
    Runtime,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Ok => 0,
            ExitStatus::Gate => 1,
            ExitStatus::InvalidConfig => 2,
            ExitStatus::Runtime => 3,
        }
    }

    /// Exit status for a run that ended in `err`: bad input is a
    /// configuration error, everything else a runtime failure.
    pub fn for_error(err: &anyhow::Error) -> Self {
        if err.downcast_ref::<ConfigError>().is_some() {
            return ExitStatus::InvalidConfig;
        }
        if let Some(MetricsError::InvalidUrl { .. }) = err.downcast_ref::<MetricsError>() {
            return ExitStatus::InvalidConfig;
        }
        ExitStatus::Runtime
    }
}

/// Keep only problems at or above `min`.
pub fn filter_min_severity(problems: Vec<Problem>, min: Severity) -> Vec<Problem> {
    problems.into_iter().filter(|p| p.severity.at_least(min)).collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportMetadata {
    pub prometheus_url: String,
    pub timestamp: DateTime<Utc>,
    pub refresh_interval: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReportSummary {
    pub total_problems: usize,
    pub fatal: usize,
    pub critical: usize,
    pub warning: usize,
}

impl ReportSummary {
    pub fn from_problems(problems: &[Problem]) -> Self {
        let mut summary = Self {
            total_problems: problems.len(),
            ..Default::default()
        };
        for p in problems {
            match p.severity {
                Severity::Fatal => summary.fatal += 1,
                Severity::Critical => summary.critical += 1,
                Severity::Warning => summary.warning += 1,
            }
        }
        summary
    }
}

/// The JSON document printed by `infratriage monitor`.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub metadata: ReportMetadata,
    pub summary: ReportSummary,
    pub problems: Vec<Problem>,
}

impl Report {
    pub fn new(metadata: ReportMetadata, problems: Vec<Problem>) -> Self {
        Self {
            summary: ReportSummary::from_problems(&problems),
            metadata,
            problems,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Write the report to `path`, replacing any existing file. On unix the
    /// file is owner read/write only.
    pub fn export(&self, path: &Path) -> anyhow::Result<()> {
        let json = self.to_json()?;

        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options
            .open(path)
            .with_context(|| format!("failed to open export file {}", path.display()))?;

        // `mode` only applies on creation; tighten a file that already existed.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(std::fs::Permissions::from_mode(0o600))
                .with_context(|| format!("failed to set permissions on {}", path.display()))?;
        }

        file.write_all(json.as_bytes())
            .and_then(|()| file.write_all(b"\n"))
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DriftMetadata {
    pub prometheus_url: String,
    pub timestamp: DateTime<Utc>,
    pub baseline_time: DateTime<Utc>,
}

/// Printed instead of [`Report`] when comparing against a baseline.
#[derive(Debug, Clone, Serialize)]
pub struct DriftReport {
    pub metadata: DriftMetadata,
    pub comparison: Comparison,
}

/// Whether any problem is at or above `threshold`.
pub fn gate_tripped(problems: &[Problem], threshold: Option<Severity>) -> bool {
    match threshold {
        Some(t) => problems.iter().any(|p| p.severity.at_least(t)),
        None => false,
    }
}

/// Exit status for a plain report run.
pub fn evaluate_gate(problems: &[Problem], fail_on: Option<Severity>) -> ExitStatus {
    if gate_tripped(problems, fail_on) {
        ExitStatus::Gate
    } else {
        ExitStatus::Ok
    }
}

/// Exit status for a baseline comparison run.
pub fn evaluate_drift(comparison: &Comparison, fail_on_drift: bool) -> ExitStatus {
    if fail_on_drift && comparison.has_drift() {
        ExitStatus::Gate
    } else {
        ExitStatus::Ok
    }
}

pub fn severity_counts(summary: &BTreeMap<Severity, usize>) -> ReportSummary {
    let get = |s| summary.get(&s).copied().unwrap_or(0);
    ReportSummary {
        total_problems: summary.values().sum(),
        fatal: get(Severity::Fatal),
        critical: get(Severity::Critical),
        warning: get(Severity::Warning),
    }
}
