//! TOML configuration for infratriage.
//!
//! Layered as: explicit `--config` path, then the `INFRATRIAGE_CONFIG`
//! environment variable, then compiled-in defaults. CLI flags override
//! individual fields after loading.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::engine::OrchestratorConfig;
use crate::problem::{ParseSeverityError, Severity};

pub const CONFIG_ENV: &str = "INFRATRIAGE_CONFIG";

/// Upper bound for `engine.stale_after_secs` (30 days).
pub const MAX_STALE_AFTER_SECS: u64 = 30 * 24 * 3600;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("{field}: {source}")]
    Severity {
        field: &'static str,
        #[source]
        source: ParseSeverityError,
    },

    #[error("backend url is required (set [backend].url or --prometheus-url)")]
    MissingUrl,

    #[error("invalid backend url: {0}")]
    InvalidUrl(String),

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("{field} must be at most {max} (got {value})")]
    OutOfRange {
        field: &'static str,
        value: u64,
        max: u64,
    },
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Load from `explicit`, else `$INFRATRIAGE_CONFIG`, else defaults.
    ///
    /// A path that was asked for but cannot be loaded is an error; silently
    /// falling back would hide a typo in CI.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            if !env_path.is_empty() {
                return Self::load(Path::new(&env_path));
            }
        }
        debug!("no config file given, using compiled-in defaults");
        Ok(Self::default())
    }

    /// Check everything that must hold before the orchestrator starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.report.min_severity()?;
        self.report.fail_on()?;

        let url = self.backend.url.as_deref().ok_or(ConfigError::MissingUrl)?;
        let parsed = reqwest::Url::parse(url).map_err(|e| ConfigError::InvalidUrl(e.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidUrl(format!(
                "must use http:// or https:// scheme, got {:?}",
                parsed.scheme()
            )));
        }
        if parsed.host_str().map_or(true, str::is_empty) {
            return Err(ConfigError::InvalidUrl("must include a host".into()));
        }

        if self.backend.timeout_secs == 0 {
            return Err(ConfigError::ZeroDuration("backend.timeout_secs"));
        }
        if self.engine.detector_timeout_secs == 0 {
            return Err(ConfigError::ZeroDuration("engine.detector_timeout_secs"));
        }
        if self.engine.refresh_interval_secs == 0 {
            return Err(ConfigError::ZeroDuration("engine.refresh_interval_secs"));
        }
        if self.engine.stale_after_secs == 0 {
            return Err(ConfigError::ZeroDuration("engine.stale_after_secs"));
        }
        if self.engine.stale_after_secs > MAX_STALE_AFTER_SECS {
            return Err(ConfigError::OutOfRange {
                field: "engine.stale_after_secs",
                value: self.engine.stale_after_secs,
                max: MAX_STALE_AFTER_SECS,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Prometheus base URL, e.g. `http://localhost:9090`.
    pub url: Option<String>,
    /// HTTP timeout for a single backend request (seconds).
    pub timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: 30,
        }
    }
}

impl BackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Client polling cadence (seconds). Advertised in the report metadata
    /// and `/api/v1/stats`; rule schedules use their own intervals.
    pub refresh_interval_secs: u64,
    /// Maximum concurrent rule executions; 0 = unbounded.
    pub max_concurrency: usize,
    /// Deadline for one rule execution (seconds).
    pub detector_timeout_secs: u64,
    /// Lookback window handed to rules (seconds).
    pub lookback_window_secs: u64,
    /// Evict problems not seen for this long (seconds).
    pub stale_after_secs: u64,
    /// Minimum spacing between backend health probes (seconds).
    pub health_check_interval_secs: u64,
    /// Also run eviction after failed rule cycles.
    pub evict_on_failure: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 10,
            max_concurrency: 0,
            detector_timeout_secs: 30,
            lookback_window_secs: 300,
            stale_after_secs: 60,
            health_check_interval_secs: 30,
            evict_on_failure: false,
        }
    }
}

impl EngineConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_concurrency: self.max_concurrency,
            detector_timeout: Duration::from_secs(self.detector_timeout_secs),
            lookback_window: Duration::from_secs(self.lookback_window_secs),
            stale_after: Duration::from_secs(self.stale_after_secs),
            health_check_interval: Duration::from_secs(self.health_check_interval_secs),
            evict_on_failure: self.evict_on_failure,
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// Lowest severity included in output.
    pub min_severity: String,
    /// Exit 1 if any reported problem is at or above this severity.
    pub fail_on: Option<String>,
    /// How long batch mode waits for the first detection results (seconds).
    pub first_cycle_wait_secs: u64,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            min_severity: "WARNING".to_string(),
            fail_on: None,
            first_cycle_wait_secs: 30,
        }
    }
}

impl ReportConfig {
    pub fn min_severity(&self) -> Result<Severity, ConfigError> {
        self.min_severity
            .parse()
            .map_err(|source| ConfigError::Severity {
                field: "min_severity",
                source,
            })
    }

    pub fn fail_on(&self) -> Result<Option<Severity>, ConfigError> {
        match self.fail_on.as_deref() {
            None | Some("") => Ok(None),
            Some(s) => s.parse().map(Some).map_err(|source| ConfigError::Severity {
                field: "fail_on",
                source,
            }),
        }
    }

    pub fn first_cycle_wait(&self) -> Duration {
        Duration::from_secs(self.first_cycle_wait_secs)
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default tracing filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON log lines instead of human-readable text.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
