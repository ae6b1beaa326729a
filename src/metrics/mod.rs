//! Metrics backend abstraction.
//!
//! Detectors only ever see a `&dyn MetricsProvider`; the Prometheus HTTP
//! client and the in-memory mock both implement it.

pub mod mock;
pub mod prometheus;

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

pub use self::mock::MockProvider;
pub use self::prometheus::PrometheusClient;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("backend returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("query failed ({error_type}): {message}")]
    Api { error_type: String, message: String },

    #[error("unexpected result type: expected {expected}, got {actual}")]
    UnexpectedResult {
        expected: &'static str,
        actual: String,
    },

    #[error("invalid backend url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// One labelled value from an instant query.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Sample {
    pub labels: BTreeMap<String, String>,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl Sample {
    pub fn new(labels: &[(&str, &str)], value: f64) -> Self {
        Self {
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            value,
            timestamp: Utc::now(),
        }
    }

    /// Label value, or the empty string when absent.
    pub fn label(&self, name: &str) -> &str {
        self.labels.get(name).map(String::as_str).unwrap_or("")
    }
}

/// One labelled series from a range query.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Series {
    pub labels: BTreeMap<String, String>,
    pub points: Vec<(DateTime<Utc>, f64)>,
}

pub type Vector = Vec<Sample>;
pub type Matrix = Vec<Series>;

/// Backend-agnostic metrics access.
#[async_trait::async_trait]
pub trait MetricsProvider: Send + Sync {
    /// Evaluate `query` at a single instant.
    async fn query_instant(&self, query: &str, at: DateTime<Utc>) -> Result<Vector, MetricsError>;

    /// Evaluate `query` over `[start, end]` at `step` resolution.
    async fn query_range(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Duration,
    ) -> Result<Matrix, MetricsError>;

    /// Check that the backend is reachable.
    async fn health(&self) -> Result<(), MetricsError>;
}
