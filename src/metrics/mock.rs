//! In-memory provider for tests. Every hook is optional; unset hooks return
//! an empty result (or healthy).

use super::{Matrix, MetricsError, MetricsProvider, Vector};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

type InstantFn = Box<dyn Fn(&str, DateTime<Utc>) -> Result<Vector, MetricsError> + Send + Sync>;
type RangeFn = Box<dyn Fn(&str) -> Result<Matrix, MetricsError> + Send + Sync>;
type HealthFn = Box<dyn Fn() -> Result<(), MetricsError> + Send + Sync>;

#[derive(Default)]
pub struct MockProvider {
    instant: Option<InstantFn>,
    range: Option<RangeFn>,
    health: Option<HealthFn>,
    health_calls: AtomicUsize,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_instant<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, DateTime<Utc>) -> Result<Vector, MetricsError> + Send + Sync + 'static,
    {
        self.instant = Some(Box::new(f));
        self
    }

    pub fn with_range<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) -> Result<Matrix, MetricsError> + Send + Sync + 'static,
    {
        self.range = Some(Box::new(f));
        self
    }

    pub fn with_health<F>(mut self, f: F) -> Self
    where
        F: Fn() -> Result<(), MetricsError> + Send + Sync + 'static,
    {
        self.health = Some(Box::new(f));
        self
    }

    /// Number of times `health` has been called.
    pub fn health_calls(&self) -> usize {
        self.health_calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl MetricsProvider for MockProvider {
    async fn query_instant(&self, query: &str, at: DateTime<Utc>) -> Result<Vector, MetricsError> {
        match &self.instant {
            Some(f) => f(query, at),
            None => Ok(Vec::new()),
        }
    }

    async fn query_range(
        &self,
        query: &str,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
        _step: Duration,
    ) -> Result<Matrix, MetricsError> {
        match &self.range {
            Some(f) => f(query),
            None => Ok(Vec::new()),
        }
    }

    async fn health(&self) -> Result<(), MetricsError> {
        self.health_calls.fetch_add(1, Ordering::SeqCst);
        match &self.health {
            Some(f) => f(),
            None => Ok(()),
        }
    }
}
