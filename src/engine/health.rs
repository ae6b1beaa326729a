//! Backend health tracking.
//!
//! Health flips on every rule outcome. The explicit reachability probe is
//! throttled: it runs only when nothing has touched `last_check` within the
//! check interval, no matter how many rules cycle in that window.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::metrics::MetricsProvider;

pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Point-in-time copy of the watchdog counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthStats {
    pub healthy: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub last_successful_query: Option<DateTime<Utc>>,
    pub query_count: u64,
    pub error_count: u64,
    /// `error_count / query_count`, 0 when no queries have run.
    pub error_rate: f64,
}

struct HealthState {
    healthy: bool,
    last_check: Option<DateTime<Utc>>,
    /// Monotonic twin of `last_check` used for throttling.
    last_check_at: Option<Instant>,
    last_successful_query: Option<DateTime<Utc>>,
    query_count: u64,
    error_count: u64,
}

pub struct HealthWatchdog {
    state: RwLock<HealthState>,
    check_interval: Duration,
    probe_timeout: Duration,
}

impl HealthWatchdog {
    pub fn new(check_interval: Duration, probe_timeout: Duration) -> Self {
        Self {
            state: RwLock::new(HealthState {
                healthy: true,
                last_check: None,
                last_check_at: None,
                last_successful_query: None,
                query_count: 0,
                error_count: 0,
            }),
            check_interval,
            probe_timeout,
        }
    }

    /// Probe the backend unless a check happened within the check interval.
    ///
    /// Returns the probe result, or `None` if the probe was throttled.
    pub async fn maybe_probe(&self, provider: &dyn MetricsProvider) -> Option<bool> {
        {
            // Claim the slot before probing so concurrent callers skip.
            let mut state = self.state.write().await;
            if let Some(at) = state.last_check_at {
                if at.elapsed() < self.check_interval {
                    return None;
                }
            }
            state.last_check_at = Some(Instant::now());
        }

        let healthy = match tokio::time::timeout(self.probe_timeout, provider.health()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(error = %e, "backend health check failed");
                false
            }
            Err(_) => {
                warn!(timeout = ?self.probe_timeout, "backend health check timed out");
                false
            }
        };

        let mut state = self.state.write().await;
        state.healthy = healthy;
        state.last_check = Some(Utc::now());
        state.last_check_at = Some(Instant::now());
        debug!(healthy, "backend health probed");
        Some(healthy)
    }

    /// Record a successful rule query.
    pub async fn record_success(&self) {
        let now = Utc::now();
        let mut state = self.state.write().await;
        state.query_count += 1;
        state.healthy = true;
        state.last_check = Some(now);
        state.last_check_at = Some(Instant::now());
        state.last_successful_query = Some(now);
    }

    /// Record a failed rule query.
    pub async fn record_failure(&self) {
        let mut state = self.state.write().await;
        state.query_count += 1;
        state.error_count += 1;
        state.healthy = false;
        state.last_check = Some(Utc::now());
        state.last_check_at = Some(Instant::now());
    }

    pub async fn status(&self) -> (bool, Option<DateTime<Utc>>) {
        let state = self.state.read().await;
        (state.healthy, state.last_check)
    }

    pub async fn stats(&self) -> HealthStats {
        let state = self.state.read().await;
        let error_rate = if state.query_count > 0 {
            state.error_count as f64 / state.query_count as f64
        } else {
            0.0
        };
        HealthStats {
            healthy: state.healthy,
            last_check: state.last_check,
            last_successful_query: state.last_successful_query,
            query_count: state.query_count,
            error_count: state.error_count,
            error_rate,
        }
    }
}

impl Default for HealthWatchdog {
    fn default() -> Self {
        Self::new(DEFAULT_CHECK_INTERVAL, DEFAULT_PROBE_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{MetricsError, MockProvider};

    #[tokio::test]
    async fn test_starts_healthy_with_zero_error_rate() {
        let wd = HealthWatchdog::default();
        let stats = wd.stats().await;
        assert!(stats.healthy);
        assert_eq!(stats.query_count, 0);
        assert_eq!(stats.error_rate, 0.0);
        assert!(stats.last_check.is_none());
    }

    #[tokio::test]
    async fn test_error_rate() {
        let wd = HealthWatchdog::default();
        wd.record_success().await;
        wd.record_failure().await;
        wd.record_success().await;
        wd.record_failure().await;

        let stats = wd.stats().await;
        assert_eq!(stats.query_count, 4);
        assert_eq!(stats.error_count, 2);
        assert!((stats.error_rate - 0.5).abs() < f64::EPSILON);
        assert!(!stats.healthy);
        assert!(stats.last_successful_query.is_some());
    }

    #[tokio::test]
    async fn test_health_flips_with_outcomes() {
        let wd = HealthWatchdog::default();
        wd.record_failure().await;
        assert!(!wd.status().await.0);
        wd.record_success().await;
        assert!(wd.status().await.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_is_throttled() {
        let provider = MockProvider::new();
        let wd = HealthWatchdog::default();

        assert_eq!(wd.maybe_probe(&provider).await, Some(true));
        assert_eq!(wd.maybe_probe(&provider).await, None);
        assert_eq!(wd.maybe_probe(&provider).await, None);
        assert_eq!(provider.health_calls(), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(wd.maybe_probe(&provider).await, Some(true));
        assert_eq!(provider.health_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rule_outcomes_reset_throttle() {
        let provider = MockProvider::new();
        let wd = HealthWatchdog::default();

        wd.record_success().await;
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(wd.maybe_probe(&provider).await, None);
        assert_eq!(provider.health_calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_probe_marks_unhealthy() {
        let provider =
            MockProvider::new().with_health(|| Err(MetricsError::Unavailable("refused".into())));
        let wd = HealthWatchdog::default();

        assert_eq!(wd.maybe_probe(&provider).await, Some(false));
        let stats = wd.stats().await;
        assert!(!stats.healthy);
        // Probes are not queries.
        assert_eq!(stats.query_count, 0);
    }
}
