use crate::detect::{DetectError, Detector, Registry};
use crate::engine::health::{self, HealthStats, HealthWatchdog};
use crate::engine::notify::ChangeNotifier;
use crate::engine::store::{self, ProblemStore};
use crate::metrics::MetricsProvider;
use crate::problem::{Problem, Severity};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Shortest period a rule may be scheduled at.
const MIN_RULE_INTERVAL: Duration = Duration::from_millis(10);

/// Tuning knobs for [`Orchestrator`].
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum concurrent rule executions. 0 = unbounded.
    pub max_concurrency: usize,
    /// Deadline for a single rule execution.
    pub detector_timeout: Duration,
    /// Lookback window handed to every rule.
    pub lookback_window: Duration,
    /// Staleness threshold for eviction.
    pub stale_after: Duration,
    pub health_check_interval: Duration,
    pub health_probe_timeout: Duration,
    /// Run the eviction scan after failed cycles too. Off by default: a
    /// failed cycle leaves the store untouched.
    pub evict_on_failure: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 0,
            detector_timeout: Duration::from_secs(30),
            lookback_window: Duration::from_secs(300),
            stale_after: store::DEFAULT_STALE_AFTER,
            health_check_interval: health::DEFAULT_CHECK_INTERVAL,
            health_probe_timeout: health::DEFAULT_PROBE_TIMEOUT,
            evict_on_failure: false,
        }
    }
}

/// Runs every registered rule on its own schedule against one shared store.
///
/// Each rule gets its own task: run once immediately, then on every tick of
/// its interval until cancelled. A rule never overlaps with itself; if a run
/// overruns its period the next tick fires right away and the missed ones
/// are dropped. Failures stay inside the rule's own cycle.
pub struct Orchestrator {
    provider: Arc<dyn MetricsProvider>,
    registry: Registry,
    store: Arc<ProblemStore>,
    health: HealthWatchdog,
    notifier: Arc<ChangeNotifier>,
    limiter: Option<Semaphore>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn MetricsProvider>,
        registry: Registry,
        config: OrchestratorConfig,
    ) -> Self {
        let notifier = Arc::new(ChangeNotifier::new());
        let store = Arc::new(ProblemStore::new(config.stale_after, notifier.clone()));
        let limiter = (config.max_concurrency > 0).then(|| Semaphore::new(config.max_concurrency));
        let health = HealthWatchdog::new(config.health_check_interval, config.health_probe_timeout);

        Self {
            provider,
            registry,
            store,
            health,
            notifier,
            limiter,
            config,
        }
    }

    /// Run until `cancel` fires and every in-flight execution has returned.
    /// The change notifier is closed on return.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let detectors = self.registry.all().await;
        if detectors.is_empty() {
            warn!("no detection rules registered");
            self.notifier.close();
            return;
        }

        info!(
            rules = detectors.len(),
            max_concurrency = self.config.max_concurrency,
            timeout = ?self.config.detector_timeout,
            "orchestrator started"
        );

        let mut tasks = JoinSet::new();
        for detector in detectors {
            let this = Arc::clone(&self);
            let cancel = cancel.clone();
            tasks.spawn(async move { this.run_detector(detector, cancel).await });
        }

        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                error!(error = %e, "detection task aborted");
            }
        }

        self.notifier.close();
        info!("orchestrator stopped");
    }

    /// Spawn [`Orchestrator::run`] onto the runtime.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run(cancel))
    }

    async fn run_detector(&self, detector: Arc<dyn Detector>, cancel: CancellationToken) {
        let period = detector.interval().max(MIN_RULE_INTERVAL);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        debug!(rule = detector.name(), ?period, "rule loop started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                // The first tick completes immediately.
                _ = ticker.tick() => self.execute(detector.as_ref(), &cancel).await,
            }
        }
        debug!(rule = detector.name(), "rule loop stopped");
    }

    /// One detection cycle: limiter slot, throttled health probe, bounded
    /// rule call, then merge on success.
    async fn execute(&self, detector: &dyn Detector, cancel: &CancellationToken) {
        let _permit = match &self.limiter {
            Some(limiter) => tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                permit = limiter.acquire() => match permit {
                    Ok(permit) => Some(permit),
                    Err(_) => return,
                },
            },
            None => None,
        };

        self.health.maybe_probe(self.provider.as_ref()).await;

        let started = Instant::now();
        let timeout = self.config.detector_timeout;
        let result = match tokio::time::timeout(
            timeout,
            detector.detect(self.provider.as_ref(), self.config.lookback_window),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(DetectError::Timeout(timeout)),
        };

        match result {
            Ok(problems) => {
                self.health.record_success().await;
                let found = problems.len();
                let outcome = self.store.merge(problems).await;
                debug!(
                    rule = detector.name(),
                    found,
                    inserted = outcome.inserted,
                    evicted = outcome.evicted,
                    elapsed = ?started.elapsed(),
                    "detection cycle complete"
                );
            }
            Err(e) => {
                self.health.record_failure().await;
                warn!(rule = detector.name(), error = %e, "detection cycle failed");
                if self.config.evict_on_failure {
                    self.store.evict_stale_at(Utc::now()).await;
                }
            }
        }
    }

    /// Problems ranked by score, highest first.
    pub async fn problems(&self) -> Vec<Problem> {
        self.store.by_score().await
    }

    pub async fn problems_by_recency(&self) -> Vec<Problem> {
        self.store.by_recency().await
    }

    pub async fn problems_by_count(&self) -> Vec<Problem> {
        self.store.by_count().await
    }

    pub async fn summary(&self) -> BTreeMap<Severity, usize> {
        self.store.summary().await
    }

    /// Wait for the next change. Returns `false` once the orchestrator has
    /// stopped and no change is pending.
    pub async fn changed(&self) -> bool {
        self.notifier.changed().await
    }

    pub fn notifier(&self) -> &Arc<ChangeNotifier> {
        &self.notifier
    }

    pub fn store(&self) -> &Arc<ProblemStore> {
        &self.store
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Backend health and time of last check.
    pub async fn health(&self) -> (bool, Option<DateTime<Utc>>) {
        self.health.status().await
    }

    pub async fn health_stats(&self) -> HealthStats {
        self.health.stats().await
    }
}
