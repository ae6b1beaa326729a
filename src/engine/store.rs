//! The shared set of active problems.
//!
//! All mutation goes through [`ProblemStore::merge_at`] under a single write
//! lock. Readers get deep copies, never references into the map.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::engine::notify::ChangeNotifier;
use crate::problem::{Problem, Severity};

/// Problems not re-detected within this window are evicted. Roughly twice the
/// fastest rule interval, so two consecutive misses are tolerated.
pub const DEFAULT_STALE_AFTER: std::time::Duration = std::time::Duration::from_secs(60);

/// What a single merge pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeOutcome {
    pub inserted: usize,
    pub updated: usize,
    pub evicted: usize,
}

impl MergeOutcome {
    pub fn changed(&self) -> bool {
        self.inserted + self.updated + self.evicted > 0
    }
}

pub struct ProblemStore {
    problems: RwLock<HashMap<String, Problem>>,
    /// `None` when the window is too large to represent; nothing is evicted.
    stale_after: Option<Duration>,
    notifier: Arc<ChangeNotifier>,
}

impl ProblemStore {
    pub fn new(stale_after: std::time::Duration, notifier: Arc<ChangeNotifier>) -> Self {
        Self {
            problems: RwLock::new(HashMap::new()),
            stale_after: Duration::from_std(stale_after).ok(),
            notifier,
        }
    }

    /// Merge a detection batch observed now.
    pub async fn merge(&self, batch: Vec<Problem>) -> MergeOutcome {
        self.merge_at(batch, Utc::now()).await
    }

    /// Merge a detection batch observed at `now`, then evict stale entries.
    ///
    /// The eviction scan covers the whole store and runs even for an empty
    /// batch. A change notification is raised if anything was inserted,
    /// updated, or evicted.
    pub async fn merge_at(&self, batch: Vec<Problem>, now: DateTime<Utc>) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();
        {
            let mut problems = self.problems.write().await;

            for mut detected in batch {
                match problems.get_mut(&detected.id) {
                    Some(existing) => {
                        existing.count += 1;
                        existing.last_seen = existing.last_seen.max(now);
                        existing.metrics = detected.metrics;
                        existing.update_persistence();
                        outcome.updated += 1;
                    }
                    None => {
                        detected.first_seen = now;
                        detected.last_seen = now;
                        detected.count = 1;
                        detected.update_persistence();
                        problems.insert(detected.id.clone(), detected);
                        outcome.inserted += 1;
                    }
                }
            }

            outcome.evicted = Self::evict_locked(&mut problems, self.cutoff(now));
        }

        if outcome.changed() {
            self.notifier.notify();
        }
        debug!(
            inserted = outcome.inserted,
            updated = outcome.updated,
            evicted = outcome.evicted,
            "merged detection batch"
        );
        outcome
    }

    /// Run only the eviction scan.
    pub async fn evict_stale_at(&self, now: DateTime<Utc>) -> usize {
        let evicted = {
            let mut problems = self.problems.write().await;
            Self::evict_locked(&mut problems, self.cutoff(now))
        };
        if evicted > 0 {
            self.notifier.notify();
        }
        evicted
    }

    /// Oldest `last_seen` that survives eviction at `now`, if any can be evicted.
    fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.stale_after.and_then(|d| now.checked_sub_signed(d))
    }

    fn evict_locked(
        problems: &mut HashMap<String, Problem>,
        cutoff: Option<DateTime<Utc>>,
    ) -> usize {
        let Some(cutoff) = cutoff else {
            return 0;
        };
        let before = problems.len();
        problems.retain(|_, p| p.last_seen >= cutoff);
        before - problems.len()
    }

    async fn snapshot(&self) -> Vec<Problem> {
        self.problems.read().await.values().cloned().collect()
    }

    /// Highest score first.
    pub async fn by_score(&self) -> Vec<Problem> {
        let mut list = self.snapshot().await;
        list.sort_by(|a, b| {
            b.score()
                .total_cmp(&a.score())
                .then_with(|| a.id.cmp(&b.id))
        });
        list
    }

    /// Most recently seen first.
    pub async fn by_recency(&self) -> Vec<Problem> {
        let mut list = self.snapshot().await;
        list.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then_with(|| a.id.cmp(&b.id)));
        list
    }

    /// Most frequently detected first.
    pub async fn by_count(&self) -> Vec<Problem> {
        let mut list = self.snapshot().await;
        list.sort_by(|a, b| match b.count.cmp(&a.count) {
            Ordering::Equal => a.id.cmp(&b.id),
            other => other,
        });
        list
    }

    /// Count per severity. Every severity is present, zero-filled.
    pub async fn summary(&self) -> BTreeMap<Severity, usize> {
        let mut summary: BTreeMap<Severity, usize> =
            Severity::ALL.iter().map(|s| (*s, 0)).collect();
        for p in self.problems.read().await.values() {
            *summary.entry(p.severity).or_default() += 1;
        }
        summary
    }

    pub async fn get(&self, id: &str) -> Option<Problem> {
        self.problems.read().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.problems.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.problems.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (ProblemStore, Arc<ChangeNotifier>) {
        let notifier = Arc::new(ChangeNotifier::new());
        (ProblemStore::new(DEFAULT_STALE_AFTER, notifier.clone()), notifier)
    }

    fn problem(id: &str, severity: Severity) -> Problem {
        Problem {
            id: id.to_string(),
            entity: id.to_string(),
            severity,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_merge_inserts_new_problem() {
        let (store, _) = store();
        let now = Utc::now();

        let outcome = store
            .merge_at(vec![problem("test/problem1", Severity::Critical)], now)
            .await;

        assert_eq!(outcome.inserted, 1);
        let p = store.get("test/problem1").await.expect("inserted");
        assert_eq!(p.count, 1);
        assert_eq!(p.first_seen, now);
        assert_eq!(p.last_seen, now);
        assert_eq!(p.persistence, 0.0);
    }

    #[tokio::test]
    async fn test_two_merges_ten_seconds_apart() {
        let (store, _) = store();
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(10);

        store.merge_at(vec![problem("x", Severity::Critical)], t0).await;
        store.merge_at(vec![problem("x", Severity::Critical)], t1).await;

        let p = store.get("x").await.unwrap();
        assert_eq!(p.count, 2);
        assert_eq!(p.first_seen, t0);
        assert!((p.persistence - 10.0).abs() < 1e-9);
        // 50 * 1.0 * (1 + 10/3600)
        assert!((p.score() - 50.138_888).abs() < 1e-3);
    }

    #[tokio::test]
    async fn test_update_overwrites_metrics_only() {
        let (store, _) = store();
        let now = Utc::now();

        let mut first = problem("m", Severity::Warning);
        first.metrics.insert("usage".into(), 91.0);
        first.hint = "original".into();
        store.merge_at(vec![first], now).await;

        let mut second = problem("m", Severity::Warning);
        second.metrics.insert("usage".into(), 97.0);
        second.hint = "changed".into();
        store.merge_at(vec![second], now + Duration::seconds(5)).await;

        let p = store.get("m").await.unwrap();
        assert_eq!(p.metrics["usage"], 97.0);
        assert_eq!(p.hint, "original");
    }

    #[tokio::test]
    async fn test_empty_merge_is_idempotent() {
        let (store, _) = store();
        let now = Utc::now();
        store.merge_at(vec![problem("a", Severity::Warning)], now).await;

        let outcome = store.merge_at(Vec::new(), now + Duration::seconds(5)).await;

        assert!(!outcome.changed());
        let p = store.get("a").await.unwrap();
        assert_eq!(p.count, 1);
        assert_eq!(p.last_seen, now);
    }

    #[tokio::test]
    async fn test_empty_merge_evicts_stale() {
        let (store, _) = store();
        let now = Utc::now();
        store
            .merge_at(vec![problem("stale", Severity::Fatal)], now - Duration::seconds(120))
            .await;
        assert_eq!(store.len().await, 1);

        let outcome = store.merge_at(Vec::new(), now).await;

        assert_eq!(outcome.evicted, 1);
        assert!(store.get("stale").await.is_none());
    }

    #[tokio::test]
    async fn test_huge_stale_window_never_evicts() {
        let store = ProblemStore::new(
            std::time::Duration::from_secs(10_000_000_000_000),
            Arc::new(ChangeNotifier::new()),
        );
        let now = Utc::now();
        store
            .merge_at(vec![problem("old", Severity::Warning)], now - Duration::days(365))
            .await;

        let outcome = store.merge_at(vec![problem("new", Severity::Warning)], now).await;

        assert_eq!(outcome.evicted, 0);
        assert_eq!(store.evict_stale_at(now).await, 0);
        assert_eq!(store.len().await, 2);

        let unrepresentable =
            ProblemStore::new(std::time::Duration::MAX, Arc::new(ChangeNotifier::new()));
        unrepresentable
            .merge_at(vec![problem("a", Severity::Fatal)], now)
            .await;
        assert_eq!(unrepresentable.evict_stale_at(now).await, 0);
    }

    #[tokio::test]
    async fn test_eviction_keeps_fresh_entries() {
        let (store, _) = store();
        let now = Utc::now();
        store
            .merge_at(vec![problem("recent", Severity::Warning)], now - Duration::seconds(30))
            .await;
        store
            .merge_at(vec![problem("fresh", Severity::Warning)], now)
            .await;

        assert!(store.get("recent").await.is_some());
        assert!(store.get("fresh").await.is_some());
    }

    #[tokio::test]
    async fn test_last_seen_never_moves_backwards() {
        let (store, _) = store();
        let now = Utc::now();
        store.merge_at(vec![problem("a", Severity::Warning)], now).await;
        store
            .merge_at(vec![problem("a", Severity::Warning)], now - Duration::seconds(3))
            .await;

        let p = store.get("a").await.unwrap();
        assert_eq!(p.last_seen, now);
        assert_eq!(p.count, 2);
    }

    #[tokio::test]
    async fn test_exports_are_copies() {
        let (store, _) = store();
        store
            .merge_at(vec![problem("a", Severity::Critical)], Utc::now())
            .await;

        let mut exported = store.by_score().await;
        exported[0].count = 999;
        exported[0].labels.insert("mutated".into(), "yes".into());

        for list in [store.by_recency().await, store.by_count().await] {
            assert_eq!(list[0].count, 1);
            assert!(!list[0].labels.contains_key("mutated"));
        }
    }

    #[tokio::test]
    async fn test_export_orderings() {
        let (store, _) = store();
        let t0 = Utc::now() - Duration::seconds(20);

        store.merge_at(vec![problem("warn", Severity::Warning)], t0).await;
        store
            .merge_at(vec![problem("fatal", Severity::Fatal)], t0 + Duration::seconds(1))
            .await;
        for i in 2..5 {
            store
                .merge_at(
                    vec![problem("warn", Severity::Warning)],
                    t0 + Duration::seconds(i),
                )
                .await;
        }
        store
            .merge_at(vec![problem("crit", Severity::Critical)], t0 + Duration::seconds(10))
            .await;

        let ids = |list: Vec<Problem>| list.into_iter().map(|p| p.id).collect::<Vec<_>>();
        assert_eq!(ids(store.by_score().await), vec!["fatal", "crit", "warn"]);
        assert_eq!(ids(store.by_recency().await), vec!["crit", "warn", "fatal"]);
        assert_eq!(ids(store.by_count().await), vec!["warn", "crit", "fatal"]);
    }

    #[tokio::test]
    async fn test_summary_zero_fills() {
        let (store, _) = store();
        store
            .merge_at(
                vec![
                    problem("a", Severity::Critical),
                    problem("b", Severity::Critical),
                ],
                Utc::now(),
            )
            .await;

        let summary = store.summary().await;
        assert_eq!(summary[&Severity::Critical], 2);
        assert_eq!(summary[&Severity::Fatal], 0);
        assert_eq!(summary[&Severity::Warning], 0);
    }

    #[tokio::test]
    async fn test_notifications_coalesce_across_merges() {
        let (store, notifier) = store();
        let now = Utc::now();
        store.merge_at(vec![problem("a", Severity::Warning)], now).await;
        store.merge_at(vec![problem("b", Severity::Warning)], now).await;
        store.merge_at(vec![problem("a", Severity::Warning)], now).await;

        assert!(notifier.try_take());
        assert!(!notifier.try_take());
    }

    #[tokio::test]
    async fn test_no_notification_without_change() {
        let (store, notifier) = store();
        store.merge_at(Vec::new(), Utc::now()).await;
        assert!(!notifier.try_take());
    }

    #[tokio::test]
    async fn test_evict_stale_at() {
        let (store, notifier) = store();
        let now = Utc::now();
        store
            .merge_at(vec![problem("old", Severity::Warning)], now - Duration::seconds(90))
            .await;
        notifier.try_take();

        assert_eq!(store.evict_stale_at(now).await, 1);
        assert!(store.is_empty().await);
        assert!(notifier.try_take());
    }
}
