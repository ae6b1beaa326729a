use super::Detector;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Thread-safe catalog of detection rules keyed by name.
///
/// Cheap to clone; clones share the same underlying map.
#[derive(Clone, Default)]
pub struct Registry {
    detectors: Arc<RwLock<HashMap<String, Arc<dyn Detector>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule, replacing any existing rule with the same name.
    pub async fn register<D: Detector + 'static>(&self, detector: D) {
        self.register_arc(Arc::new(detector)).await;
    }

    pub async fn register_arc(&self, detector: Arc<dyn Detector>) {
        let name = detector.name().to_string();
        debug!(rule = %name, "registering detection rule");
        self.detectors.write().await.insert(name, detector);
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Detector>> {
        self.detectors.read().await.get(name).cloned()
    }

    /// Snapshot of every registered rule, in no particular order.
    pub async fn all(&self) -> Vec<Arc<dyn Detector>> {
        self.detectors.read().await.values().cloned().collect()
    }

    /// Remove a rule. Returns `false` if it was not registered.
    pub async fn unregister(&self, name: &str) -> bool {
        self.detectors.write().await.remove(name).is_some()
    }

    pub async fn count(&self) -> usize {
        self.detectors.read().await.len()
    }
}
