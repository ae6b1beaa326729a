//! Detection rules and the registry that catalogs them.

pub mod generic;
pub mod kubernetes;
pub mod registry;
pub mod servicemesh;
pub mod trustwatch;

use std::time::Duration;

use thiserror::Error;

use crate::metrics::{MetricsError, MetricsProvider};
use crate::problem::Problem;

pub use self::registry::Registry;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("{what} query failed: {source}")]
    Query {
        what: &'static str,
        #[source]
        source: MetricsError,
    },

    #[error("detection timed out after {0:?}")]
    Timeout(Duration),
}

impl DetectError {
    pub fn query(what: &'static str) -> impl FnOnce(MetricsError) -> DetectError {
        move |source| DetectError::Query { what, source }
    }
}

/// A stateless unit that turns one backend query into problems.
///
/// Implementations must not keep state between calls: the same backend
/// state yields the same problems. Retrying is left to the scheduler, which
/// simply runs the rule again on its next tick.
#[async_trait::async_trait]
pub trait Detector: Send + Sync {
    /// Unique identifier, e.g. `kubernetes_oom_kills`.
    fn name(&self) -> &str;

    /// Entity kinds this rule reports on. Informational only.
    fn entity_types(&self) -> &[&'static str];

    /// How often the scheduler runs this rule.
    fn interval(&self) -> Duration;

    /// Query the backend and return every problem currently present.
    async fn detect(
        &self,
        provider: &dyn MetricsProvider,
        window: Duration,
    ) -> Result<Vec<Problem>, DetectError>;
}

/// Registry preloaded with every built-in rule.
pub async fn default_registry() -> Registry {
    let registry = Registry::new();

    // Kubernetes
    registry.register(kubernetes::OomKillDetector::new()).await;
    registry.register(kubernetes::CrashLoopDetector::new()).await;
    registry.register(kubernetes::ImagePullDetector::new()).await;
    registry.register(kubernetes::PodPendingDetector::new()).await;

    // Generic
    registry.register(generic::HighErrorRateDetector::new()).await;
    registry.register(generic::DiskSpaceDetector::new()).await;
    registry.register(generic::MemoryPressureDetector::new()).await;

    // Service mesh
    registry.register(servicemesh::LinkerdControlPlaneDetector::new()).await;
    registry.register(servicemesh::LinkerdProxyInjectionDetector::new()).await;
    registry.register(servicemesh::IstioControlPlaneDetector::new()).await;
    registry.register(servicemesh::IstioSidecarInjectionDetector::new()).await;
    registry.register(servicemesh::LinkerdCertExpiryDetector::new()).await;
    registry.register(servicemesh::IstioCertExpiryDetector::new()).await;

    // trustwatch
    registry.register(trustwatch::TrustwatchCertExpiryDetector::new()).await;
    registry.register(trustwatch::TrustwatchProbeFailureDetector::new()).await;

    registry
}
