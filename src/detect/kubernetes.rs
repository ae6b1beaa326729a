//! Kubernetes workload rules backed by kube-state-metrics.

use super::{DetectError, Detector};
use crate::metrics::{MetricsProvider, Sample};
use crate::problem::{Problem, Severity};
use chrono::Utc;
use std::collections::BTreeMap;
use std::time::Duration;

const POD_INTERVAL: Duration = Duration::from_secs(30);
const ENTITY_TYPES: &[&str] = &["kubernetes_pod"];

/// Static description of a container-level rule. Every rule in this module
/// differs only in query and wording.
struct ContainerRule {
    suffix: &'static str,
    issue_type: &'static str,
    severity: Severity,
    title: &'static str,
    hint: &'static str,
    metric: &'static str,
}

impl ContainerRule {
    fn problem(&self, sample: &Sample, message: String, include_container: bool) -> Problem {
        let namespace = sample.label("namespace");
        let pod = sample.label("pod");
        let container = sample.label("container");

        let entity = if include_container {
            format!("{}/{}/{}", namespace, pod, container)
        } else {
            format!("{}/{}", namespace, pod)
        };

        let mut labels = BTreeMap::from([
            ("namespace".to_string(), namespace.to_string()),
            ("pod".to_string(), pod.to_string()),
        ]);
        if include_container {
            labels.insert("container".to_string(), container.to_string());
        }

        Problem {
            id: Problem::make_id(&entity, self.suffix),
            entity,
            entity_type: "kubernetes_pod".into(),
            issue_type: self.issue_type.into(),
            severity: self.severity,
            title: self.title.into(),
            message,
            labels,
            metrics: BTreeMap::from([(self.metric.to_string(), sample.value)]),
            hint: self.hint.into(),
            blast_radius: 1,
            ..Default::default()
        }
    }
}

/// Containers OOM-killed within the last five minutes.
pub struct OomKillDetector {
    interval: Duration,
}

impl OomKillDetector {
    const RULE: ContainerRule = ContainerRule {
        suffix: "oomkill",
        issue_type: "oom_kill",
        severity: Severity::Critical,
        title: "Container OOM Killed",
        hint: "Container memory limit too low or memory leak detected",
        metric: "restart_count",
    };

    pub fn new() -> Self {
        Self {
            interval: POD_INTERVAL,
        }
    }
}

impl Default for OomKillDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Detector for OomKillDetector {
    fn name(&self) -> &str {
        "kubernetes_oom_kills"
    }

    fn entity_types(&self) -> &[&'static str] {
        ENTITY_TYPES
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn detect(
        &self,
        provider: &dyn MetricsProvider,
        _window: Duration,
    ) -> Result<Vec<Problem>, DetectError> {
        let query = r#"increase(kube_pod_container_status_restarts_total{reason="OOMKilled"}[5m]) > 0"#;
        let samples = provider
            .query_instant(query, Utc::now())
            .await
            .map_err(DetectError::query("oom kill"))?;

        Ok(samples
            .iter()
            .map(|s| {
                let msg = format!(
                    "Container {} in pod {}/{} was OOM killed",
                    s.label("container"),
                    s.label("namespace"),
                    s.label("pod")
                );
                Self::RULE.problem(s, msg, true)
            })
            .collect())
    }
}

/// Containers stuck in CrashLoopBackOff.
pub struct CrashLoopDetector {
    interval: Duration,
}

impl CrashLoopDetector {
    const RULE: ContainerRule = ContainerRule {
        suffix: "crashloop",
        issue_type: "crashloopbackoff",
        severity: Severity::Fatal,
        title: "Pod CrashLoopBackOff",
        hint: "Application startup failure or fatal runtime error",
        metric: "waiting",
    };

    pub fn new() -> Self {
        Self {
            interval: POD_INTERVAL,
        }
    }
}

impl Default for CrashLoopDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Detector for CrashLoopDetector {
    fn name(&self) -> &str {
        "kubernetes_crashloop"
    }

    fn entity_types(&self) -> &[&'static str] {
        ENTITY_TYPES
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn detect(
        &self,
        provider: &dyn MetricsProvider,
        _window: Duration,
    ) -> Result<Vec<Problem>, DetectError> {
        let query = r#"kube_pod_container_status_waiting_reason{reason="CrashLoopBackOff"} > 0"#;
        let samples = provider
            .query_instant(query, Utc::now())
            .await
            .map_err(DetectError::query("crashloop"))?;

        Ok(samples
            .iter()
            .map(|s| {
                let msg = format!(
                    "Pod {}/{} is in CrashLoopBackOff state",
                    s.label("namespace"),
                    s.label("pod")
                );
                Self::RULE.problem(s, msg, true)
            })
            .collect())
    }
}

/// Containers that cannot pull their image.
pub struct ImagePullDetector {
    interval: Duration,
}

impl ImagePullDetector {
    const RULE: ContainerRule = ContainerRule {
        suffix: "imagepull",
        issue_type: "imagepullbackoff",
        severity: Severity::Critical,
        title: "Image Pull Failed",
        hint: "Image not found or registry authentication failure",
        metric: "waiting",
    };

    pub fn new() -> Self {
        Self {
            interval: POD_INTERVAL,
        }
    }
}

impl Default for ImagePullDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Detector for ImagePullDetector {
    fn name(&self) -> &str {
        "kubernetes_imagepull"
    }

    fn entity_types(&self) -> &[&'static str] {
        ENTITY_TYPES
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn detect(
        &self,
        provider: &dyn MetricsProvider,
        _window: Duration,
    ) -> Result<Vec<Problem>, DetectError> {
        let query = r#"kube_pod_container_status_waiting_reason{reason=~"ImagePullBackOff|ErrImagePull"} > 0"#;
        let samples = provider
            .query_instant(query, Utc::now())
            .await
            .map_err(DetectError::query("image pull"))?;

        Ok(samples
            .iter()
            .map(|s| {
                let msg = format!(
                    "Pod {}/{} cannot pull container image",
                    s.label("namespace"),
                    s.label("pod")
                );
                Self::RULE.problem(s, msg, true)
            })
            .collect())
    }
}

/// Pods pending for more than five minutes.
pub struct PodPendingDetector {
    interval: Duration,
}

impl PodPendingDetector {
    const RULE: ContainerRule = ContainerRule {
        suffix: "pending",
        issue_type: "pending",
        severity: Severity::Critical,
        title: "Pod Pending",
        hint: "Insufficient cluster resources or scheduling constraints",
        metric: "phase",
    };

    pub fn new() -> Self {
        Self {
            interval: POD_INTERVAL,
        }
    }
}

impl Default for PodPendingDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Detector for PodPendingDetector {
    fn name(&self) -> &str {
        "kubernetes_pending"
    }

    fn entity_types(&self) -> &[&'static str] {
        ENTITY_TYPES
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn detect(
        &self,
        provider: &dyn MetricsProvider,
        _window: Duration,
    ) -> Result<Vec<Problem>, DetectError> {
        let query = r#"kube_pod_status_phase{phase="Pending"} == 1 and on(namespace, pod) ((time() - kube_pod_created) > 300)"#;
        let samples = provider
            .query_instant(query, Utc::now())
            .await
            .map_err(DetectError::query("pending pod"))?;

        Ok(samples
            .iter()
            // Only pods currently in the Pending phase.
            .filter(|s| s.value == 1.0)
            .map(|s| {
                let msg = format!(
                    "Pod {}/{} has been pending for >5 minutes",
                    s.label("namespace"),
                    s.label("pod")
                );
                Self::RULE.problem(s, msg, false)
            })
            .collect())
    }
}
