//! Service mesh rules for Linkerd and Istio: control plane availability,
//! crash-looping mesh components, and identity/root certificate expiry.

use super::{DetectError, Detector};
use crate::metrics::{MetricsProvider, Sample};
use crate::problem::{Problem, Severity};
use chrono::Utc;
use std::collections::BTreeMap;
use std::time::Duration;

const MESH_INTERVAL: Duration = Duration::from_secs(30);
pub(crate) const CERT_INTERVAL: Duration = Duration::from_secs(60);

const CONTROL_PLANE: &[&str] = &["service_mesh_control_plane"];
const CERTIFICATE: &[&str] = &["service_mesh_certificate"];

/// Remaining lifetime below which a certificate is FATAL.
pub(crate) const CERT_FATAL_SECS: f64 = 86_400.0;
/// Remaining lifetime below which a certificate is CRITICAL.
pub(crate) const CERT_CRITICAL_SECS: f64 = 172_800.0;
/// Certificates expiring later than this are not reported.
pub(crate) const CERT_WARNING_SECS: u64 = 604_800;

/// Severity tier for a certificate with `remaining` seconds left.
pub(crate) fn cert_severity(remaining: f64) -> Severity {
    if remaining < CERT_FATAL_SECS {
        Severity::Fatal
    } else if remaining < CERT_CRITICAL_SECS {
        Severity::Critical
    } else {
        Severity::Warning
    }
}

/// `"3d 4h"`, `"5h 12m"`, or `"EXPIRED"`.
pub(crate) fn format_remaining(seconds: f64) -> String {
    if seconds <= 0.0 {
        return "EXPIRED".to_string();
    }
    let total = seconds as u64;
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    if days > 0 {
        format!("{}d {}h", days, hours)
    } else {
        format!("{}h {}m", hours, (total % 3_600) / 60)
    }
}

fn mesh_labels(mesh: &str, pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::from([("mesh".to_string(), mesh.to_string())]);
    for (k, v) in pairs {
        labels.insert(k.to_string(), v.to_string());
    }
    labels
}

// ---------------------------------------------------------------------------
// Control plane and component health
// ---------------------------------------------------------------------------

/// Which shape of problem a mesh health rule emits.
#[derive(Clone, Copy)]
enum MeshCheck {
    /// Deployment with zero available replicas.
    Down,
    /// Pod container in CrashLoopBackOff.
    Crash,
}

struct MeshRule {
    name: &'static str,
    mesh: &'static str,
    check: MeshCheck,
    query: &'static str,
    what: &'static str,
    suffix: &'static str,
    issue_type: &'static str,
    title: &'static str,
}

impl MeshRule {
    async fn run(&self, provider: &dyn MetricsProvider) -> Result<Vec<Problem>, DetectError> {
        let samples = provider
            .query_instant(self.query, Utc::now())
            .await
            .map_err(DetectError::query(self.what))?;
        Ok(samples.iter().map(|s| self.problem(s)).collect())
    }

    fn problem(&self, s: &Sample) -> Problem {
        let namespace = s.label("namespace");
        let display = if self.mesh == "linkerd" { "Linkerd" } else { "Istio" };

        let (entity, message, labels, metric, hint, severity, blast_radius) = match self.check {
            MeshCheck::Down => {
                let deployment = s.label("deployment");
                let hint = if self.mesh == "linkerd" {
                    format!(
                        "Check pod status: kubectl get pods -n linkerd; Check logs: kubectl logs -n linkerd -l app={}",
                        deployment
                    )
                } else {
                    "Check pod status: kubectl get pods -n istio-system; Check logs: kubectl logs -n istio-system -l app=istiod".to_string()
                };
                let who = if self.mesh == "linkerd" { "Linkerd" } else { "Istiod" };
                (
                    format!("{}/{}", namespace, deployment),
                    format!("{} deployment {} has zero available replicas", who, deployment),
                    mesh_labels(self.mesh, &[("namespace", namespace), ("deployment", deployment)]),
                    "available_replicas",
                    hint,
                    Severity::Fatal,
                    15,
                )
            }
            MeshCheck::Crash => {
                let pod = s.label("pod");
                let container = s.label("container");
                let cause = if self.mesh == "linkerd" {
                    "Proxy injector or identity service failure"
                } else {
                    "Sidecar injector or pilot failure"
                };
                (
                    format!("{}/{}/{}", namespace, pod, container),
                    format!("{} pod {}/{} is in CrashLoopBackOff", display, namespace, pod),
                    mesh_labels(
                        self.mesh,
                        &[("namespace", namespace), ("pod", pod), ("container", container)],
                    ),
                    "waiting",
                    format!("{}; Check logs: kubectl logs -n {} {}", cause, namespace, pod),
                    Severity::Critical,
                    10,
                )
            }
        };

        Problem {
            id: Problem::make_id(&entity, self.suffix),
            entity,
            entity_type: CONTROL_PLANE[0].into(),
            issue_type: self.issue_type.into(),
            severity,
            title: self.title.into(),
            message,
            labels,
            metrics: BTreeMap::from([(metric.to_string(), s.value)]),
            hint,
            blast_radius,
            ..Default::default()
        }
    }
}

macro_rules! mesh_detector {
    ($(#[$doc:meta])* $ty:ident, $rule:expr) => {
        $(#[$doc])*
        pub struct $ty {
            interval: Duration,
        }

        impl $ty {
            const RULE: MeshRule = $rule;

            pub fn new() -> Self {
                Self {
                    interval: MESH_INTERVAL,
                }
            }
        }

        impl Default for $ty {
            fn default() -> Self {
                Self::new()
            }
        }

        #[async_trait::async_trait]
        impl Detector for $ty {
            fn name(&self) -> &str {
                Self::RULE.name
            }

            fn entity_types(&self) -> &[&'static str] {
                CONTROL_PLANE
            }

            fn interval(&self) -> Duration {
                self.interval
            }

            async fn detect(
                &self,
                provider: &dyn MetricsProvider,
                _window: Duration,
            ) -> Result<Vec<Problem>, DetectError> {
                Self::RULE.run(provider).await
            }
        }
    };
}

mesh_detector!(
    /// Linkerd control plane deployments with no available replicas.
    LinkerdControlPlaneDetector,
    MeshRule {
        name: "servicemesh_linkerd_controlplane",
        mesh: "linkerd",
        check: MeshCheck::Down,
        query: r#"kube_deployment_status_replicas_available{namespace="linkerd"} == 0"#,
        what: "linkerd control plane",
        suffix: "linkerd_cp_down",
        issue_type: "linkerd_control_plane_down",
        title: "Linkerd Control Plane Down",
    }
);

mesh_detector!(
    /// Linkerd components stuck in CrashLoopBackOff.
    LinkerdProxyInjectionDetector,
    MeshRule {
        name: "servicemesh_linkerd_injection",
        mesh: "linkerd",
        check: MeshCheck::Crash,
        query: r#"kube_pod_container_status_waiting_reason{namespace="linkerd",reason="CrashLoopBackOff"} > 0"#,
        what: "linkerd proxy injection",
        suffix: "linkerd_crash",
        issue_type: "linkerd_component_crash",
        title: "Linkerd Component CrashLoopBackOff",
    }
);

mesh_detector!(
    /// istiod with no available replicas.
    IstioControlPlaneDetector,
    MeshRule {
        name: "servicemesh_istio_controlplane",
        mesh: "istio",
        check: MeshCheck::Down,
        query: r#"kube_deployment_status_replicas_available{namespace="istio-system",deployment="istiod"} == 0"#,
        what: "istio control plane",
        suffix: "istio_cp_down",
        issue_type: "istio_control_plane_down",
        title: "Istio Control Plane Down",
    }
);

mesh_detector!(
    /// istio-system components stuck in CrashLoopBackOff.
    IstioSidecarInjectionDetector,
    MeshRule {
        name: "servicemesh_istio_injection",
        mesh: "istio",
        check: MeshCheck::Crash,
        query: r#"kube_pod_container_status_waiting_reason{namespace="istio-system",reason="CrashLoopBackOff"} > 0"#,
        what: "istio sidecar injection",
        suffix: "istio_crash",
        issue_type: "istio_component_crash",
        title: "Istio Component CrashLoopBackOff",
    }
);

// ---------------------------------------------------------------------------
// Certificate expiry
// ---------------------------------------------------------------------------

struct CertRule {
    name: &'static str,
    mesh: &'static str,
    /// Metric holding the expiry time as a unix timestamp.
    metric: &'static str,
    what: &'static str,
    default_namespace: &'static str,
    cert: &'static str,
    cert_type: &'static str,
    suffix: &'static str,
    issue_type: &'static str,
    title: &'static str,
    subject: &'static str,
    hint: &'static str,
}

impl CertRule {
    async fn run(&self, provider: &dyn MetricsProvider) -> Result<Vec<Problem>, DetectError> {
        let query = format!("({} - time()) < {}", self.metric, CERT_WARNING_SECS);
        let samples = provider
            .query_instant(&query, Utc::now())
            .await
            .map_err(DetectError::query(self.what))?;

        Ok(samples
            .iter()
            .map(|s| {
                let remaining = s.value;
                let namespace = match s.label("namespace") {
                    "" => self.default_namespace,
                    ns => ns,
                };
                let entity = format!("{}/{}", namespace, self.cert);
                Problem {
                    id: Problem::make_id(&entity, self.suffix),
                    entity,
                    entity_type: CERTIFICATE[0].into(),
                    issue_type: self.issue_type.into(),
                    severity: cert_severity(remaining),
                    title: self.title.into(),
                    message: format!("{} expires in {}", self.subject, format_remaining(remaining)),
                    labels: mesh_labels(
                        self.mesh,
                        &[("namespace", namespace), ("type", self.cert_type)],
                    ),
                    metrics: BTreeMap::from([("remaining_seconds".to_string(), remaining)]),
                    hint: self.hint.into(),
                    blast_radius: 20,
                    ..Default::default()
                }
            })
            .collect())
    }
}

/// Linkerd identity issuer certificate close to expiry.
pub struct LinkerdCertExpiryDetector {
    interval: Duration,
}

impl LinkerdCertExpiryDetector {
    const RULE: CertRule = CertRule {
        name: "servicemesh_linkerd_cert_expiry",
        mesh: "linkerd",
        metric: "identity_cert_expiry_timestamp",
        what: "linkerd cert expiry",
        default_namespace: "linkerd",
        cert: "identity-cert",
        cert_type: "identity_cert",
        suffix: "linkerd_cert_expiry",
        issue_type: "linkerd_cert_expiry",
        title: "Linkerd Certificate Expiring",
        subject: "Linkerd identity certificate",
        hint: "Rotate certs: linkerd check --proxy; Renew: linkerd upgrade | kubectl apply -f -",
    };

    pub fn new() -> Self {
        Self {
            interval: CERT_INTERVAL,
        }
    }
}

impl Default for LinkerdCertExpiryDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Detector for LinkerdCertExpiryDetector {
    fn name(&self) -> &str {
        Self::RULE.name
    }

    fn entity_types(&self) -> &[&'static str] {
        CERTIFICATE
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn detect(
        &self,
        provider: &dyn MetricsProvider,
        _window: Duration,
    ) -> Result<Vec<Problem>, DetectError> {
        Self::RULE.run(provider).await
    }
}

/// Istio root CA certificate close to expiry.
pub struct IstioCertExpiryDetector {
    interval: Duration,
}

impl IstioCertExpiryDetector {
    const RULE: CertRule = CertRule {
        name: "servicemesh_istio_cert_expiry",
        mesh: "istio",
        metric: "citadel_server_root_cert_expiry_timestamp",
        what: "istio cert expiry",
        default_namespace: "istio-system",
        cert: "root-cert",
        cert_type: "root_cert",
        suffix: "istio_cert_expiry",
        issue_type: "istio_cert_expiry",
        title: "Istio Root Certificate Expiring",
        subject: "Istio root certificate",
        hint: "Check status: istioctl proxy-status; Rotate: istioctl create-remote-secret",
    };

    pub fn new() -> Self {
        Self {
            interval: CERT_INTERVAL,
        }
    }
}

impl Default for IstioCertExpiryDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Detector for IstioCertExpiryDetector {
    fn name(&self) -> &str {
        Self::RULE.name
    }

    fn entity_types(&self) -> &[&'static str] {
        CERTIFICATE
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn detect(
        &self,
        provider: &dyn MetricsProvider,
        _window: Duration,
    ) -> Result<Vec<Problem>, DetectError> {
        Self::RULE.run(provider).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{MetricsError, MockProvider};

    const WINDOW: Duration = Duration::from_secs(300);
    const HOUR: f64 = 3_600.0;

    fn remaining(secs: f64) -> MockProvider {
        MockProvider::new().with_instant(move |_, _| Ok(vec![Sample::new(&[], secs)]))
    }

    #[test]
    fn test_cert_severity_tiers() {
        let cases = [
            (-HOUR, Severity::Fatal),
            (0.0, Severity::Fatal),
            (12.0 * HOUR, Severity::Fatal),
            (23.0 * HOUR, Severity::Fatal),
            (25.0 * HOUR, Severity::Critical),
            (47.0 * HOUR, Severity::Critical),
            (72.0 * HOUR, Severity::Warning),
            (144.0 * HOUR, Severity::Warning),
        ];
        for (secs, expected) in cases {
            assert_eq!(cert_severity(secs), expected, "remaining {secs}s");
        }
    }

    #[test]
    fn test_format_remaining() {
        assert_eq!(format_remaining(-100.0), "EXPIRED");
        assert_eq!(format_remaining(0.0), "EXPIRED");
        assert_eq!(format_remaining(3_600.0), "1h 0m");
        assert_eq!(format_remaining(7_200.0), "2h 0m");
        assert_eq!(format_remaining(90_000.0), "1d 1h");
        assert_eq!(format_remaining(259_200.0), "3d 0h");
    }

    #[tokio::test]
    async fn test_linkerd_control_plane_down() {
        let provider = MockProvider::new().with_instant(|query, _| {
            assert!(query.contains(r#"namespace="linkerd""#));
            Ok(vec![Sample::new(
                &[("namespace", "linkerd"), ("deployment", "linkerd-destination")],
                0.0,
            )])
        });
        let problems = LinkerdControlPlaneDetector::new()
            .detect(&provider, WINDOW)
            .await
            .unwrap();

        assert_eq!(problems.len(), 1);
        let p = &problems[0];
        assert_eq!(p.id, "linkerd/linkerd-destination/linkerd_cp_down");
        assert_eq!(p.severity, Severity::Fatal);
        assert_eq!(p.blast_radius, 15);
        assert_eq!(p.labels["mesh"], "linkerd");
        assert_eq!(p.metrics["available_replicas"], 0.0);
        assert!(p.hint.contains("app=linkerd-destination"));
    }

    #[tokio::test]
    async fn test_istio_component_crash() {
        let provider = MockProvider::new().with_instant(|_, _| {
            Ok(vec![Sample::new(
                &[
                    ("namespace", "istio-system"),
                    ("pod", "istiod-5f4"),
                    ("container", "discovery"),
                ],
                1.0,
            )])
        });
        let problems = IstioSidecarInjectionDetector::new()
            .detect(&provider, WINDOW)
            .await
            .unwrap();

        let p = &problems[0];
        assert_eq!(p.id, "istio-system/istiod-5f4/discovery/istio_crash");
        assert_eq!(p.severity, Severity::Critical);
        assert_eq!(p.message, "Istio pod istio-system/istiod-5f4 is in CrashLoopBackOff");
        assert_eq!(p.blast_radius, 10);
    }

    #[tokio::test]
    async fn test_istio_control_plane_message() {
        let provider = MockProvider::new().with_instant(|_, _| {
            Ok(vec![Sample::new(
                &[("namespace", "istio-system"), ("deployment", "istiod")],
                0.0,
            )])
        });
        let problems = IstioControlPlaneDetector::new()
            .detect(&provider, WINDOW)
            .await
            .unwrap();
        assert_eq!(problems[0].id, "istio-system/istiod/istio_cp_down");
        assert!(problems[0].message.starts_with("Istiod deployment istiod"));
    }

    #[tokio::test]
    async fn test_linkerd_cert_warning_with_default_namespace() {
        let problems = LinkerdCertExpiryDetector::new()
            .detect(&remaining(5.0 * 24.0 * HOUR), WINDOW)
            .await
            .unwrap();

        let p = &problems[0];
        assert_eq!(p.id, "linkerd/identity-cert/linkerd_cert_expiry");
        assert_eq!(p.severity, Severity::Warning);
        assert_eq!(p.message, "Linkerd identity certificate expires in 5d 0h");
        assert_eq!(p.blast_radius, 20);
    }

    #[tokio::test]
    async fn test_linkerd_cert_tiers_through_detect() {
        let detector = LinkerdCertExpiryDetector::new();
        let critical = detector.detect(&remaining(36.0 * HOUR), WINDOW).await.unwrap();
        assert_eq!(critical[0].severity, Severity::Critical);

        let fatal = detector.detect(&remaining(12.0 * HOUR), WINDOW).await.unwrap();
        assert_eq!(fatal[0].severity, Severity::Fatal);

        let expired = detector.detect(&remaining(-HOUR), WINDOW).await.unwrap();
        assert_eq!(expired[0].severity, Severity::Fatal);
        assert!(expired[0].message.ends_with("EXPIRED"));
    }

    #[tokio::test]
    async fn test_istio_cert_query_and_namespace() {
        let provider = MockProvider::new().with_instant(|query, _| {
            assert!(query.starts_with("(citadel_server_root_cert_expiry_timestamp - time()) < 604800"));
            Ok(vec![Sample::new(&[("namespace", "mesh")], 6.0 * 3_600.0)])
        });
        let problems = IstioCertExpiryDetector::new()
            .detect(&provider, WINDOW)
            .await
            .unwrap();
        assert_eq!(problems[0].id, "mesh/root-cert/istio_cert_expiry");
        assert_eq!(problems[0].severity, Severity::Fatal);
    }

    #[tokio::test]
    async fn test_no_cert_metric_yields_nothing() {
        let problems = LinkerdCertExpiryDetector::new()
            .detect(&MockProvider::new(), WINDOW)
            .await
            .unwrap();
        assert!(problems.is_empty());
    }

    #[tokio::test]
    async fn test_backend_error() {
        let provider = MockProvider::new()
            .with_instant(|_, _| Err(MetricsError::Unavailable("refused".into())));
        let err = IstioCertExpiryDetector::new()
            .detect(&provider, WINDOW)
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("istio cert expiry query failed"));
    }

    #[test]
    fn test_rule_metadata() {
        assert_eq!(LinkerdCertExpiryDetector::new().interval(), CERT_INTERVAL);
        assert_eq!(IstioCertExpiryDetector::new().entity_types(), CERTIFICATE);
        assert_eq!(LinkerdProxyInjectionDetector::new().interval(), MESH_INTERVAL);
        assert_eq!(
            IstioControlPlaneDetector::new().name(),
            "servicemesh_istio_controlplane"
        );
    }
}
