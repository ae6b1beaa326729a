//! Rules over metrics exported by the trustwatch certificate scanner.

use super::servicemesh::{cert_severity, format_remaining, CERT_INTERVAL, CERT_WARNING_SECS};
use super::{DetectError, Detector};
use crate::metrics::{MetricsProvider, Sample};
use crate::problem::{Problem, Severity};
use chrono::Utc;
use std::collections::BTreeMap;
use std::time::Duration;

const ENTITY_TYPES: &[&str] = &["trustwatch_certificate"];

/// `trustwatch/<source>/<namespace>/<name>` plus its identifying labels.
fn target(s: &Sample) -> (String, BTreeMap<String, String>) {
    let source = s.label("source");
    let namespace = s.label("namespace");
    let name = s.label("name");
    let labels = BTreeMap::from([
        ("source".to_string(), source.to_string()),
        ("namespace".to_string(), namespace.to_string()),
        ("name".to_string(), name.to_string()),
    ]);
    (format!("trustwatch/{}/{}/{}", source, namespace, name), labels)
}

/// Certificates that trustwatch reports as expiring within a week.
pub struct TrustwatchCertExpiryDetector {
    interval: Duration,
}

impl TrustwatchCertExpiryDetector {
    pub fn new() -> Self {
        Self {
            interval: CERT_INTERVAL,
        }
    }
}

impl Default for TrustwatchCertExpiryDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Detector for TrustwatchCertExpiryDetector {
    fn name(&self) -> &str {
        "trustwatch_cert_expiry"
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
        let query = format!("trustwatch_cert_expires_in_seconds < {}", CERT_WARNING_SECS);
        let samples = provider
            .query_instant(&query, Utc::now())
            .await
            .map_err(DetectError::query("trustwatch cert expiry"))?;

        Ok(samples
            .iter()
            .map(|s| {
                let remaining = s.value;
                let left = format_remaining(remaining);
                let (entity, labels) = target(s);
                Problem {
                    id: Problem::make_id(&entity, "trustwatch_cert_expiry"),
                    entity,
                    entity_type: ENTITY_TYPES[0].into(),
                    issue_type: "trustwatch_cert_expiry".into(),
                    severity: cert_severity(remaining),
                    title: format!("Certificate expiring in {}", left),
                    message: format!(
                        "trustwatch: {}/{} cert expires in {}",
                        s.label("namespace"),
                        s.label("name"),
                        left
                    ),
                    labels,
                    metrics: BTreeMap::from([("remaining_seconds".to_string(), remaining)]),
                    hint: "Run: trustwatch now".into(),
                    blast_radius: 20,
                    ..Default::default()
                }
            })
            .collect())
    }
}

/// TLS endpoints trustwatch could not reach.
pub struct TrustwatchProbeFailureDetector {
    interval: Duration,
}

impl TrustwatchProbeFailureDetector {
    pub fn new() -> Self {
        Self {
            interval: CERT_INTERVAL,
        }
    }
}

impl Default for TrustwatchProbeFailureDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Detector for TrustwatchProbeFailureDetector {
    fn name(&self) -> &str {
        "trustwatch_probe_failure"
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
        let samples = provider
            .query_instant("trustwatch_probe_success == 0", Utc::now())
            .await
            .map_err(DetectError::query("trustwatch probe failure"))?;

        Ok(samples
            .iter()
            .map(|s| {
                let (entity, labels) = target(s);
                Problem {
                    id: Problem::make_id(&entity, "trustwatch_probe_failure"),
                    entity,
                    entity_type: ENTITY_TYPES[0].into(),
                    issue_type: "trustwatch_probe_failure".into(),
                    severity: Severity::Critical,
                    title: "TLS probe failed".into(),
                    message: format!(
                        "trustwatch: TLS probe failed for {}/{} (source: {})",
                        s.label("namespace"),
                        s.label("name"),
                        s.label("source")
                    ),
                    labels,
                    hint: "Run: trustwatch now".into(),
                    blast_radius: 5,
                    ..Default::default()
                }
            })
            .collect())
    }
}
