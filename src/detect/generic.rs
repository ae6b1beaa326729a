//! Backend-agnostic rules: HTTP error rate, disk space, memory pressure.

use super::{DetectError, Detector};
use crate::metrics::MetricsProvider;
use crate::problem::{Problem, Severity};
use chrono::Utc;
use std::collections::BTreeMap;
use std::time::Duration;

/// Services whose 5xx ratio exceeds a threshold.
pub struct HighErrorRateDetector {
    interval: Duration,
    /// Fraction of requests, 0.05 = 5%.
    threshold: f64,
}

impl HighErrorRateDetector {
    pub fn new() -> Self {
        Self {
            interval: Duration::from_secs(30),
            threshold: 0.05,
        }
    }
}

impl Default for HighErrorRateDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Detector for HighErrorRateDetector {
    fn name(&self) -> &str {
        "generic_high_error_rate"
    }

    fn entity_types(&self) -> &[&'static str] {
        &["service", "http_endpoint"]
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn detect(
        &self,
        provider: &dyn MetricsProvider,
        _window: Duration,
    ) -> Result<Vec<Problem>, DetectError> {
        let query = format!(
            r#"(rate(http_requests_total{{status=~"5.."}}[5m]) / rate(http_requests_total[5m])) > {}"#,
            self.threshold
        );
        let samples = provider
            .query_instant(&query, Utc::now())
            .await
            .map_err(DetectError::query("error rate"))?;

        let problems = samples
            .iter()
            .map(|sample| {
                let service = [sample.label("service"), sample.label("job")]
                    .into_iter()
                    .find(|s| !s.is_empty())
                    .unwrap_or("unknown")
                    .to_string();
                let error_rate = sample.value * 100.0;

                Problem {
                    id: Problem::make_id(&service, "high_error_rate"),
                    entity: service.clone(),
                    entity_type: "service".into(),
                    issue_type: "high_error_rate".into(),
                    severity: Severity::Critical,
                    title: "High Error Rate".into(),
                    message: format!("Service {} has {:.2}% 5xx error rate", service, error_rate),
                    labels: BTreeMap::from([("service".to_string(), service)]),
                    metrics: BTreeMap::from([("error_rate".to_string(), error_rate)]),
                    hint: format!("5xx error rate above {:.0}% threshold", self.threshold * 100.0),
                    blast_radius: 5,
                    ..Default::default()
                }
            })
            .collect();

        Ok(problems)
    }
}

/// Filesystems running out of space.
pub struct DiskSpaceDetector {
    interval: Duration,
    warning_threshold: f64,
    critical_threshold: f64,
}

impl DiskSpaceDetector {
    pub fn new() -> Self {
        Self {
            interval: Duration::from_secs(60),
            warning_threshold: 0.90,
            critical_threshold: 0.95,
        }
    }

    fn severity_for(&self, used_fraction: f64) -> Severity {
        if used_fraction >= self.critical_threshold {
            Severity::Critical
        } else {
            Severity::Warning
        }
    }
}

impl Default for DiskSpaceDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Detector for DiskSpaceDetector {
    fn name(&self) -> &str {
        "generic_disk_space"
    }

    fn entity_types(&self) -> &[&'static str] {
        &["node", "filesystem"]
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn detect(
        &self,
        provider: &dyn MetricsProvider,
        _window: Duration,
    ) -> Result<Vec<Problem>, DetectError> {
        let query = format!(
            "(1 - (node_filesystem_avail_bytes / node_filesystem_size_bytes)) > {}",
            self.warning_threshold
        );
        let samples = provider
            .query_instant(&query, Utc::now())
            .await
            .map_err(DetectError::query("disk space"))?;

        let mut problems = Vec::with_capacity(samples.len());
        for sample in &samples {
            let node = match sample.label("instance") {
                "" => "unknown",
                n => n,
            };
            let mountpoint = sample.label("mountpoint");
            let usage_percent = sample.value * 100.0;
            let entity = format!("{}:{}", node, mountpoint);

            problems.push(Problem {
                id: Problem::make_id(&entity, "disk_space"),
                entity,
                entity_type: "filesystem".into(),
                issue_type: "disk_full".into(),
                severity: self.severity_for(sample.value),
                title: "Low Disk Space".into(),
                message: format!(
                    "Filesystem {} on {} is {:.1}% full",
                    mountpoint, node, usage_percent
                ),
                labels: BTreeMap::from([
                    ("node".to_string(), node.to_string()),
                    ("mountpoint".to_string(), mountpoint.to_string()),
                    ("device".to_string(), sample.label("device").to_string()),
                ]),
                metrics: BTreeMap::from([("usage_percent".to_string(), usage_percent)]),
                hint: format!("Disk usage above {:.0}%", self.warning_threshold * 100.0),
                blast_radius: 3,
                ..Default::default()
            });
        }

        Ok(problems)
    }
}

/// Nodes under memory pressure.
pub struct MemoryPressureDetector {
    interval: Duration,
    threshold: f64,
}

impl MemoryPressureDetector {
    pub fn new() -> Self {
        Self {
            interval: Duration::from_secs(30),
            threshold: 0.90,
        }
    }
}

impl Default for MemoryPressureDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Detector for MemoryPressureDetector {
    fn name(&self) -> &str {
        "generic_memory_pressure"
    }

    fn entity_types(&self) -> &[&'static str] {
        &["node"]
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn detect(
        &self,
        provider: &dyn MetricsProvider,
        _window: Duration,
    ) -> Result<Vec<Problem>, DetectError> {
        let query = format!(
            "(1 - (node_memory_MemAvailable_bytes / node_memory_MemTotal_bytes)) > {}",
            self.threshold
        );
        let samples = provider
            .query_instant(&query, Utc::now())
            .await
            .map_err(DetectError::query("memory pressure"))?;

        let problems = samples
            .iter()
            .map(|sample| {
                let node = match sample.label("instance") {
                    "" => "unknown".to_string(),
                    n => n.to_string(),
                };
                let usage_percent = sample.value * 100.0;

                Problem {
                    id: Problem::make_id(&node, "memory_pressure"),
                    entity: node.clone(),
                    entity_type: "node".into(),
                    issue_type: "high_memory".into(),
                    severity: Severity::Critical,
                    title: "High Memory Pressure".into(),
                    message: format!("Node {} has {:.1}% memory usage", node, usage_percent),
                    labels: BTreeMap::from([("node".to_string(), node)]),
                    metrics: BTreeMap::from([(
                        "memory_usage_percent".to_string(),
                        usage_percent,
                    )]),
                    hint: format!("Memory pressure above {:.0}%", self.threshold * 100.0),
                    blast_radius: 10,
                    ..Default::default()
                }
            })
            .collect();

        Ok(problems)
    }
}
