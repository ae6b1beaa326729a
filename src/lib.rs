//! infratriage -- continuous infrastructure triage over a metrics backend.
//!
//! This crate provides detection rules, the orchestrator that schedules them,
//! the shared problem store, and the batch/HTTP surfaces that read from it.

pub mod api;
pub mod baseline;
pub mod config;
pub mod detect;
pub mod engine;
pub mod metrics;
pub mod problem;
pub mod report;

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, ConfigError};
use crate::engine::Orchestrator;
use crate::metrics::{MetricsError, MetricsProvider, PrometheusClient};
use crate::report::{DriftMetadata, DriftReport, ExitStatus, Report, ReportMetadata};

/// Build the Prometheus-backed provider described by `config`.
pub fn build_provider(config: &Config) -> Result<Arc<dyn MetricsProvider>> {
    let url = config.backend.url.as_deref().ok_or(ConfigError::MissingUrl)?;
    let client = PrometheusClient::new(url, config.backend.timeout())?;
    Ok(Arc::new(client))
}

/// Start the daemon: orchestrator plus the read-only HTTP API.
///
/// Runs until Ctrl-C, then drains in-flight rule executions before returning.
pub async fn serve(config: Config, bind: &str) -> Result<()> {
    config.validate()?;
    let provider = build_provider(&config)?;
    let registry = detect::default_registry().await;
    let orchestrator = Arc::new(Orchestrator::new(
        provider,
        registry,
        config.engine.orchestrator(),
    ));

    let cancel = CancellationToken::new();
    let engine = orchestrator.spawn(cancel.clone());

    let addr: std::net::SocketAddr = bind.parse().context("invalid bind address")?;
    let app = api::router(api::state::AppState {
        orchestrator: orchestrator.clone(),
        backend_url: metrics::prometheus::sanitize_url(
            config.backend.url.as_deref().unwrap_or_default(),
        ),
        refresh_interval: config.engine.refresh_interval(),
    });

    tracing::info!(%addr, "infratriage listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("shutdown signal received"),
                _ = shutdown.cancelled() => {}
            }
            shutdown.cancel();
        })
        .await?;

    cancel.cancel();
    engine.await.context("orchestrator task panicked")?;
    Ok(())
}

/// Batch-mode failures that mean the report cannot be trusted.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("metrics backend unreachable: {0}")]
    BackendUnreachable(#[source] MetricsError),

    #[error("metrics backend health check timed out after {0:?}")]
    HealthTimeout(std::time::Duration),

    #[error("all {failed} detection queries failed, refusing to report an empty result")]
    AllQueriesFailed { failed: u64 },
}

/// Batch-mode options that only make sense for a single run.
#[derive(Debug, Clone, Default)]
pub struct MonitorOptions {
    pub export_file: Option<PathBuf>,
    pub save_baseline: Option<PathBuf>,
    pub compare_baseline: Option<PathBuf>,
    pub fail_on_drift: bool,
}

/// One-shot batch run: wait for the first detection results, write a JSON
/// report to `out`, and decide the exit status.
pub async fn monitor(
    config: &Config,
    provider: Arc<dyn MetricsProvider>,
    registry: detect::Registry,
    opts: &MonitorOptions,
    out: &mut dyn Write,
) -> Result<ExitStatus> {
    let min_severity = config.report.min_severity()?;
    let fail_on = config.report.fail_on()?;
    let backend_url = metrics::prometheus::sanitize_url(
        config.backend.url.as_deref().unwrap_or_default(),
    );

    let orchestrator_config = config.engine.orchestrator();
    let probe_timeout = orchestrator_config.health_probe_timeout;
    match tokio::time::timeout(probe_timeout, provider.health()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(MonitorError::BackendUnreachable(e).into()),
        Err(_) => return Err(MonitorError::HealthTimeout(probe_timeout).into()),
    }

    let orchestrator = Arc::new(Orchestrator::new(provider, registry, orchestrator_config));
    let cancel = CancellationToken::new();
    let engine = orchestrator.spawn(cancel.clone());

    let wait = config.report.first_cycle_wait();
    if tokio::time::timeout(wait, orchestrator.changed()).await.is_err() {
        tracing::warn!(?wait, "no detection results before deadline, reporting current state");
    }
    cancel.cancel();
    engine.await.context("orchestrator task panicked")?;

    let stats = orchestrator.health_stats().await;
    if stats.query_count > 0 && stats.error_count == stats.query_count {
        return Err(MonitorError::AllQueriesFailed {
            failed: stats.error_count,
        }
        .into());
    }

    let problems = report::filter_min_severity(orchestrator.problems().await, min_severity);

    if let Some(path) = &opts.save_baseline {
        let metadata = BTreeMap::from([
            ("prometheus_url".to_string(), backend_url.clone()),
            ("version".to_string(), env!("CARGO_PKG_VERSION").to_string()),
        ]);
        baseline::Baseline::new(problems.clone(), metadata).save(path)?;
    }

    if let Some(path) = &opts.compare_baseline {
        let base = baseline::Baseline::load(path)?;
        let comparison = baseline::compare(&problems, &base);
        let drift = DriftReport {
            metadata: DriftMetadata {
                prometheus_url: backend_url,
                timestamp: Utc::now(),
                baseline_time: base.timestamp,
            },
            comparison,
        };
        writeln!(out, "{}", serde_json::to_string_pretty(&drift)?)?;
        return Ok(report::evaluate_drift(&drift.comparison, opts.fail_on_drift));
    }

    let report = Report::new(
        ReportMetadata {
            prometheus_url: backend_url,
            timestamp: Utc::now(),
            refresh_interval: format!("{}s", config.engine.refresh_interval().as_secs()),
        },
        problems,
    );
    writeln!(out, "{}", report.to_json()?)?;

    if let Some(path) = &opts.export_file {
        report.export(path)?;
        tracing::info!(path = %path.display(), "report exported");
    }

    Ok(report::evaluate_gate(&report.problems, fail_on))
}
