//! Baseline snapshots on disk and drift runs through batch mode.

use std::collections::BTreeMap;
use std::sync::Arc;

use infratriage::baseline::{compare, Baseline, BaselineError};
use infratriage::config::Config;
use infratriage::detect::kubernetes::OomKillDetector;
use infratriage::detect::Registry;
use infratriage::metrics::{MockProvider, Sample};
use infratriage::problem::{Problem, Severity};
use infratriage::report::ExitStatus;
use infratriage::MonitorOptions;

fn problem(id: &str) -> Problem {
    Problem {
        id: id.to_string(),
        entity: id.to_string(),
        severity: Severity::Critical,
        count: 3,
        ..Default::default()
    }
}

#[test]
fn test_save_then_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("baseline.json");

    let metadata = BTreeMap::from([("version".to_string(), "test".to_string())]);
    let saved = Baseline::new(vec![problem("a"), problem("b")], metadata);
    saved.save(&path).unwrap();

    let loaded = Baseline::load(&path).unwrap();
    assert_eq!(loaded.timestamp, saved.timestamp);
    assert_eq!(loaded.problems, saved.problems);
    assert_eq!(loaded.metadata["version"], "test");
}

#[test]
fn test_load_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let err = Baseline::load(&dir.path().join("nope.json")).unwrap_err();
    assert!(matches!(err, BaselineError::Io { .. }));
}

#[test]
fn test_load_malformed_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.json");
    std::fs::write(&path, "{ not json").unwrap();

    let err = Baseline::load(&path).unwrap_err();
    assert!(matches!(err, BaselineError::Json { .. }));
    assert!(err.to_string().contains("broken.json"));
}

#[test]
fn test_loaded_baseline_compares() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("baseline.json");
    Baseline::new(vec![problem("old"), problem("kept")], BTreeMap::new())
        .save(&path)
        .unwrap();

    let loaded = Baseline::load(&path).unwrap();
    let comp = compare(&[problem("kept"), problem("new")], &loaded);
    assert_eq!(comp.summary.new_count, 1);
    assert_eq!(comp.summary.resolved_count, 1);
    assert_eq!(comp.summary.unchanged_count, 1);
}

fn oom_cluster() -> MockProvider {
    MockProvider::new().with_instant(|query, _| {
        if query.contains("OOMKilled") {
            Ok(vec![Sample::new(
                &[("namespace", "prod"), ("pod", "api-0"), ("container", "app")],
                1.0,
            )])
        } else {
            Ok(Vec::new())
        }
    })
}

async fn oom_registry() -> Registry {
    let registry = Registry::new();
    registry.register(OomKillDetector::new()).await;
    registry
}

fn config() -> Config {
    let mut config = Config::default();
    config.backend.url = Some("http://localhost:9090".into());
    config.report.first_cycle_wait_secs = 5;
    config
}

#[tokio::test]
async fn test_monitor_saves_then_detects_no_drift() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("baseline.json");

    let save = MonitorOptions {
        save_baseline: Some(path.clone()),
        ..Default::default()
    };
    let mut out = Vec::new();
    infratriage::monitor(&config(), Arc::new(oom_cluster()), oom_registry().await, &save, &mut out)
        .await
        .unwrap();
    let saved = Baseline::load(&path).unwrap();
    assert_eq!(saved.problems.len(), 1);
    assert_eq!(saved.metadata["prometheus_url"], "http://localhost:9090/");

    let compare = MonitorOptions {
        compare_baseline: Some(path),
        fail_on_drift: true,
        ..Default::default()
    };
    let mut out = Vec::new();
    let status = infratriage::monitor(
        &config(),
        Arc::new(oom_cluster()),
        oom_registry().await,
        &compare,
        &mut out,
    )
    .await
    .unwrap();

    assert_eq!(status, ExitStatus::Ok);
    let report: serde_json::Value = serde_json::from_slice(&out).unwrap();
    assert_eq!(report["comparison"]["summary"]["unchanged_count"], 1);
    assert_eq!(report["comparison"]["summary"]["new_count"], 0);
}

#[tokio::test]
async fn test_monitor_fails_on_drift() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty.json");
    Baseline::new(Vec::new(), BTreeMap::new()).save(&path).unwrap();

    let opts = MonitorOptions {
        compare_baseline: Some(path),
        fail_on_drift: true,
        ..Default::default()
    };
    let mut out = Vec::new();
    let status = infratriage::monitor(
        &config(),
        Arc::new(oom_cluster()),
        oom_registry().await,
        &opts,
        &mut out,
    )
    .await
    .unwrap();

    assert_eq!(status, ExitStatus::Gate);
    let report: serde_json::Value = serde_json::from_slice(&out).unwrap();
    assert_eq!(report["comparison"]["new"][0]["id"], "prod/api-0/app/oomkill");
}

#[tokio::test]
async fn test_monitor_export_file_matches_stdout() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("report.json");
    let opts = MonitorOptions {
        export_file: Some(path.clone()),
        ..Default::default()
    };
    let mut out = Vec::new();
    infratriage::monitor(&config(), Arc::new(oom_cluster()), oom_registry().await, &opts, &mut out)
        .await
        .unwrap();

    let exported = std::fs::read(&path).unwrap();
    assert_eq!(exported, out);
}
