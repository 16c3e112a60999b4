//! Tests for configuration validation and loading

use coop_runtime::config::{default_worker_count, RuntimeConfig, SchedulerConfig, WorkerPoolConfig};
use coop_runtime::util::ClockMode;
use std::collections::HashMap;

#[test]
fn test_pool_config_defaults() {
    let config = WorkerPoolConfig::default();
    assert_eq!(config.worker_count, default_worker_count());
    assert!(config.worker_count >= 1 && config.worker_count <= 32);
    assert_eq!(config.max_queue_depth, None);
    assert_eq!(config.thread_name(2), "coop-worker-2");
    assert!(config.validate().is_ok());
}

#[test]
fn test_pool_config_invalid_worker_count() {
    let invalid = WorkerPoolConfig::new().with_worker_count(0);
    assert!(invalid.validate().is_err());
}

#[test]
fn test_pool_config_invalid_queue_depth() {
    let invalid = WorkerPoolConfig::new().with_max_queue_depth(0);
    assert!(invalid.validate().is_err());
}

#[test]
fn test_pool_config_invalid_thread_prefix() {
    let invalid = WorkerPoolConfig::new().with_thread_name_prefix("  ");
    assert!(invalid.validate().is_err());
}

#[test]
fn test_scheduler_config_validation() {
    assert!(SchedulerConfig::default().validate().is_ok());
    assert!(SchedulerConfig::default().with_name("ingest").validate().is_ok());
    assert!(SchedulerConfig::default().with_name("").validate().is_err());
}

#[test]
fn test_runtime_config_from_json() {
    let json = r#"{
        "scheduler": { "name": "crawler", "clock": "wall" },
        "pool": { "worker_count": 8, "max_queue_depth": 100 }
    }"#;
    let config = RuntimeConfig::from_json_str(json).unwrap();
    assert_eq!(config.scheduler.name.as_deref(), Some("crawler"));
    assert_eq!(config.scheduler.clock, ClockMode::Wall);
    assert_eq!(config.pool.worker_count, 8);
    assert_eq!(config.pool.max_queue_depth, Some(100));
    assert_eq!(config.pool.thread_name_prefix, "coop-worker");
}

#[test]
fn test_runtime_config_json_defaults() {
    let config = RuntimeConfig::from_json_str("{}").unwrap();
    assert_eq!(config, RuntimeConfig::default());
    assert_eq!(config.scheduler.clock, ClockMode::Virtual);
}

#[test]
fn test_runtime_config_json_rejects_invalid() {
    let err = RuntimeConfig::from_json_str(r#"{ "pool": { "worker_count": 0 } }"#).unwrap_err();
    assert!(err.starts_with("pool invalid"), "{err}");

    let err = RuntimeConfig::from_json_str("{ not json").unwrap_err();
    assert!(err.starts_with("parse error"), "{err}");
}

#[test]
fn test_runtime_config_from_lookup() {
    let vars: HashMap<&str, &str> = [
        ("COOP_WORKERS", "6"),
        ("COOP_QUEUE_DEPTH", " 12 "),
        ("COOP_CLOCK", "Wall"),
        ("COOP_SCHEDULER_NAME", "batch"),
    ]
    .into_iter()
    .collect();
    let config = RuntimeConfig::from_lookup(|key| vars.get(key).map(ToString::to_string)).unwrap();

    assert_eq!(config.pool.worker_count, 6);
    assert_eq!(config.pool.max_queue_depth, Some(12));
    assert_eq!(config.scheduler.clock, ClockMode::Wall);
    assert_eq!(config.scheduler.name.as_deref(), Some("batch"));
}

#[test]
fn test_runtime_config_from_lookup_rejects_bad_values() {
    let err = RuntimeConfig::from_lookup(|key| (key == "COOP_WORKERS").then(|| "many".to_string()))
        .unwrap_err();
    assert!(err.contains("COOP_WORKERS"), "{err}");

    let err = RuntimeConfig::from_lookup(|key| (key == "COOP_CLOCK").then(|| "sundial".to_string()))
        .unwrap_err();
    assert!(err.contains("sundial"), "{err}");

    let err = RuntimeConfig::from_lookup(|key| (key == "COOP_WORKERS").then(|| "0".to_string()))
        .unwrap_err();
    assert!(err.starts_with("pool invalid"), "{err}");
}
