//! Tests for utility functions

use coop_runtime::util::{init_tracing, init_tracing_with, Clock, ClockMode};
use std::time::Duration;

#[test]
fn test_clock_mode_parsing() {
    assert_eq!("virtual".parse::<ClockMode>().unwrap(), ClockMode::Virtual);
    assert_eq!(" WALL ".parse::<ClockMode>().unwrap(), ClockMode::Wall);
    assert!("monotonic".parse::<ClockMode>().is_err());
    assert_eq!(ClockMode::default(), ClockMode::Virtual);
    assert_eq!(ClockMode::Wall.to_string(), "wall");
}

#[test]
fn test_clock_mode_serde() {
    assert_eq!(serde_json::to_string(&ClockMode::Virtual).unwrap(), "\"virtual\"");
    let mode: ClockMode = serde_json::from_str("\"wall\"").unwrap();
    assert_eq!(mode, ClockMode::Wall);
}

#[test]
fn test_virtual_clock_never_moves_backwards() {
    let mut clock = Clock::new(ClockMode::Virtual);
    assert_eq!(clock.now(), Duration::ZERO);
    clock.advance_to(Duration::from_secs(5));
    clock.advance_to(Duration::from_secs(2));
    assert_eq!(clock.now(), Duration::from_secs(5));
    assert_eq!(clock.mode(), ClockMode::Virtual);
}

#[test]
fn test_wall_clock_sleeps_until_deadline() {
    let mut clock = Clock::new(ClockMode::Wall);
    clock.advance_to(Duration::from_millis(20));
    assert!(clock.now() >= Duration::from_millis(20));
}

#[test]
fn test_init_tracing_is_idempotent() {
    init_tracing();
    init_tracing_with("coop_runtime=debug");
    tracing::info!("tracing initialized twice without panicking");
}
