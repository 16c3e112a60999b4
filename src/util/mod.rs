//! Shared utilities.

pub mod clock;
pub mod telemetry;

pub use clock::{Clock, ClockMode};
pub use telemetry::{init_tracing, init_tracing_with};
