//! Operational concerns: telemetry initialization.

pub mod telemetry;
