//! # Bluetrace Telemetry
//!
//! Crate for the tool's own logging and metrics. Captured radio telemetry
//! never flows through here; this is where the supervisor reports on itself.

pub mod logging;
pub mod metrics;

pub use logging::EventLogger;
pub use metrics::MetricsRecorder;
