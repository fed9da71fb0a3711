//! ## bluetrace-telemetry::metrics
//! **Prometheus counters for the capture pipeline**
//!
//! Tracks what the tailer delivered and how the supervisor's processes fared.
//! Every recorder owns its own registry, so several supervisors (or tests)
//! never collide on metric names.

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

#[derive(Debug, Clone)]
pub struct MetricsRecorder {
    pub registry: Registry,
    pub chunks_published: IntCounter,
    pub bytes_published: IntCounter,
    pub discontinuities: IntCounter,
    pub spawn_failures: IntCounter,
    pub interface_switches: IntCounter,
    pub running_processes: IntGauge,
    pub subscribers: IntGauge,
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRecorder {
    pub fn new() -> Self {
        let registry = Registry::new();

        let chunks_published = counter(
            &registry,
            "bluetrace_chunks_published_total",
            "Incremental chunks delivered to subscribers",
        );
        let bytes_published = counter(
            &registry,
            "bluetrace_bytes_published_total",
            "Bytes read from the packet-dump output and published",
        );
        let discontinuities = counter(
            &registry,
            "bluetrace_discontinuities_total",
            "Truncations or rotations detected under the tailer",
        );
        let spawn_failures = counter(
            &registry,
            "bluetrace_spawn_failures_total",
            "Capture processes that failed to start",
        );
        let interface_switches = counter(
            &registry,
            "bluetrace_interface_switches_total",
            "Completed interface selections that started a packet dump",
        );
        let running_processes = gauge(
            &registry,
            "bluetrace_running_processes",
            "Capture processes currently alive",
        );
        let subscribers = gauge(
            &registry,
            "bluetrace_subscribers",
            "Subscribers attached to the tail stream",
        );

        Self {
            registry,
            chunks_published,
            bytes_published,
            discontinuities,
            spawn_failures,
            interface_switches,
            running_processes,
            subscribers,
        }
    }

    pub fn gather_metrics(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::<u8>::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    pub fn record_chunk(&self, bytes: usize) {
        self.chunks_published.inc();
        self.bytes_published.inc_by(bytes as u64);
    }
}

// Names are static and unique within a fresh registry, so neither call can fail.
fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("valid counter definition");
    registry
        .register(Box::new(counter.clone()))
        .expect("counter registered once");
    counter
}

fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).expect("valid gauge definition");
    registry
        .register(Box::new(gauge.clone()))
        .expect("gauge registered once");
    gauge
}
