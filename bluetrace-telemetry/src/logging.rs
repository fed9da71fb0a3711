//! ## bluetrace-telemetry::logging
//! **Structured logging with `tracing`**
//!
//! The subscriber honours `RUST_LOG` and otherwise falls back to the configured
//! level. Lifecycle events (capture started/stopped, interface selected,
//! discontinuities, cleanup) are recorded through [`EventLogger::log_event`]
//! with OpenTelemetry key/value metadata.

use opentelemetry::KeyValue;
use tracing::{info_span, Instrument};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Clone)]
pub struct EventLogger;

impl EventLogger {
    /// Installs the global subscriber. Subsequent calls are ignored.
    pub fn init(default_level: &str) {
        let _ = fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new(default_level)),
            )
            .with_writer(std::io::stderr)
            .with_thread_names(true)
            .with_span_events(FmtSpan::NONE)
            .try_init();
    }

    #[inline]
    pub async fn log_event(event_type: &str, metadata: Vec<KeyValue>) {
        let span = info_span!(
            "capture_event",
            event_type = event_type,
            otel.kind = "INTERNAL"
        );

        async {
            tracing::info!(
                metadata = ?metadata,
                "Capture lifecycle event"
            );
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[traced_test]
    #[test]
    fn test_logging() {
        tokio::runtime::Runtime::new()
            .unwrap()
            .block_on(EventLogger::log_event(
                "capture_started",
                vec![KeyValue::new("kind", "packet-dump")],
            ));
        assert!(logs_contain("Capture lifecycle event"));
        assert!(logs_contain("packet-dump"));
    }
}
