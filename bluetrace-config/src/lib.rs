//! # Bluetrace Configuration System
//!
//! Hierarchical configuration for the Bluetooth diagnostic capture supervisor.
//!
//! ## Features
//! - **Unified Configuration**: Single source of truth across all components
//! - **Validation**: Field ranges and command templates checked on load
//! - **Environment Awareness**: `BLUETRACE_*` variables override file values

#![warn(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

mod capture;
mod error;
mod interface;
mod tailer;
mod telemetry;
mod validation;

pub use capture::CaptureConfig;
pub use capture::CommandConfig;
pub use capture::SourcesConfig;
pub use error::ConfigError;
pub use interface::InterfaceConfig;
pub use tailer::TailerConfig;
pub use tailer::WatchConfig;
pub use telemetry::TelemetryConfig;

/// Substituted with the bound controller interface name.
pub const INTERFACE_PLACEHOLDER: &str = "{interface}";

/// Substituted with the path of the source's output file.
pub const OUTPUT_PLACEHOLDER: &str = "{output}";

/// Top‑level configuration container for all Bluetrace components.
#[derive(Debug, Serialize, Deserialize, Validate, Default, Clone)]
pub struct BluetraceConfig {
    /// Capture sources and session directory.
    #[validate(nested)]
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Packet-dump tailing.
    #[validate(nested)]
    #[serde(default)]
    pub tailer: TailerConfig,

    /// Controller interface bring-up and enumeration.
    #[validate(nested)]
    #[serde(default)]
    pub interface: InterfaceConfig,

    /// Fallback file-change notifier.
    #[validate(nested)]
    #[serde(default)]
    pub watch: WatchConfig,

    /// Logging.
    #[validate(nested)]
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl BluetraceConfig {
    /// Load configuration from default files and environment.
    ///
    /// Hierarchy:
    /// 1. Default Values
    /// 2. `config/bluetrace.yaml` - Base settings. If missing, defaults are used.
    /// 3. `config/<environment>.yaml` - Environment‑specific overrides (`BLUETRACE_ENV`).
    /// 4. `BLUETRACE_*` environment variables, `__` separating nested keys.
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(BluetraceConfig::default()));

        if Path::new("config/bluetrace.yaml").exists() {
            figment = figment.merge(Yaml::file("config/bluetrace.yaml"));
        }

        let env = std::env::var("BLUETRACE_ENV").unwrap_or_else(|_| "production".into());
        let env_file = format!("config/{}.yaml", env);
        if Path::new(&env_file).exists() {
            figment = figment.merge(Yaml::file(env_file));
        }

        Self::extract(figment.merge(Env::prefixed("BLUETRACE_").split("__")))
    }

    /// Load configuration from a specific file, still honouring environment overrides.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(PathBuf::from(path)));
        }

        Self::extract(
            Figment::from(Serialized::defaults(BluetraceConfig::default()))
                .merge(Yaml::file(path))
                .merge(Env::prefixed("BLUETRACE_").split("__")),
        )
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract()?;
        config.check()?;
        Ok(config)
    }

    /// Run field validation plus the constraints that span several fields.
    pub fn check(&self) -> Result<(), ConfigError> {
        self.validate()?;
        if self.tailer.attach_backoff_initial_ms > self.tailer.attach_backoff_max_ms {
            return Err(ConfigError::Inconsistent(format!(
                "tailer.attach_backoff_initial_ms ({}) exceeds tailer.attach_backoff_max_ms ({})",
                self.tailer.attach_backoff_initial_ms, self.tailer.attach_backoff_max_ms
            )));
        }
        Ok(())
    }

    /// Render the effective configuration as YAML.
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.capture.stop_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn full_config_validation() {
        let config = BluetraceConfig::default();
        config.check().expect("Default config should validate");
    }

    #[test]
    fn environment_override() {
        std::env::set_var("BLUETRACE_TAILER__READ_CHUNK_BYTES", "8192");
        let config = BluetraceConfig::load().unwrap();
        std::env::remove_var("BLUETRACE_TAILER__READ_CHUNK_BYTES");
        assert_eq!(config.tailer.read_chunk_bytes, 8192);
    }

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "capture:\n  log_dir: /var/tmp/bt\n  sources:\n    packet_dump:\n      program: btmon\n      args: [\"-i\", \"{{interface}}\", \"-w\", \"{{output}}\"]\n"
        )
        .unwrap();

        let config = BluetraceConfig::load_from_path(file.path()).unwrap();
        assert_eq!(config.capture.log_dir, PathBuf::from("/var/tmp/bt"));
        assert_eq!(config.capture.sources.packet_dump.program, "btmon");
        assert!(config.capture.sources.packet_dump.mentions(OUTPUT_PLACEHOLDER));
        // Untouched sections keep their defaults.
        assert_eq!(config.capture.sources.bus_monitor.program, "dbus-monitor");
        assert_eq!(config.capture.stop_grace_ms, 2000);
    }

    #[test]
    fn missing_file_is_reported() {
        let err = BluetraceConfig::load_from_path("/nonexistent/bluetrace.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    fn inverted_backoff_is_rejected() {
        let mut config = BluetraceConfig::default();
        config.tailer.attach_backoff_initial_ms = 900;
        config.tailer.attach_backoff_max_ms = 100;
        assert!(matches!(
            config.check(),
            Err(ConfigError::Inconsistent(_))
        ));
    }

    #[test]
    fn renders_yaml() {
        let yaml = BluetraceConfig::default().to_yaml().unwrap();
        assert!(yaml.contains("hcidump"));
        assert!(yaml.contains("poll_interval_ms"));
    }
}
