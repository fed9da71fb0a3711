// bluetrace-config/src/capture.rs
//! Capture source configuration.
//!
//! Describes the external commands that produce diagnostic telemetry:
//! - Session-scoped sources (bus monitor, daemon log, audio log)
//! - The interface-scoped packet dump
//!
//! Command arguments may reference `{interface}` (the bound controller) and
//! `{output}` (the file the source writes to). A command that does not mention
//! `{output}` has its standard output redirected into the file instead.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use validator::{self, Validate};

use crate::validation;

/// Capture configuration.
#[derive(Debug, Serialize, Deserialize, Validate, Clone)]
pub struct CaptureConfig {
    /// Root directory for logging sessions.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Grace period between SIGTERM and SIGKILL when stopping a source (milliseconds).
    #[validate(range(min = 1, max = 60000))]
    #[serde(default = "default_stop_grace")]
    pub stop_grace_ms: u64,

    /// Commands for every capture source.
    #[validate(nested)]
    #[serde(default)]
    pub sources: SourcesConfig,
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/tmp/bluetrace")
}

fn default_stop_grace() -> u64 {
    2000
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            stop_grace_ms: default_stop_grace(),
            sources: SourcesConfig::default(),
        }
    }
}

/// One command per capture source.
#[derive(Debug, Serialize, Deserialize, Validate, Clone)]
pub struct SourcesConfig {
    /// System bus monitor.
    #[validate(nested)]
    #[validate(custom(function = validation::validate_session_scoped))]
    #[serde(default = "default_bus_monitor")]
    pub bus_monitor: CommandConfig,

    /// Bluetooth daemon log tap.
    #[validate(nested)]
    #[validate(custom(function = validation::validate_session_scoped))]
    #[serde(default = "default_daemon_log")]
    pub daemon_log: CommandConfig,

    /// Audio routing daemon log tap.
    #[validate(nested)]
    #[validate(custom(function = validation::validate_session_scoped))]
    #[serde(default = "default_audio_log")]
    pub audio_log: CommandConfig,

    /// Link-layer packet dump for the bound interface.
    #[validate(nested)]
    #[validate(custom(function = validation::validate_interface_scoped))]
    #[serde(default = "default_packet_dump")]
    pub packet_dump: CommandConfig,
}

fn default_bus_monitor() -> CommandConfig {
    CommandConfig::new("dbus-monitor", &["--system"])
}

fn default_daemon_log() -> CommandConfig {
    CommandConfig::new("journalctl", &["-f", "-n", "0", "-u", "bluetooth"])
}

fn default_audio_log() -> CommandConfig {
    CommandConfig::new("journalctl", &["-f", "-n", "0", "--user-unit", "pulseaudio"])
}

fn default_packet_dump() -> CommandConfig {
    CommandConfig::new("hcidump", &["-i", "{interface}", "-t", "-X"])
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            bus_monitor: default_bus_monitor(),
            daemon_log: default_daemon_log(),
            audio_log: default_audio_log(),
            packet_dump: default_packet_dump(),
        }
    }
}

/// An external command with placeholder-bearing arguments.
#[derive(Debug, Serialize, Deserialize, Validate, Clone, PartialEq, Eq)]
pub struct CommandConfig {
    /// Whether the source is started at all.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Program name or path.
    #[validate(custom(function = validation::validate_program))]
    pub program: String,

    /// Arguments, possibly containing `{interface}` / `{output}`.
    #[validate(custom(function = validation::validate_placeholders))]
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

impl CommandConfig {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            enabled: true,
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Whether any argument contains `placeholder`.
    pub fn mentions(&self, placeholder: &str) -> bool {
        self.args.iter().any(|arg| arg.contains(placeholder))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        CaptureConfig::default()
            .validate()
            .expect("default capture config should validate");
    }

    #[test]
    fn packet_dump_requires_interface_placeholder() {
        let mut config = CaptureConfig::default();
        config.sources.packet_dump = CommandConfig::new("hcidump", &["-t"]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn session_sources_reject_interface_placeholder() {
        let mut config = CaptureConfig::default();
        config.sources.bus_monitor = CommandConfig::new("dbus-monitor", &["{interface}"]);
        assert!(config.validate().is_err());
    }
}
