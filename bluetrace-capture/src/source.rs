//! Capture source kinds and command rendering.

use std::fmt;
use std::path::{Path, PathBuf};

use bluetrace_config::{CommandConfig, SourcesConfig, INTERFACE_PLACEHOLDER, OUTPUT_PLACEHOLDER};

/// The four kinds of diagnostic telemetry the tool collects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SourceKind {
    /// System bus traffic.
    BusMonitor,
    /// Bluetooth protocol daemon log.
    DaemonLog,
    /// Audio routing daemon log.
    AudioLog,
    /// Link-layer packet trace of the bound interface.
    PacketDump,
}

impl SourceKind {
    pub const ALL: [SourceKind; 4] = [
        SourceKind::BusMonitor,
        SourceKind::DaemonLog,
        SourceKind::AudioLog,
        SourceKind::PacketDump,
    ];

    /// Sources that run for the whole session regardless of interface.
    pub const ALWAYS_ON: [SourceKind; 3] = [
        SourceKind::BusMonitor,
        SourceKind::DaemonLog,
        SourceKind::AudioLog,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::BusMonitor => "bus-monitor",
            SourceKind::DaemonLog => "daemon-log",
            SourceKind::AudioLog => "audio-log",
            SourceKind::PacketDump => "packet-dump",
        }
    }

    pub fn is_interface_scoped(&self) -> bool {
        matches!(self, SourceKind::PacketDump)
    }

    /// The configured command for this kind.
    pub fn command<'a>(&self, sources: &'a SourcesConfig) -> &'a CommandConfig {
        match self {
            SourceKind::BusMonitor => &sources.bus_monitor,
            SourceKind::DaemonLog => &sources.daemon_log,
            SourceKind::AudioLog => &sources.audio_log,
            SourceKind::PacketDump => &sources.packet_dump,
        }
    }

    /// Output file location inside a session directory.
    pub fn output_path(&self, session_dir: &Path, interface: Option<&str>) -> PathBuf {
        let name = match (self, interface) {
            (SourceKind::BusMonitor, _) => "dbus.log".to_string(),
            (SourceKind::DaemonLog, _) => "bluetoothd.log".to_string(),
            (SourceKind::AudioLog, _) => "pulseaudio.log".to_string(),
            (SourceKind::PacketDump, Some(interface)) => format!("hcidump-{}.log", interface),
            (SourceKind::PacketDump, None) => "hcidump.log".to_string(),
        };
        session_dir.join(name)
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether `name` can be an interface identifier.
pub fn is_valid_interface_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 15
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
}

/// A command with its placeholders substituted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedCommand {
    pub program: String,
    pub args: Vec<String>,
    /// The command writes its output file itself (`{output}` was present);
    /// otherwise its stdout must be redirected into the file.
    pub writes_output: bool,
}

impl RenderedCommand {
    pub fn render(command: &CommandConfig, interface: Option<&str>, output: &Path) -> Self {
        let output = output.to_string_lossy();
        let args = command
            .args
            .iter()
            .map(|arg| {
                let arg = arg.replace(OUTPUT_PLACEHOLDER, &output);
                match interface {
                    Some(interface) => arg.replace(INTERFACE_PLACEHOLDER, interface),
                    None => arg,
                }
            })
            .collect();

        Self {
            program: command.program.clone(),
            args,
            writes_output: command.mentions(OUTPUT_PLACEHOLDER),
        }
    }
}
