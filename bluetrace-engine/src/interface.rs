//! Controller interface bring-up and discovery.
//!
//! Bring-up is best effort: the supervisor logs a failure and still attempts
//! capture, since the interface may already be up or come up on its own.

use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::{sleep, timeout};
use tracing::{debug, info};

use bluetrace_capture::source::is_valid_interface_name;
use bluetrace_capture::RenderedCommand;
use bluetrace_config::{CommandConfig, InterfaceConfig};

#[derive(Debug, Error)]
pub enum BringUpError {
    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("{program} did not finish within {waited:?}")]
    TimedOut { program: String, waited: Duration },
}

/// Brings a controller interface into a state where it can be captured.
#[async_trait]
pub trait InterfaceControl: Send + Sync {
    async fn bring_up(&self, interface: &str) -> Result<(), BringUpError>;
}

/// Runs the configured bring-up command, then waits for the interface to settle.
#[derive(Debug, Clone)]
pub struct ShellInterfaceControl {
    command: CommandConfig,
    timeout: Duration,
    settle: Duration,
}

impl ShellInterfaceControl {
    pub fn new(config: &InterfaceConfig) -> Self {
        Self {
            command: config.bring_up.clone(),
            timeout: Duration::from_millis(config.bring_up_timeout_ms),
            settle: Duration::from_millis(config.settle_ms),
        }
    }
}

#[async_trait]
impl InterfaceControl for ShellInterfaceControl {
    async fn bring_up(&self, interface: &str) -> Result<(), BringUpError> {
        if !self.command.enabled {
            debug!(interface, "Interface bring-up disabled");
            return Ok(());
        }

        let rendered = RenderedCommand::render(&self.command, Some(interface), Path::new(""));
        let program = rendered.program.clone();
        let child = Command::new(&rendered.program)
            .args(&rendered.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| BringUpError::Spawn {
                program: program.clone(),
                source,
            })?;

        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output.map_err(|source| BringUpError::Spawn {
                program: program.clone(),
                source,
            })?,
            Err(_) => {
                return Err(BringUpError::TimedOut {
                    program,
                    waited: self.timeout,
                })
            }
        };

        if !output.status.success() {
            return Err(BringUpError::Failed {
                program,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        info!(interface, "Interface brought up");
        sleep(self.settle).await;
        Ok(())
    }
}

/// Lists controller interfaces (`hci*` entries under `sysfs_root`), sorted by
/// name. A missing root means no controllers.
pub fn enumerate_interfaces(sysfs_root: &Path) -> io::Result<Vec<String>> {
    let entries = match std::fs::read_dir(sysfs_root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut interfaces = Vec::new();
    for entry in entries {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if name.starts_with("hci") && !name.contains(':') && is_valid_interface_name(&name) {
            interfaces.push(name);
        }
    }
    interfaces.sort();
    Ok(interfaces)
}
