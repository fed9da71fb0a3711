//! Lifecycle of one external capture command.
//!
//! A `CaptureProcess` owns at most one live child at a time. Starting a
//! running instance is a no-op that reports the existing pid; stopping sends
//! SIGTERM, waits for a bounded grace period and escalates to SIGKILL.
//! Liveness is always reconciled against the OS, so a process that died on its
//! own is noticed on the next check.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use bluetrace_config::CommandConfig;

use crate::error::CaptureError;
use crate::source::{is_valid_interface_name, RenderedCommand, SourceKind};

/// Arguments for one start request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureArgs {
    /// Interface to bind; required for interface-scoped sources.
    pub interface: Option<String>,
    /// File the source's output lands in.
    pub output: PathBuf,
}

impl CaptureArgs {
    pub fn session(output: impl Into<PathBuf>) -> Self {
        Self {
            interface: None,
            output: output.into(),
        }
    }

    pub fn bound(interface: impl Into<String>, output: impl Into<PathBuf>) -> Self {
        Self {
            interface: Some(interface.into()),
            output: output.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started { pid: u32 },
    /// A live process already exists; nothing was spawned.
    AlreadyRunning { pid: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The process was terminated; `forced` when SIGKILL was needed.
    Stopped {
        status: Option<ExitStatus>,
        forced: bool,
    },
    /// Nothing was running (never started, already stopped, or exited on its own).
    AlreadyStopped,
}

pub struct CaptureProcess {
    kind: SourceKind,
    command: CommandConfig,
    grace: Duration,
    child: Option<Child>,
    pid: Option<u32>,
    interface: Option<String>,
    output: Option<PathBuf>,
    last_exit: Option<ExitStatus>,
}

impl CaptureProcess {
    pub fn new(kind: SourceKind, command: CommandConfig, grace: Duration) -> Self {
        Self {
            kind,
            command,
            grace,
            child: None,
            pid: None,
            interface: None,
            output: None,
            last_exit: None,
        }
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Interface the current (or last) process was bound to.
    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    pub fn output(&self) -> Option<&Path> {
        self.output.as_deref()
    }

    /// Exit status of the previous process, once it has been reaped.
    pub fn last_exit(&self) -> Option<ExitStatus> {
        self.last_exit
    }

    /// Spawns the command unless a live process already exists.
    ///
    /// Must be called from within a Tokio runtime: the child is reaped and its
    /// stderr forwarded by the runtime.
    ///
    /// Errors
    /// - [`CaptureError::InvalidInterface`] when an interface-scoped source
    ///   has no usable interface name.
    /// - [`CaptureError::ExecutableNotFound`] / [`CaptureError::PermissionDenied`]
    ///   for the corresponding spawn failures.
    /// - [`CaptureError::Output`] if the output file cannot be prepared.
    pub fn start(&mut self, args: CaptureArgs) -> Result<StartOutcome, CaptureError> {
        if self.is_running() {
            let pid = self.pid.unwrap_or_default();
            debug!(kind = %self.kind, pid, "Start requested while running");
            return Ok(StartOutcome::AlreadyRunning { pid });
        }

        let interface = match (self.kind.is_interface_scoped(), args.interface) {
            (true, Some(name)) if is_valid_interface_name(&name) => Some(name),
            (true, name) => {
                return Err(CaptureError::InvalidInterface {
                    kind: self.kind,
                    name: name.unwrap_or_default(),
                })
            }
            (false, _) => None,
        };

        let rendered = RenderedCommand::render(&self.command, interface.as_deref(), &args.output);
        let stdout = self.prepare_output(&args.output, rendered.writes_output)?;

        let mut command = Command::new(&rendered.program);
        command
            .args(&rendered.args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| CaptureError::from_spawn(self.kind, &rendered.program, e))?;
        let pid = child.id().unwrap_or_default();

        if let Some(stderr) = child.stderr.take() {
            forward_stderr(self.kind, stderr);
        }

        info!(
            kind = %self.kind,
            pid,
            program = %rendered.program,
            output = %args.output.display(),
            "Capture process started"
        );
        self.child = Some(child);
        self.pid = Some(pid);
        self.interface = interface;
        self.output = Some(args.output);
        Ok(StartOutcome::Started { pid })
    }

    /// Current liveness, reconciled with the OS.
    pub fn is_running(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                warn!(kind = %self.kind, pid = ?self.pid, %status, "Capture process exited on its own");
                self.last_exit = Some(status);
                self.child = None;
                false
            }
            Err(e) => {
                warn!(kind = %self.kind, "Unable to query capture process: {e}");
                true
            }
        }
    }

    /// Terminates the process: SIGTERM, then SIGKILL after the grace period.
    /// Stopping a stopped instance is a no-op.
    #[instrument(level = "debug", skip_all, fields(kind = %self.kind))]
    pub async fn stop(&mut self) -> Result<StopOutcome, CaptureError> {
        if !self.is_running() {
            return Ok(StopOutcome::AlreadyStopped);
        }
        let Some(mut child) = self.child.take() else {
            return Ok(StopOutcome::AlreadyStopped);
        };

        if let Some(pid) = child.id() {
            match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(source) => {
                    self.child = Some(child);
                    return Err(CaptureError::Signal {
                        kind: self.kind,
                        pid,
                        source,
                    });
                }
            }
        }

        let (status, forced) = match timeout(self.grace, child.wait()).await {
            Ok(Ok(status)) => (Some(status), false),
            Ok(Err(source)) => {
                return Err(CaptureError::Wait {
                    kind: self.kind,
                    source,
                })
            }
            Err(_) => {
                warn!(kind = %self.kind, grace = ?self.grace, "Grace period elapsed, killing");
                child.kill().await.map_err(|source| CaptureError::Wait {
                    kind: self.kind,
                    source,
                })?;
                (child.try_wait().ok().flatten(), true)
            }
        };

        self.last_exit = status;
        info!(kind = %self.kind, pid = ?self.pid, forced, "Capture process stopped");
        Ok(StopOutcome::Stopped { status, forced })
    }

    /// Opens the stdout target. A command that writes the file itself gets
    /// its stale file removed so readers wait for the fresh one.
    fn prepare_output(&self, output: &Path, writes_output: bool) -> Result<Stdio, CaptureError> {
        let output_error = |source| CaptureError::Output {
            kind: self.kind,
            path: output.to_path_buf(),
            source,
        };

        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent).map_err(output_error)?;
        }

        if writes_output {
            match std::fs::remove_file(output) {
                Ok(()) => debug!(path = %output.display(), "Removed stale output"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(output_error(e)),
            }
            Ok(Stdio::null())
        } else {
            let file = File::create(output).map_err(output_error)?;
            Ok(Stdio::from(file))
        }
    }
}

fn forward_stderr(kind: SourceKind, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    tokio::spawn(async move {
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(kind = %kind, "[stderr] {}", line);
        }
        debug!(kind = %kind, "stderr forwarding ended");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn shell(script: &str) -> CommandConfig {
        CommandConfig::new("sh", &["-c", script])
    }

    fn process(kind: SourceKind, script: &str) -> CaptureProcess {
        CaptureProcess::new(kind, shell(script), Duration::from_secs(2))
    }

    fn alive(pid: u32) -> bool {
        kill(Pid::from_raw(pid as i32), None).is_ok()
    }

    async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_is_idempotent_and_stop_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("dbus.log");
        let mut proc = process(SourceKind::BusMonitor, "echo signal; exec sleep 30");

        let pid = match proc.start(CaptureArgs::session(&output)).unwrap() {
            StartOutcome::Started { pid } => pid,
            other => panic!("unexpected {other:?}"),
        };
        assert!(proc.is_running());
        assert_eq!(
            proc.start(CaptureArgs::session(&output)).unwrap(),
            StartOutcome::AlreadyRunning { pid }
        );

        assert!(wait_until(|| std::fs::read_to_string(&output).unwrap_or_default() == "signal\n").await);

        match proc.stop().await.unwrap() {
            StopOutcome::Stopped { forced, .. } => assert!(!forced),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!proc.is_running());
        assert!(!alive(pid));
        assert_eq!(proc.stop().await.unwrap(), StopOutcome::AlreadyStopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unresponsive_process_is_killed_after_grace() {
        let dir = tempfile::tempdir().unwrap();
        let mut proc = CaptureProcess::new(
            SourceKind::DaemonLog,
            shell("trap '' TERM; while :; do sleep 0.05; done"),
            Duration::from_millis(150),
        );
        proc.start(CaptureArgs::session(dir.path().join("bluetoothd.log")))
            .unwrap();
        // Give the shell time to install its trap.
        tokio::time::sleep(Duration::from_millis(100)).await;

        match proc.stop().await.unwrap() {
            StopOutcome::Stopped { forced, .. } => assert!(forced),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!proc.is_running());
    }

    #[tokio::test]
    async fn exit_on_its_own_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let mut proc = process(SourceKind::AudioLog, "exit 3");
        proc.start(CaptureArgs::session(dir.path().join("pulseaudio.log")))
            .unwrap();

        assert!(wait_until(|| !proc.is_running()).await);
        assert_eq!(proc.last_exit().and_then(|s| s.code()), Some(3));
        assert_eq!(proc.stop().await.unwrap(), StopOutcome::AlreadyStopped);
    }

    #[tokio::test]
    async fn missing_executable_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut proc = CaptureProcess::new(
            SourceKind::BusMonitor,
            CommandConfig::new("bluetrace-no-such-program", &[]),
            Duration::from_secs(1),
        );
        let err = proc
            .start(CaptureArgs::session(dir.path().join("dbus.log")))
            .unwrap_err();
        assert!(matches!(err, CaptureError::ExecutableNotFound { .. }));
        assert!(!proc.is_running());
    }

    #[tokio::test]
    async fn non_executable_program_is_permission_denied() {
        let dir = tempfile::tempdir().unwrap();
        let program = dir.path().join("not-executable");
        std::fs::write(&program, "#!/bin/sh\n").unwrap();
        let mut proc = CaptureProcess::new(
            SourceKind::BusMonitor,
            CommandConfig::new(&program.to_string_lossy(), &[]),
            Duration::from_secs(1),
        );
        let err = proc
            .start(CaptureArgs::session(dir.path().join("dbus.log")))
            .unwrap_err();
        assert!(matches!(err, CaptureError::PermissionDenied { .. }));
    }

    #[tokio::test]
    async fn packet_dump_requires_an_interface() {
        let dir = tempfile::tempdir().unwrap();
        let mut proc = process(SourceKind::PacketDump, "exec sleep 30");
        let err = proc
            .start(CaptureArgs::session(dir.path().join("hcidump.log")))
            .unwrap_err();
        assert!(matches!(err, CaptureError::InvalidInterface { .. }));

        let err = proc
            .start(CaptureArgs::bound("hci 0", dir.path().join("hcidump.log")))
            .unwrap_err();
        assert!(matches!(err, CaptureError::InvalidInterface { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn self_writing_command_starts_without_stale_output() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("hcidump-hci0.log");
        std::fs::write(&output, "stale").unwrap();

        let mut proc = CaptureProcess::new(
            SourceKind::PacketDump,
            CommandConfig::new(
                "sh",
                &["-c", "sleep 0.2; echo fresh > \"$1\"; exec sleep 30", "sh", "{output}"],
            ),
            Duration::from_secs(2),
        );
        proc.start(CaptureArgs::bound("hci0", &output)).unwrap();
        assert!(!output.exists());
        assert_eq!(proc.interface(), Some("hci0"));

        assert!(wait_until(|| std::fs::read_to_string(&output).unwrap_or_default() == "fresh\n").await);
        proc.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stderr_does_not_reach_the_output_file() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("bluetoothd.log");
        let mut proc = process(SourceKind::DaemonLog, "echo out; echo err >&2; exec sleep 30");
        proc.start(CaptureArgs::session(&output)).unwrap();

        assert!(wait_until(|| std::fs::read_to_string(&output).unwrap_or_default() == "out\n").await);
        proc.stop().await.unwrap();
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(8))]

            #[test]
            fn at_most_one_process_is_ever_alive(ops in prop::collection::vec(any::<bool>(), 1..8)) {
                let runtime = tokio::runtime::Runtime::new().unwrap();
                runtime.block_on(async {
                    let dir = tempfile::tempdir().unwrap();
                    let output = dir.path().join("dbus.log");
                    let mut proc = process(SourceKind::BusMonitor, "exec sleep 30");
                    let mut seen = Vec::new();

                    for start in ops {
                        if start {
                            match proc.start(CaptureArgs::session(&output)).unwrap() {
                                StartOutcome::Started { pid } => seen.push(pid),
                                StartOutcome::AlreadyRunning { pid } => {
                                    assert_eq!(Some(&pid), seen.last());
                                }
                            }
                        } else {
                            proc.stop().await.unwrap();
                        }

                        let current = if proc.is_running() { proc.pid() } else { None };
                        let others_alive = seen
                            .iter()
                            .filter(|pid| Some(**pid) != current)
                            .filter(|pid| alive(**pid))
                            .count();
                        assert_eq!(others_alive, 0);
                    }
                    proc.stop().await.unwrap();
                });
            }
        }
    }
}
