//! The log-source supervisor.
//!
//! `LogSupervisor` owns one [`CaptureProcess`] per source kind, the bound
//! controller interface and the packet-dump [`LogTailer`]. State-mutating
//! operations serialize on one async lock. Interface switches additionally
//! hold a switch guard: a switch that finds another switch under way is
//! rejected with [`SupervisorError::TransitionInProgress`], while a switch
//! that only meets a slow `stop_source` or `cleanup` waits for the state lock.
//!
//! The tailer's poller never touches supervisor state. It only reads the file
//! and publishes into the shared [`SubscriberRegistry`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use opentelemetry::KeyValue;
use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, instrument, warn};

use bluetrace_capture::source::is_valid_interface_name;
use bluetrace_capture::{CaptureArgs, CaptureProcess, SourceKind, StartOutcome, StopOutcome};
use bluetrace_config::BluetraceConfig;
use bluetrace_core::registry::Callback;
use bluetrace_core::{LogTailer, PollHandle, PollOutcome, SubscriberId, SubscriberRegistry, TailEvent};
use bluetrace_telemetry::{EventLogger, MetricsRecorder};

use crate::error::SupervisorError;
use crate::interface::InterfaceControl;

/// Result of a successful [`LogSupervisor::select_interface`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectOutcome {
    /// The packet dump was (re)started and a fresh tailer attached.
    Started { interface: String, pid: u32 },
    /// The interface was already bound and capturing; nothing changed.
    AlreadyActive { interface: String, pid: u32 },
}

/// Point-in-time view of one capture source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceStatus {
    pub kind: SourceKind,
    pub running: bool,
    pub pid: Option<u32>,
    pub interface: Option<String>,
    pub output: Option<PathBuf>,
    /// Exit code of the previous process, if it has exited with one.
    pub last_exit_code: Option<i32>,
}

/// Point-in-time view of the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorStatus {
    pub bound_interface: Option<String>,
    pub capturing: bool,
    pub shutting_down: bool,
    pub session_dir: PathBuf,
    /// Bytes delivered from the current packet-dump file.
    pub tail_offset: Option<u64>,
    pub tail_path: Option<PathBuf>,
    pub sources: Vec<SourceStatus>,
    pub subscribers: usize,
}

#[derive(Default)]
struct SupervisorState {
    bound: Option<String>,
    sources: BTreeMap<SourceKind, CaptureProcess>,
    tailer: Option<LogTailer>,
    shutting_down: bool,
}

impl SupervisorState {
    fn dump_running(&mut self) -> bool {
        self.sources
            .get_mut(&SourceKind::PacketDump)
            .is_some_and(|dump| dump.is_running())
    }

    fn running_count(&mut self) -> i64 {
        let mut running = 0;
        for process in self.sources.values_mut() {
            if process.is_running() {
                running += 1;
            }
        }
        running
    }
}

pub struct LogSupervisor {
    config: BluetraceConfig,
    session_dir: PathBuf,
    control: Arc<dyn InterfaceControl>,
    registry: Arc<SubscriberRegistry>,
    metrics: MetricsRecorder,
    state: Mutex<SupervisorState>,
    switching: Mutex<()>,
    poller: RwLock<Option<PollHandle>>,
}

impl LogSupervisor {
    /// Creates the session directory and starts every enabled always-on
    /// source. A source that fails to start is logged and counted; it does not
    /// prevent the supervisor from coming up.
    pub async fn start(
        config: BluetraceConfig,
        control: Arc<dyn InterfaceControl>,
        metrics: MetricsRecorder,
    ) -> Result<Self, SupervisorError> {
        let session_dir = config
            .capture
            .log_dir
            .join(format!("session-{}", Local::now().format("%Y%m%d-%H%M%S")));
        std::fs::create_dir_all(&session_dir).map_err(|source| SupervisorError::Session {
            path: session_dir.clone(),
            source,
        })?;

        let supervisor = Self {
            registry: Arc::new(SubscriberRegistry::new(
                config.tailer.replay_limit_bytes,
                metrics.clone(),
            )),
            config,
            session_dir,
            control,
            metrics,
            state: Mutex::new(SupervisorState::default()),
            switching: Mutex::new(()),
            poller: RwLock::new(None),
        };
        info!(session = %supervisor.session_dir.display(), "Supervisor started");

        {
            let mut state = supervisor.state.lock().await;
            for kind in SourceKind::ALWAYS_ON {
                if !kind.command(&supervisor.config.capture.sources).enabled {
                    debug!(kind = %kind, "Source disabled");
                    continue;
                }
                if let Err(e) = supervisor.start_in(&mut state, kind).await {
                    error!(kind = %kind, "Failed to start source: {e}");
                }
            }
            supervisor.refresh_running(&mut state);
        }

        Ok(supervisor)
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &MetricsRecorder {
        &self.metrics
    }

    /// Binds `interface`: tears down the previous packet dump, brings the
    /// interface up (best effort), starts a new dump and attaches a fresh
    /// tailer at offset zero. Re-selecting the interface that is already
    /// capturing is a no-op.
    ///
    /// Errors
    /// - [`SupervisorError::TransitionInProgress`] if another switch is under way.
    /// - [`SupervisorError::ShuttingDown`] once `cleanup` has started.
    /// - [`SupervisorError::Capture`] if the dump could not be spawned; the
    ///   interface stays recorded but nothing is captured.
    /// - [`SupervisorError::Tail`] if the dump's output never appeared.
    #[instrument(level = "info", skip(self))]
    pub async fn select_interface(&self, interface: &str) -> Result<SelectOutcome, SupervisorError> {
        if !is_valid_interface_name(interface) {
            return Err(SupervisorError::InvalidInterface(interface.to_string()));
        }
        let _switch = self
            .switching
            .try_lock()
            .map_err(|_| SupervisorError::TransitionInProgress)?;
        let mut state = self.state.lock().await;
        if state.shutting_down {
            return Err(SupervisorError::ShuttingDown);
        }

        if state.bound.as_deref() == Some(interface) && state.tailer.is_some() && state.dump_running()
        {
            let pid = state
                .sources
                .get(&SourceKind::PacketDump)
                .and_then(|dump| dump.pid())
                .unwrap_or_default();
            debug!(interface, pid, "Interface already active");
            return Ok(SelectOutcome::AlreadyActive {
                interface: interface.to_string(),
                pid,
            });
        }

        self.teardown_dump(&mut state).await;
        if let Some(previous) = state.bound.replace(interface.to_string()) {
            info!(from = %previous, to = interface, "Switching interface");
        }

        if let Err(e) = self.control.bring_up(interface).await {
            warn!(interface, "Interface bring-up failed, capturing anyway: {e}");
        }

        let output = SourceKind::PacketDump.output_path(&self.session_dir, Some(interface));
        let dump = state
            .sources
            .entry(SourceKind::PacketDump)
            .or_insert_with(|| self.new_process(SourceKind::PacketDump));
        let pid = match dump.start(CaptureArgs::bound(interface, &output)) {
            Ok(StartOutcome::Started { pid }) | Ok(StartOutcome::AlreadyRunning { pid }) => pid,
            Err(e) => {
                self.metrics.spawn_failures.inc();
                self.refresh_running(&mut state);
                return Err(e.into());
            }
        };
        self.refresh_running(&mut state);

        let tailer = match LogTailer::attach_output(
            &output,
            interface,
            self.registry.clone(),
            &self.config.tailer,
            self.metrics.clone(),
        )
        .await
        {
            Ok(tailer) => tailer,
            Err(e) => {
                warn!(interface, "Packet dump produced no output, stopping it: {e}");
                if let Some(dump) = state.sources.get_mut(&SourceKind::PacketDump) {
                    if let Err(stop_err) = dump.stop().await {
                        warn!(interface, "Failed to stop packet dump: {stop_err}");
                    }
                }
                self.refresh_running(&mut state);
                return Err(e.into());
            }
        };

        *self.poller.write() = Some(tailer.poll_handle());
        state.tailer = Some(tailer);
        self.metrics.interface_switches.inc();

        EventLogger::log_event(
            "interface_selected",
            vec![
                KeyValue::new("interface", interface.to_string()),
                KeyValue::new("pid", pid as i64),
                KeyValue::new("output", output.display().to_string()),
            ],
        )
        .await;

        Ok(SelectOutcome::Started {
            interface: interface.to_string(),
            pid,
        })
    }

    /// Starts an always-on source on demand.
    pub async fn start_source(&self, kind: SourceKind) -> Result<StartOutcome, SupervisorError> {
        if kind.is_interface_scoped() {
            return Err(SupervisorError::InterfaceScoped(kind));
        }
        let mut state = self.state.lock().await;
        if state.shutting_down {
            return Err(SupervisorError::ShuttingDown);
        }
        let outcome = self.start_in(&mut state, kind).await;
        self.refresh_running(&mut state);
        outcome
    }

    /// Stops one source. Stopping the packet dump also detaches its tailer;
    /// the bound interface stays recorded.
    pub async fn stop_source(&self, kind: SourceKind) -> Result<StopOutcome, SupervisorError> {
        let mut state = self.state.lock().await;
        if kind.is_interface_scoped() {
            self.detach_tailer(&mut state).await;
        }
        let outcome = match state.sources.get_mut(&kind) {
            Some(process) => process.stop().await?,
            None => StopOutcome::AlreadyStopped,
        };
        if let StopOutcome::Stopped { forced, .. } = outcome {
            EventLogger::log_event(
                "capture_stopped",
                vec![
                    KeyValue::new("kind", kind.as_str()),
                    KeyValue::new("forced", forced),
                ],
            )
            .await;
        }
        self.refresh_running(&mut state);
        Ok(outcome)
    }

    /// Whether the packet dump is alive and being tailed.
    pub async fn is_capturing(&self) -> bool {
        let mut state = self.state.lock().await;
        state.tailer.is_some() && state.dump_running()
    }

    pub async fn bound_interface(&self) -> Option<String> {
        self.state.lock().await.bound.clone()
    }

    pub async fn status(&self) -> SupervisorStatus {
        let mut state = self.state.lock().await;
        let capturing = state.tailer.is_some() && state.dump_running();
        let sources = SourceKind::ALL
            .iter()
            .map(|kind| match state.sources.get_mut(kind) {
                Some(process) => {
                    let running = process.is_running();
                    SourceStatus {
                        kind: *kind,
                        running,
                        pid: process.pid().filter(|_| running),
                        interface: process.interface().map(str::to_string),
                        output: process.output().map(Path::to_path_buf),
                        last_exit_code: process.last_exit().and_then(|status| status.code()),
                    }
                }
                None => SourceStatus {
                    kind: *kind,
                    running: false,
                    pid: None,
                    interface: None,
                    output: None,
                    last_exit_code: None,
                },
            })
            .collect();

        SupervisorStatus {
            bound_interface: state.bound.clone(),
            capturing,
            shutting_down: state.shutting_down,
            session_dir: self.session_dir.clone(),
            tail_offset: state.tailer.as_ref().map(LogTailer::offset),
            tail_path: state.tailer.as_ref().map(|t| t.path().to_path_buf()),
            sources,
            subscribers: self.registry.len(),
        }
    }

    /// Registers a subscriber on the packet-dump stream.
    pub fn attach_subscriber(
        &self,
        id: SubscriberId,
        callback: Callback,
        replay: bool,
    ) -> Result<(), SupervisorError> {
        Ok(self.registry.attach(id, callback, replay)?)
    }

    /// Registers a channel-backed subscriber for consumers with thread affinity.
    pub fn subscribe(
        &self,
        replay: bool,
    ) -> Result<(SubscriberId, mpsc::UnboundedReceiver<TailEvent>), SupervisorError> {
        Ok(self.registry.channel(replay)?)
    }

    pub fn detach_subscriber(&self, id: SubscriberId) -> bool {
        self.registry.detach(id)
    }

    /// Runs the current tailer's poll step out of band. Without a tailer this
    /// reports [`PollOutcome::Detached`].
    pub fn poll_now(&self) -> Result<PollOutcome, SupervisorError> {
        match self.poller.read().as_ref() {
            Some(handle) => Ok(handle.poll()?),
            None => Ok(PollOutcome::Detached),
        }
    }

    /// Path of the file currently being tailed.
    pub fn tailed_path(&self) -> Option<PathBuf> {
        self.poller
            .read()
            .as_ref()
            .map(|handle| handle.path().to_path_buf())
    }

    /// Stops every source and detaches the tailer. Never fails: individual
    /// stop failures are logged and the rest still proceed. Calling it again
    /// leaves the same end state.
    #[instrument(level = "info", skip(self))]
    pub async fn cleanup(&self) {
        let mut state = self.state.lock().await;
        let first = !state.shutting_down;
        state.shutting_down = true;

        self.detach_tailer(&mut state).await;

        let mut stopped = 0;
        for (kind, process) in state.sources.iter_mut() {
            match process.stop().await {
                Ok(StopOutcome::Stopped { forced, .. }) => {
                    stopped += 1;
                    debug!(kind = %kind, forced, "Source stopped");
                }
                Ok(StopOutcome::AlreadyStopped) => {}
                Err(e) => error!(kind = %kind, "Failed to stop source: {e}"),
            }
        }
        self.refresh_running(&mut state);

        if first {
            EventLogger::log_event(
                "cleanup_complete",
                vec![
                    KeyValue::new("stopped", stopped as i64),
                    KeyValue::new("session", self.session_dir.display().to_string()),
                ],
            )
            .await;
        } else {
            debug!(stopped, "Repeated cleanup");
        }
    }

    fn new_process(&self, kind: SourceKind) -> CaptureProcess {
        CaptureProcess::new(
            kind,
            kind.command(&self.config.capture.sources).clone(),
            self.config.stop_grace(),
        )
    }

    async fn start_in(
        &self,
        state: &mut SupervisorState,
        kind: SourceKind,
    ) -> Result<StartOutcome, SupervisorError> {
        let output = kind.output_path(&self.session_dir, None);
        let process = state
            .sources
            .entry(kind)
            .or_insert_with(|| self.new_process(kind));

        match process.start(CaptureArgs::session(&output)) {
            Ok(StartOutcome::Started { pid }) => {
                EventLogger::log_event(
                    "capture_started",
                    vec![
                        KeyValue::new("kind", kind.as_str()),
                        KeyValue::new("pid", pid as i64),
                        KeyValue::new("output", output.display().to_string()),
                    ],
                )
                .await;
                Ok(StartOutcome::Started { pid })
            }
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.metrics.spawn_failures.inc();
                Err(e.into())
            }
        }
    }

    async fn detach_tailer(&self, state: &mut SupervisorState) {
        self.poller.write().take();
        if let Some(tailer) = state.tailer.take() {
            tailer.detach().await;
        }
        self.registry.end_stream();
    }

    /// Detaches the tailer before stopping the dump, so no reader outlives
    /// the file's writer into the next interface.
    async fn teardown_dump(&self, state: &mut SupervisorState) {
        self.detach_tailer(state).await;
        if let Some(dump) = state.sources.get_mut(&SourceKind::PacketDump) {
            match dump.stop().await {
                Ok(StopOutcome::Stopped { forced, .. }) => {
                    debug!(interface = ?dump.interface(), forced, "Previous packet dump stopped")
                }
                Ok(StopOutcome::AlreadyStopped) => {}
                Err(e) => warn!(interface = ?dump.interface(), "Failed to stop packet dump: {e}"),
            }
        }
    }

    fn refresh_running(&self, state: &mut SupervisorState) {
        self.metrics.running_processes.set(state.running_count());
    }
}
