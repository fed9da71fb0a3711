use std::future::Future;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};

use bluetrace_config::BluetraceConfig;
use bluetrace_core::TailEvent;
use bluetrace_engine::{
    enumerate_interfaces, LogSupervisor, ReasonCoded, SelectOutcome, ShellInterfaceControl,
    SupervisorStatus,
};
use bluetrace_telemetry::MetricsRecorder;

#[derive(Parser)]
#[command(version, about)]
pub struct Cli {
    /// Configuration file; defaults to config/bluetrace.yaml when present
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List detected Bluetooth controller interfaces
    Interfaces,
    /// Start capturing and stream the packet dump to stdout
    Run(RunArgs),
    /// Print the effective configuration as YAML
    Config,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Interface to bind immediately (e.g. hci0)
    #[arg(short, long)]
    pub interface: Option<String>,
    /// Only stream what is captured after startup
    #[arg(long)]
    pub no_replay: bool,
    /// Print Prometheus metrics on exit
    #[arg(long)]
    pub metrics: bool,
}

/// A line typed by the operator while capturing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorCommand {
    Select(String),
    Status,
    Quit,
    Nothing,
}

impl FromStr for OperatorCommand {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let command = match words.next() {
            None => return Ok(OperatorCommand::Nothing),
            Some("select") => match words.next() {
                Some(interface) => OperatorCommand::Select(interface.to_string()),
                None => return Err("usage: select <interface>".to_string()),
            },
            Some("status") => OperatorCommand::Status,
            Some("quit") | Some("exit") => OperatorCommand::Quit,
            Some(other) => return Err(format!("unknown command {other:?} (select, status, quit)")),
        };
        match words.next() {
            Some(extra) => Err(format!("unexpected argument {extra:?}")),
            None => Ok(command),
        }
    }
}

pub fn load_config(path: Option<&Path>) -> anyhow::Result<BluetraceConfig> {
    let config = match path {
        Some(path) => BluetraceConfig::load_from_path(path),
        None => BluetraceConfig::load(),
    };
    config.context("Failed to load configuration")
}

pub fn list_interfaces(config: &BluetraceConfig) -> anyhow::Result<()> {
    let root = &config.interface.sysfs_root;
    let interfaces = enumerate_interfaces(root)
        .with_context(|| format!("Failed to list {}", root.display()))?;
    if interfaces.is_empty() {
        eprintln!("No controller interfaces under {}", root.display());
    }
    for interface in interfaces {
        println!("{interface}");
    }
    Ok(())
}

pub fn print_config(config: &BluetraceConfig) -> anyhow::Result<()> {
    print!("{}", config.to_yaml()?);
    Ok(())
}

pub async fn run(args: RunArgs, config: BluetraceConfig, metrics: MetricsRecorder) -> anyhow::Result<()> {
    let control = Arc::new(ShellInterfaceControl::new(&config.interface));
    let watch_enabled = config.watch.enabled;
    let supervisor = Arc::new(LogSupervisor::start(config, control, metrics.clone()).await?);
    eprintln!("Session directory: {}", supervisor.session_dir().display());

    let _watcher = if watch_enabled {
        match bluetrace_engine::FallbackWatcher::spawn(&supervisor) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!("File watcher unavailable, relying on polling: {e}");
                None
            }
        }
    } else {
        None
    };

    let (subscriber, events) = supervisor.subscribe(!args.no_replay)?;
    let printer = tokio::spawn(print_events(events));

    let result = operate(
        &supervisor,
        args.interface.as_deref(),
        BufReader::new(tokio::io::stdin()),
        tokio::signal::ctrl_c(),
    )
    .await;

    // Exit path: runs even when the session ended with an error.
    supervisor.cleanup().await;
    supervisor.detach_subscriber(subscriber);
    printer.abort();

    if args.metrics {
        eprint!("{}", metrics.gather_metrics()?);
    }
    result
}

/// Runs operator commands until `quit` or until `interrupt` fires, whichever
/// comes first. An interrupt also cuts short a switch that is still under way.
async fn operate<R, I>(
    supervisor: &LogSupervisor,
    interface: Option<&str>,
    input: R,
    interrupt: I,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    I: Future<Output = std::io::Result<()>>,
{
    let result = tokio::select! {
        signal = interrupt => {
            signal.context("Failed to listen for Ctrl-C").map(|()| info!("Interrupted"))
        }
        () = command_loop(supervisor, interface, input) => Ok(()),
    };

    supervisor.cleanup().await;
    result
}

async fn command_loop<R: AsyncBufRead + Unpin>(supervisor: &LogSupervisor, interface: Option<&str>, input: R) {
    if let Some(interface) = interface {
        select(supervisor, interface).await;
    }

    let mut lines = input.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match line.parse::<OperatorCommand>() {
                Ok(OperatorCommand::Select(interface)) => select(supervisor, &interface).await,
                Ok(OperatorCommand::Status) => print_status(&supervisor.status().await),
                Ok(OperatorCommand::Quit) => return,
                Ok(OperatorCommand::Nothing) => {}
                Err(message) => eprintln!("{message}"),
            },
            Ok(None) => break,
            Err(e) => {
                warn!("Stopped reading operator commands: {e}");
                break;
            }
        }
    }
    // Without operator input, keep capturing until interrupted.
    std::future::pending::<()>().await
}

async fn select(supervisor: &LogSupervisor, interface: &str) {
    let outcome = supervisor.select_interface(interface).await;
    let reason = outcome.reason();
    match outcome {
        Ok(SelectOutcome::Started { interface, pid }) => {
            eprintln!("Capturing {interface} (pid {pid})")
        }
        Ok(SelectOutcome::AlreadyActive { interface, pid }) => {
            eprintln!("{interface} already capturing (pid {pid})")
        }
        Err(e) => match reason {
            Some(reason) => eprintln!("Cannot select {interface} [{reason}]: {e}"),
            None => eprintln!("Cannot select {interface}: {e}"),
        },
    }
}

fn print_status(status: &SupervisorStatus) {
    eprintln!(
        "interface: {}  capturing: {}  offset: {}  subscribers: {}",
        status.bound_interface.as_deref().unwrap_or("-"),
        status.capturing,
        status
            .tail_offset
            .map(|offset| offset.to_string())
            .unwrap_or_else(|| "-".into()),
        status.subscribers,
    );
    for source in &status.sources {
        let state = match (source.running, source.pid, source.last_exit_code) {
            (true, Some(pid), _) => format!("running (pid {pid})"),
            (_, _, Some(code)) => format!("exited ({code})"),
            _ => "stopped".to_string(),
        };
        eprintln!("  {:<12} {}", source.kind.as_str(), state);
    }
}

async fn print_events(mut events: UnboundedReceiver<TailEvent>) {
    let mut stdout = tokio::io::stdout();
    while let Some(event) = events.recv().await {
        let written = match &event {
            TailEvent::StreamStarted { interface, path } => {
                eprintln!("== {interface}: {}", path.display());
                Ok(())
            }
            TailEvent::Replay { offset, data } => {
                if *offset > 0 {
                    eprintln!("== replay starts at byte {offset}; earlier output was dropped");
                }
                stdout.write_all(data).await
            }
            TailEvent::Chunk { data, .. } => stdout.write_all(data).await,
            TailEvent::Discontinuity {
                previous_offset,
                file_len,
            } => {
                eprintln!("== output rewritten ({previous_offset} -> {file_len} bytes); some data may be missing");
                Ok(())
            }
        };
        if let Err(e) = written {
            warn!("Cannot write to stdout: {e}");
            break;
        }
        if let Err(e) = stdout.flush().await {
            warn!("Cannot flush stdout: {e}");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use bluetrace_config::CommandConfig;
    use bluetrace_engine::{BringUpError, InterfaceControl};
    use tokio::time::{sleep, timeout};

    struct HangingBringUp;

    #[async_trait]
    impl InterfaceControl for HangingBringUp {
        async fn bring_up(&self, _interface: &str) -> Result<(), BringUpError> {
            sleep(Duration::from_secs(30)).await;
            Ok(())
        }
    }

    async fn quiet_supervisor(log_dir: &Path) -> LogSupervisor {
        let mut config = BluetraceConfig::default();
        config.capture.log_dir = log_dir.to_path_buf();
        config.capture.sources.bus_monitor.enabled = false;
        config.capture.sources.daemon_log.enabled = false;
        config.capture.sources.audio_log.enabled = false;
        config.capture.sources.packet_dump =
            CommandConfig::new("sh", &["-c", "exec sleep 30", "sh", "{interface}"]);
        LogSupervisor::start(config, Arc::new(HangingBringUp), MetricsRecorder::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn interrupt_cuts_a_pending_switch_short() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = quiet_supervisor(dir.path()).await;
        let interrupt = async {
            sleep(Duration::from_millis(100)).await;
            Ok(())
        };

        timeout(
            Duration::from_secs(5),
            operate(&supervisor, None, &b"select hci0\n"[..], interrupt),
        )
        .await
        .expect("interrupt ends the session while the switch is pending")
        .unwrap();
        assert!(supervisor.status().await.shutting_down);
    }

    #[tokio::test]
    async fn quit_ends_the_session() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = quiet_supervisor(dir.path()).await;

        timeout(
            Duration::from_secs(5),
            operate(&supervisor, None, &b"status\nquit\n"[..], std::future::pending()),
        )
        .await
        .expect("quit ends the session")
        .unwrap();
        assert!(supervisor.status().await.shutting_down);
    }

    #[test]
    fn parses_operator_commands() {
        assert_eq!(
            "select hci1".parse::<OperatorCommand>(),
            Ok(OperatorCommand::Select("hci1".into()))
        );
        assert_eq!("  status ".parse::<OperatorCommand>(), Ok(OperatorCommand::Status));
        assert_eq!("quit".parse::<OperatorCommand>(), Ok(OperatorCommand::Quit));
        assert_eq!("".parse::<OperatorCommand>(), Ok(OperatorCommand::Nothing));
    }

    #[test]
    fn rejects_malformed_commands() {
        assert!("select".parse::<OperatorCommand>().is_err());
        assert!("select hci0 hci1".parse::<OperatorCommand>().is_err());
        assert!("restart".parse::<OperatorCommand>().is_err());
    }

    #[test]
    fn cli_shape() {
        let cli = Cli::try_parse_from(["bluetrace", "run", "--interface", "hci0", "--no-replay"]).unwrap();
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.interface.as_deref(), Some("hci0"));
                assert!(args.no_replay);
                assert!(!args.metrics);
            }
            _ => panic!("expected run"),
        }

        let cli = Cli::try_parse_from(["bluetrace", "config", "--config", "/etc/bt.yaml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/bt.yaml")));
    }
}
