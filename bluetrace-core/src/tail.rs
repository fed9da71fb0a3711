//! Byte-exact incremental reader for the packet-dump output file.
//!
//! A `LogTailer` owns the read side of one output file. A background poller
//! (a blocking task, so file reads never stall the async control flow) reads
//! from the cursor to end-of-file, advances the cursor by exactly the bytes
//! read and publishes them. The same poll step is reachable through a
//! [`PollHandle`] so an external change notifier can trigger it out of band;
//! both paths serialize on the cursor lock and can never diverge.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tokio::task::{spawn_blocking, JoinHandle};
use tokio::time::sleep;
use tracing::{debug, info, trace, warn};

use bluetrace_config::TailerConfig;
use bluetrace_telemetry::MetricsRecorder;

use crate::error::TailError;
use crate::events::TailEvent;
use crate::registry::SubscriberRegistry;

/// Result of one poll step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// This many new bytes were published.
    Read(usize),
    /// Nothing new since the last poll.
    Idle,
    /// The tailer was detached; nothing was read.
    Detached,
}

/// Identifies the file behind a path so a replacement can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileIdentity {
    dev: u64,
    ino: u64,
}

impl FileIdentity {
    #[cfg(unix)]
    fn of(meta: &std::fs::Metadata) -> Option<Self> {
        use std::os::unix::fs::MetadataExt;
        Some(Self {
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }

    #[cfg(not(unix))]
    fn of(_meta: &std::fs::Metadata) -> Option<Self> {
        None
    }
}

struct Cursor {
    file: File,
    offset: u64,
    identity: Option<FileIdentity>,
}

struct TailShared {
    path: PathBuf,
    cursor: Mutex<Option<Cursor>>,
    registry: Arc<SubscriberRegistry>,
    metrics: MetricsRecorder,
    read_chunk: usize,
}

impl TailShared {
    fn poll_once(&self) -> Result<PollOutcome, TailError> {
        let mut guard = self.cursor.lock();
        let Some(cursor) = guard.as_mut() else {
            return Ok(PollOutcome::Detached);
        };

        self.follow_replacement(cursor)?;

        let len = cursor
            .file
            .metadata()
            .map_err(|e| TailError::io(&self.path, e))?
            .len();

        if len < cursor.offset {
            self.discontinuity(cursor, len, "truncated");
        }
        if len == cursor.offset {
            return Ok(PollOutcome::Idle);
        }

        let start = cursor.offset;
        let want = (len - start).min(self.read_chunk as u64);
        cursor
            .file
            .seek(SeekFrom::Start(start))
            .map_err(|e| TailError::io(&self.path, e))?;
        let mut buf = Vec::with_capacity(want as usize);
        (&mut cursor.file)
            .take(want)
            .read_to_end(&mut buf)
            .map_err(|e| TailError::io(&self.path, e))?;

        let read = buf.len();
        if read == 0 {
            return Ok(PollOutcome::Idle);
        }
        cursor.offset = start + read as u64;
        trace!(offset = start, bytes = read, "Read new output");

        self.registry.publish(TailEvent::Chunk {
            offset: start,
            data: Bytes::from(buf),
        });
        self.metrics.record_chunk(read);
        Ok(PollOutcome::Read(read))
    }

    /// Reopens the path when it now names a different file than the one held.
    fn follow_replacement(&self, cursor: &mut Cursor) -> Result<(), TailError> {
        let Some(held) = cursor.identity else {
            return Ok(());
        };
        // A missing path means the file was unlinked; keep reading the open handle.
        let Ok(meta) = std::fs::metadata(&self.path) else {
            return Ok(());
        };
        let current = FileIdentity::of(&meta);
        if current == Some(held) {
            return Ok(());
        }

        let file = File::open(&self.path).map_err(|e| TailError::io(&self.path, e))?;
        info!(path = %self.path.display(), "Output file replaced, reopening");
        cursor.file = file;
        cursor.identity = current;
        self.discontinuity(cursor, meta.len(), "replaced");
        Ok(())
    }

    /// `cause` is "truncated" or "replaced".
    fn discontinuity(&self, cursor: &mut Cursor, file_len: u64, cause: &'static str) {
        let previous_offset = cursor.offset;
        warn!(
            path = %self.path.display(),
            previous_offset,
            file_len,
            cause,
            "Output discontinuity, restarting at zero"
        );
        cursor.offset = 0;
        self.metrics.discontinuities.inc();
        self.registry.publish(TailEvent::Discontinuity {
            previous_offset,
            file_len,
        });
    }

    fn offset(&self) -> Option<u64> {
        self.cursor.lock().as_ref().map(|cursor| cursor.offset)
    }

    fn close(&self) {
        self.cursor.lock().take();
    }
}

/// Wakes the poller early when the tailer is detached.
struct StopSignal {
    stopped: Mutex<bool>,
    cvar: Condvar,
}

impl StopSignal {
    fn new() -> Self {
        Self {
            stopped: Mutex::new(false),
            cvar: Condvar::new(),
        }
    }

    fn stop(&self) {
        *self.stopped.lock() = true;
        self.cvar.notify_all();
    }

    /// Sleeps up to `timeout`; returns true once stopped.
    fn wait(&self, timeout: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if !*stopped {
            self.cvar.wait_for(&mut stopped, timeout);
        }
        *stopped
    }

    fn is_stopped(&self) -> bool {
        *self.stopped.lock()
    }
}

/// Cloneable trigger for the tailer's poll step.
#[derive(Clone)]
pub struct PollHandle {
    shared: Arc<TailShared>,
}

impl PollHandle {
    /// Runs one poll step now, on the caller's thread.
    pub fn poll(&self) -> Result<PollOutcome, TailError> {
        self.shared.poll_once()
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }
}

/// Tails one growing output file into a [`SubscriberRegistry`].
pub struct LogTailer {
    shared: Arc<TailShared>,
    stop: Arc<StopSignal>,
    poller: Option<JoinHandle<()>>,
}

impl LogTailer {
    /// Opens `path` for reading, waiting with bounded backoff for it to be
    /// created, announces a new stream for `interface` and starts polling
    /// from offset zero.
    ///
    /// Errors
    /// - [`TailError::OutputNotMaterialized`] if the file never appeared
    ///   within `attach_timeout_ms`.
    pub async fn attach_output(
        path: impl Into<PathBuf>,
        interface: &str,
        registry: Arc<SubscriberRegistry>,
        config: &TailerConfig,
        metrics: MetricsRecorder,
    ) -> Result<Self, TailError> {
        let path = path.into();
        let file = open_with_backoff(&path, config).await?;
        let identity = file
            .metadata()
            .ok()
            .and_then(|meta| FileIdentity::of(&meta));

        registry.publish(TailEvent::StreamStarted {
            interface: interface.to_string(),
            path: path.clone(),
        });

        let shared = Arc::new(TailShared {
            path,
            cursor: Mutex::new(Some(Cursor {
                file,
                offset: 0,
                identity,
            })),
            registry,
            metrics,
            read_chunk: config.read_chunk_bytes.max(1),
        });
        let stop = Arc::new(StopSignal::new());
        let poller = spawn_poller(
            shared.clone(),
            stop.clone(),
            Duration::from_millis(config.poll_interval_ms),
        );

        info!(path = %shared.path.display(), interface, "Tailer attached");
        Ok(Self {
            shared,
            stop,
            poller: Some(poller),
        })
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Bytes delivered so far from the current file.
    pub fn offset(&self) -> u64 {
        self.shared.offset().unwrap_or(0)
    }

    /// Everything captured since offset zero that is still retained for replay.
    pub fn current_snapshot(&self) -> Bytes {
        self.shared.registry.snapshot()
    }

    /// Runs the poll step now, in addition to the background schedule.
    pub fn poll_now(&self) -> Result<PollOutcome, TailError> {
        self.shared.poll_once()
    }

    pub fn poll_handle(&self) -> PollHandle {
        PollHandle {
            shared: self.shared.clone(),
        }
    }

    /// Stops the poller and closes the file. The file itself is left in place.
    pub async fn detach(mut self) {
        self.stop.stop();
        if let Some(poller) = self.poller.take() {
            if let Err(e) = poller.await {
                warn!("Tail poller ended abnormally: {e}");
            }
        }
        self.shared.close();
        debug!(path = %self.shared.path.display(), "Tailer detached");
    }
}

impl Drop for LogTailer {
    fn drop(&mut self) {
        self.stop.stop();
        self.shared.close();
    }
}

fn spawn_poller(
    shared: Arc<TailShared>,
    stop: Arc<StopSignal>,
    interval: Duration,
) -> JoinHandle<()> {
    spawn_blocking(move || {
        debug!(path = %shared.path.display(), "Tail poller started");
        while !stop.is_stopped() {
            match shared.poll_once() {
                // More may be pending beyond the chunk limit; go again at once.
                Ok(PollOutcome::Read(_)) => continue,
                Ok(PollOutcome::Idle) => {}
                Ok(PollOutcome::Detached) => break,
                Err(e) => warn!("Tail poll failed: {e}"),
            }
            if stop.wait(interval) {
                break;
            }
        }
        debug!(path = %shared.path.display(), "Tail poller stopped");
    })
}

async fn open_with_backoff(path: &Path, config: &TailerConfig) -> Result<File, TailError> {
    let timeout = Duration::from_millis(config.attach_timeout_ms);
    let max_delay = Duration::from_millis(config.attach_backoff_max_ms);
    let mut delay = Duration::from_millis(config.attach_backoff_initial_ms).min(max_delay);
    let started = Instant::now();

    loop {
        match File::open(path) {
            Ok(file) => return Ok(file),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let waited = started.elapsed();
                if waited >= timeout {
                    warn!(path = %path.display(), ?waited, "Output never materialized");
                    return Err(TailError::OutputNotMaterialized {
                        path: path.to_path_buf(),
                        waited,
                    });
                }
                trace!(path = %path.display(), ?delay, "Output not there yet, retrying");
                sleep(delay.min(timeout - waited)).await;
                delay = (delay * 2).min(max_delay);
            }
            Err(e) => return Err(TailError::io(path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::io::Write;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::timeout;
    use tracing_test::traced_test;

    fn fast_config() -> TailerConfig {
        TailerConfig {
            poll_interval_ms: 10,
            attach_timeout_ms: 1000,
            attach_backoff_initial_ms: 5,
            attach_backoff_max_ms: 50,
            ..TailerConfig::default()
        }
    }

    fn registry() -> Arc<SubscriberRegistry> {
        Arc::new(SubscriberRegistry::new(1 << 20, MetricsRecorder::new()))
    }

    fn append(path: &Path, data: &[u8]) {
        let mut file = OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(data).unwrap();
        file.flush().unwrap();
    }

    async fn next_event(rx: &mut UnboundedReceiver<TailEvent>) -> TailEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event within deadline")
            .expect("channel open")
    }

    /// Collects byte events until `want` bytes have arrived.
    async fn collect_bytes(rx: &mut UnboundedReceiver<TailEvent>, want: usize) -> Vec<TailEvent> {
        let mut events = Vec::new();
        let mut total = 0;
        while total < want {
            let event = next_event(rx).await;
            total += event.data().map_or(0, |d| d.len());
            events.push(event);
        }
        events
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn waits_for_output_to_appear() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hcidump-hci0.log");
        let late = path.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(60)).await;
            File::create(late).unwrap();
        });

        let tailer = LogTailer::attach_output(
            &path,
            "hci0",
            registry(),
            &fast_config(),
            MetricsRecorder::new(),
        )
        .await
        .expect("file appears before the timeout");
        assert_eq!(tailer.offset(), 0);
        tailer.detach().await;
    }

    #[tokio::test]
    async fn missing_output_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let config = TailerConfig {
            attach_timeout_ms: 50,
            ..fast_config()
        };
        let err = LogTailer::attach_output(
            dir.path().join("never.log"),
            "hci0",
            registry(),
            &config,
            MetricsRecorder::new(),
        )
        .await
        .err()
        .expect("attach must fail");
        assert!(matches!(err, TailError::OutputNotMaterialized { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn publishes_appended_bytes_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.log");
        File::create(&path).unwrap();
        let registry = registry();
        let (_, mut rx) = registry.channel(false).unwrap();
        let metrics = MetricsRecorder::new();

        let tailer =
            LogTailer::attach_output(&path, "hci0", registry.clone(), &fast_config(), metrics.clone())
                .await
                .unwrap();
        assert!(matches!(next_event(&mut rx).await, TailEvent::StreamStarted { .. }));

        append(&path, &[b'a'; 120]);
        let first = collect_bytes(&mut rx, 120).await;
        append(&path, &[b'b'; 30]);
        let second = collect_bytes(&mut rx, 30).await;

        assert!(matches!(first[0], TailEvent::Chunk { offset: 0, .. }));
        assert!(matches!(second[0], TailEvent::Chunk { offset: 120, .. }));
        assert_eq!(tailer.offset(), 150);
        assert_eq!(tailer.current_snapshot().len(), 150);
        assert_eq!(metrics.bytes_published.get(), 150);
        tailer.detach().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn truncation_is_reported_as_discontinuity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.log");
        File::create(&path).unwrap();
        let registry = registry();
        let (_, mut rx) = registry.channel(false).unwrap();

        let tailer =
            LogTailer::attach_output(&path, "hci0", registry.clone(), &fast_config(), MetricsRecorder::new())
                .await
                .unwrap();
        next_event(&mut rx).await;
        append(&path, &[b'x'; 100]);
        collect_bytes(&mut rx, 100).await;

        OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(0)
            .unwrap();
        append(&path, b"fresh");

        match next_event(&mut rx).await {
            TailEvent::Discontinuity {
                previous_offset, ..
            } => assert_eq!(previous_offset, 100),
            other => panic!("expected discontinuity, got {other:?}"),
        }
        let after = collect_bytes(&mut rx, 5).await;
        assert!(matches!(after[0], TailEvent::Chunk { offset: 0, .. }));
        assert_eq!(registry.snapshot(), Bytes::from_static(b"fresh"));
        tailer.detach().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn rotated_file_is_followed_from_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.log");
        File::create(&path).unwrap();
        let registry = registry();
        let (_, mut rx) = registry.channel(false).unwrap();
        let config = TailerConfig {
            poll_interval_ms: 10_000,
            ..fast_config()
        };
        let metrics = MetricsRecorder::new();
        let tailer = LogTailer::attach_output(&path, "hci0", registry.clone(), &config, metrics.clone())
            .await
            .unwrap();
        let handle = tailer.poll_handle();
        next_event(&mut rx).await;
        // Let the background poller settle into its long wait.
        sleep(Duration::from_millis(100)).await;

        append(&path, b"old-data");
        let _ = handle.poll().unwrap();
        collect_bytes(&mut rx, 8).await;

        // Rotate: move the old file aside and swap a longer one into place.
        let staged = dir.path().join("dump.log.new");
        std::fs::write(&staged, b"new-longer-content").unwrap();
        std::fs::rename(&path, dir.path().join("dump.log.1")).unwrap();
        std::fs::rename(&staged, &path).unwrap();

        assert_eq!(handle.poll().unwrap(), PollOutcome::Read(18));
        assert_eq!(
            next_event(&mut rx).await,
            TailEvent::Discontinuity {
                previous_offset: 8,
                file_len: 18
            }
        );
        assert_eq!(
            next_event(&mut rx).await,
            TailEvent::Chunk {
                offset: 0,
                data: Bytes::from_static(b"new-longer-content")
            }
        );
        assert_eq!(tailer.offset(), 18);
        assert_eq!(registry.snapshot(), Bytes::from_static(b"new-longer-content"));
        assert_eq!(metrics.discontinuities.get(), 1);
        assert!(logs_contain("replaced"));
        assert!(!logs_contain("truncated"));
        tailer.detach().await;
    }

    #[tokio::test]
    async fn manual_poll_matches_background_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.log");
        File::create(&path).unwrap();
        let config = TailerConfig {
            poll_interval_ms: 10_000,
            ..fast_config()
        };
        let tailer =
            LogTailer::attach_output(&path, "hci0", registry(), &config, MetricsRecorder::new())
                .await
                .unwrap();
        let handle = tailer.poll_handle();

        append(&path, b"0123456789");
        // Either the background poller or this call reads the bytes, never both.
        let _ = handle.poll().unwrap();
        assert_eq!(handle.poll().unwrap(), PollOutcome::Idle);
        assert_eq!(tailer.offset(), 10);
        assert_eq!(tailer.current_snapshot(), Bytes::from_static(b"0123456789"));

        tailer.detach().await;
        assert_eq!(handle.poll().unwrap(), PollOutcome::Detached);
        assert!(path.exists());
    }
}
