//! Redundant change trigger for the packet-dump tailer.
//!
//! File-change notifications on the session directory re-run the tailer's
//! regular poll step through [`LogSupervisor::poll_now`]. The background poll
//! loop stays the primary reader; a missed notification only delays delivery
//! until its next tick.

use std::sync::{Arc, Weak};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, trace, warn};

use crate::supervisor::LogSupervisor;

/// Keeps the file-change watcher alive; dropping it stops notifications.
pub struct FallbackWatcher {
    _watcher: RecommendedWatcher,
}

impl FallbackWatcher {
    /// Watches the supervisor's session directory. Holds only a weak
    /// reference, so the watcher never keeps the supervisor alive.
    pub fn spawn(supervisor: &Arc<LogSupervisor>) -> notify::Result<Self> {
        let session_dir = supervisor.session_dir().to_path_buf();
        let target: Weak<LogSupervisor> = Arc::downgrade(supervisor);

        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            match result {
                Ok(event) => on_event(&target, event),
                Err(e) => warn!("File watcher error: {e}"),
            }
        })?;
        watcher.watch(&session_dir, RecursiveMode::NonRecursive)?;
        debug!(dir = %session_dir.display(), "Fallback watcher installed");

        Ok(Self { _watcher: watcher })
    }
}

fn on_event(target: &Weak<LogSupervisor>, event: Event) {
    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
        return;
    }
    let Some(supervisor) = target.upgrade() else {
        return;
    };
    let Some(tailed) = supervisor.tailed_path() else {
        return;
    };
    if !event.paths.iter().any(|path| path == &tailed) {
        return;
    }

    match supervisor.poll_now() {
        Ok(outcome) => trace!(?outcome, "Watcher-triggered poll"),
        Err(e) => debug!("Watcher-triggered poll failed: {e}"),
    }
}
