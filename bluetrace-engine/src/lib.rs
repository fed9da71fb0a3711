//! # bluetrace-engine
//!
//! Coordination layer: the [`LogSupervisor`] owns the capture processes, the
//! bound controller interface and the packet-dump tailer. Frontends construct
//! one supervisor per application lifetime and pass it by reference.
//!
//! ### Key Submodules:
//! - `supervisor`: interface state machine, source control, shutdown
//! - `interface`: controller bring-up and enumeration
//! - `watch`: redundant file-change trigger for the tailer's poll step
//! - `error`: supervisor errors and stable reason codes

pub mod error;
pub mod interface;
pub mod supervisor;
#[cfg(feature = "watch")]
pub mod watch;

pub use error::{ReasonCode, ReasonCoded, SupervisorError};
pub use interface::{enumerate_interfaces, BringUpError, InterfaceControl, ShellInterfaceControl};
pub use supervisor::{LogSupervisor, SelectOutcome, SourceStatus, SupervisorStatus};
#[cfg(feature = "watch")]
pub use watch::FallbackWatcher;
