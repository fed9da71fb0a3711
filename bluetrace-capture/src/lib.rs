//! bluetrace‑capture
//!
//! Supervises the external commands that produce diagnostic telemetry.
//! Each [`CaptureProcess`] wraps at most one live OS process for one
//! [`SourceKind`], writing into a designated output file.

pub mod error;
pub mod process;
pub mod source;

pub use error::CaptureError;
pub use process::{CaptureArgs, CaptureProcess, StartOutcome, StopOutcome};
pub use source::{RenderedCommand, SourceKind};
