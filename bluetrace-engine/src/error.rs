use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use bluetrace_capture::{CaptureError, SourceKind, StartOutcome, StopOutcome};
use bluetrace_core::{RegistryError, TailError};

use crate::supervisor::SelectOutcome;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("An interface switch is already in progress")]
    TransitionInProgress,

    #[error("Supervisor is shutting down")]
    ShuttingDown,

    #[error("Invalid interface name {0:?}")]
    InvalidInterface(String),

    #[error("{0} is interface-scoped; select an interface instead")]
    InterfaceScoped(SourceKind),

    #[error("Cannot create session directory {path}: {source}")]
    Session {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Tail error: {0}")]
    Tail(#[from] TailError),

    #[error("Subscriber error: {0}")]
    Registry(#[from] RegistryError),
}

/// Stable, operator-facing classification of an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReasonCode {
    ExecutableNotFound,
    PermissionDenied,
    OutputNotMaterialized,
    SwitchInProgress,
    AlreadyRunning,
    NotRunning,
    InvalidInterface,
    ShuttingDown,
    SubscriberClosed,
    Io,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::ExecutableNotFound => "executable-not-found",
            ReasonCode::PermissionDenied => "permission-denied",
            ReasonCode::OutputNotMaterialized => "output-not-materialized",
            ReasonCode::SwitchInProgress => "switch-in-progress",
            ReasonCode::AlreadyRunning => "already-running",
            ReasonCode::NotRunning => "not-running",
            ReasonCode::InvalidInterface => "invalid-interface",
            ReasonCode::ShuttingDown => "shutting-down",
            ReasonCode::SubscriberClosed => "subscriber-closed",
            ReasonCode::Io => "io",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Anything that can be reported to the operator with a [`ReasonCode`].
/// Plain successes have no reason.
pub trait ReasonCoded {
    fn reason(&self) -> Option<ReasonCode>;
}

impl ReasonCoded for SupervisorError {
    fn reason(&self) -> Option<ReasonCode> {
        Some(match self {
            SupervisorError::TransitionInProgress => ReasonCode::SwitchInProgress,
            SupervisorError::ShuttingDown => ReasonCode::ShuttingDown,
            SupervisorError::InvalidInterface(_) | SupervisorError::InterfaceScoped(_) => {
                ReasonCode::InvalidInterface
            }
            SupervisorError::Session { .. } => ReasonCode::Io,
            SupervisorError::Capture(e) => return e.reason(),
            SupervisorError::Tail(e) => return e.reason(),
            SupervisorError::Registry(e) => return e.reason(),
        })
    }
}

impl ReasonCoded for CaptureError {
    fn reason(&self) -> Option<ReasonCode> {
        Some(match self {
            CaptureError::InvalidInterface { .. } => ReasonCode::InvalidInterface,
            CaptureError::ExecutableNotFound { .. } => ReasonCode::ExecutableNotFound,
            CaptureError::PermissionDenied { .. } => ReasonCode::PermissionDenied,
            CaptureError::Spawn { .. }
            | CaptureError::Output { .. }
            | CaptureError::Signal { .. }
            | CaptureError::Wait { .. } => ReasonCode::Io,
        })
    }
}

impl ReasonCoded for TailError {
    fn reason(&self) -> Option<ReasonCode> {
        Some(match self {
            TailError::OutputNotMaterialized { .. } => ReasonCode::OutputNotMaterialized,
            TailError::Io { .. } => ReasonCode::Io,
        })
    }
}

impl ReasonCoded for RegistryError {
    fn reason(&self) -> Option<ReasonCode> {
        Some(match self {
            RegistryError::AlreadyAttached(_) => ReasonCode::AlreadyRunning,
            RegistryError::ReplayRejected(_) => ReasonCode::SubscriberClosed,
        })
    }
}

impl ReasonCoded for StartOutcome {
    fn reason(&self) -> Option<ReasonCode> {
        match self {
            StartOutcome::Started { .. } => None,
            StartOutcome::AlreadyRunning { .. } => Some(ReasonCode::AlreadyRunning),
        }
    }
}

impl ReasonCoded for StopOutcome {
    fn reason(&self) -> Option<ReasonCode> {
        match self {
            StopOutcome::Stopped { .. } => None,
            StopOutcome::AlreadyStopped => Some(ReasonCode::NotRunning),
        }
    }
}

impl ReasonCoded for SelectOutcome {
    fn reason(&self) -> Option<ReasonCode> {
        match self {
            SelectOutcome::Started { .. } => None,
            SelectOutcome::AlreadyActive { .. } => Some(ReasonCode::AlreadyRunning),
        }
    }
}

impl<T: ReasonCoded, E: ReasonCoded> ReasonCoded for Result<T, E> {
    fn reason(&self) -> Option<ReasonCode> {
        match self {
            Ok(outcome) => outcome.reason(),
            Err(e) => e.reason(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn errors_carry_distinct_reasons() {
        let missing = SupervisorError::from(CaptureError::ExecutableNotFound {
            kind: SourceKind::PacketDump,
            program: "hcidump".into(),
        });
        let denied = SupervisorError::from(CaptureError::PermissionDenied {
            kind: SourceKind::PacketDump,
            program: "hcidump".into(),
        });
        let absent = SupervisorError::from(TailError::OutputNotMaterialized {
            path: "/tmp/x".into(),
            waited: Duration::from_secs(1),
        });

        assert_eq!(missing.reason().map(|r| r.as_str()), Some("executable-not-found"));
        assert_eq!(denied.reason().map(|r| r.as_str()), Some("permission-denied"));
        assert_eq!(absent.reason().map(|r| r.as_str()), Some("output-not-materialized"));
        assert_eq!(
            SupervisorError::TransitionInProgress.reason(),
            Some(ReasonCode::SwitchInProgress)
        );
    }

    #[test]
    fn idempotent_outcomes_are_reasons_not_errors() {
        assert_eq!(
            StartOutcome::AlreadyRunning { pid: 7 }.reason(),
            Some(ReasonCode::AlreadyRunning)
        );
        assert_eq!(StopOutcome::AlreadyStopped.reason(), Some(ReasonCode::NotRunning));
        assert_eq!(StartOutcome::Started { pid: 7 }.reason(), None);

        let ok: Result<StopOutcome, SupervisorError> = Ok(StopOutcome::AlreadyStopped);
        assert_eq!(ok.reason().map(|r| r.to_string()), Some("not-running".to_string()));
    }
}
