use std::path::PathBuf;

use thiserror::Error;

use crate::source::SourceKind;

/// Why a capture source could not be started or stopped.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("{kind}: invalid interface name {name:?}")]
    InvalidInterface { kind: SourceKind, name: String },

    #[error("{kind}: executable not found: {program}")]
    ExecutableNotFound { kind: SourceKind, program: String },

    #[error("{kind}: permission denied running {program}")]
    PermissionDenied { kind: SourceKind, program: String },

    #[error("{kind}: failed to spawn {program}: {source}")]
    Spawn {
        kind: SourceKind,
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{kind}: cannot prepare output {path}: {source}")]
    Output {
        kind: SourceKind,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{kind}: failed to signal pid {pid}: {source}")]
    Signal {
        kind: SourceKind,
        pid: u32,
        #[source]
        source: nix::errno::Errno,
    },

    #[error("{kind}: failed waiting for exit: {source}")]
    Wait {
        kind: SourceKind,
        #[source]
        source: std::io::Error,
    },
}

impl CaptureError {
    /// Classifies a spawn failure so missing executables and permission
    /// problems are reported distinctly.
    pub(crate) fn from_spawn(kind: SourceKind, program: &str, source: std::io::Error) -> Self {
        let program = program.to_string();
        match source.kind() {
            std::io::ErrorKind::NotFound => CaptureError::ExecutableNotFound { kind, program },
            std::io::ErrorKind::PermissionDenied => CaptureError::PermissionDenied { kind, program },
            _ => CaptureError::Spawn {
                kind,
                program,
                source,
            },
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            CaptureError::InvalidInterface { kind, .. }
            | CaptureError::ExecutableNotFound { kind, .. }
            | CaptureError::PermissionDenied { kind, .. }
            | CaptureError::Spawn { kind, .. }
            | CaptureError::Output { kind, .. }
            | CaptureError::Signal { kind, .. }
            | CaptureError::Wait { kind, .. } => *kind,
        }
    }
}
