use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::events::SubscriberId;

#[derive(Debug, Error)]
pub enum TailError {
    #[error("Output {path} did not appear within {waited:?}")]
    OutputNotMaterialized { path: PathBuf, waited: Duration },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl TailError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        TailError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Subscriber {0} is already attached")]
    AlreadyAttached(SubscriberId),

    #[error("Subscriber {0} refused its replay")]
    ReplayRejected(SubscriberId),
}
