//! # bluetrace-core
//!
//! Incremental delivery of a growing capture file to live consumers.
//!
//! ### Key Submodules:
//! - `events`: the `TailEvent` stream and subscriber identities
//! - `registry`: subscriber fan-out with bounded replay history
//! - `tail`: `LogTailer`, the byte-exact polling reader
//!
//! Delivery is exactly-once and in file order: a subscriber joining late gets
//! one `Replay` of what was captured so far, then every later `Chunk`.

pub mod error;
pub mod events;
pub mod registry;
pub mod tail;

pub mod prelude {
    pub use crate::error::*;
    pub use crate::events::*;
    pub use crate::registry::*;
    pub use crate::tail::*;
}

pub use error::{RegistryError, TailError};
pub use events::{DeliveryError, SubscriberId, TailEvent};
pub use registry::SubscriberRegistry;
pub use tail::{LogTailer, PollHandle, PollOutcome};
