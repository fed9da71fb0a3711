//! Tail stream event types and subscriber identities.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use thiserror::Error;

/// What a subscriber observes on the packet-dump stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TailEvent {
    /// A new output file is being tailed from offset zero.
    StreamStarted { interface: String, path: PathBuf },

    /// Catch-up delivered once to a late subscriber. `offset` is the file
    /// position of the first byte; it is non-zero when the bounded history
    /// had to drop a prefix.
    Replay { offset: u64, data: Bytes },

    /// Bytes appended since the previous chunk, starting at `offset`.
    Chunk { offset: u64, data: Bytes },

    /// The file shrank below (or was replaced under) the read cursor. The
    /// cursor restarted at zero; content between `previous_offset` and the
    /// rewrite may have been lost.
    Discontinuity { previous_offset: u64, file_len: u64 },
}

impl TailEvent {
    /// Payload bytes carried by the event, if any.
    pub fn data(&self) -> Option<&Bytes> {
        match self {
            TailEvent::Replay { data, .. } | TailEvent::Chunk { data, .. } => Some(data),
            TailEvent::StreamStarted { .. } | TailEvent::Discontinuity { .. } => None,
        }
    }
}

/// Why a subscriber could not take an event.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// The consumer is gone; the registry detaches it.
    #[error("subscriber closed")]
    Closed,
}

/// Identity token for a registered subscriber.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

impl SubscriberId {
    /// Allocates a process-unique id.
    pub fn next() -> Self {
        SubscriberId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl From<u64> for SubscriberId {
    fn from(raw: u64) -> Self {
        SubscriberId(raw)
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocated_ids_are_distinct() {
        let a = SubscriberId::next();
        let b = SubscriberId::next();
        assert_ne!(a, b);
        assert!(b.get() > a.get());
    }

    #[test]
    fn only_byte_events_carry_data() {
        let chunk = TailEvent::Chunk {
            offset: 0,
            data: Bytes::from_static(b"abc"),
        };
        assert_eq!(chunk.data().map(|d| d.len()), Some(3));
        let gap = TailEvent::Discontinuity {
            previous_offset: 3,
            file_len: 0,
        };
        assert!(gap.data().is_none());
    }
}
