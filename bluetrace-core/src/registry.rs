//! Subscriber fan-out for the tail stream.
//!
//! The registry owns both the subscriber list and the replay history under a
//! single lock. Publishing appends to the history and delivers to every
//! subscriber in one critical section; attaching snapshots the history and
//! registers in another. A late subscriber therefore sees each byte exactly
//! once: either inside its `Replay` or as a later `Chunk`, never both.
//!
//! Callbacks run while the registry is locked. They must return quickly and
//! must not call back into the registry; consumers with thread affinity should
//! use [`SubscriberRegistry::channel`] and receive on their own thread.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use bluetrace_telemetry::MetricsRecorder;

use crate::error::RegistryError;
use crate::events::{DeliveryError, SubscriberId, TailEvent};

/// Delivery callback. Returning `Err(DeliveryError::Closed)` detaches the subscriber.
pub type Callback = Box<dyn Fn(&TailEvent) -> Result<(), DeliveryError> + Send + Sync>;

struct Entry {
    id: SubscriberId,
    callback: Callback,
    delivered: u64,
}

impl Entry {
    /// Returns false when the subscriber must be dropped.
    fn deliver(&mut self, event: &TailEvent) -> bool {
        let callback = &self.callback;
        match panic::catch_unwind(AssertUnwindSafe(|| callback(event))) {
            Ok(Ok(())) => {
                self.delivered += event.data().map_or(0, |d| d.len() as u64);
                true
            }
            Ok(Err(DeliveryError::Closed)) => {
                debug!(subscriber = %self.id, "Subscriber closed, detaching");
                false
            }
            Err(_) => {
                warn!(subscriber = %self.id, "Subscriber callback panicked, detaching");
                false
            }
        }
    }
}

/// Bytes captured since offset zero of the current stream, bounded by `limit`.
struct History {
    stream: Option<(String, PathBuf)>,
    chunks: VecDeque<Bytes>,
    len: usize,
    limit: usize,
    /// File offset of the first retained byte.
    start_offset: u64,
}

impl History {
    fn new(limit: usize) -> Self {
        Self {
            stream: None,
            chunks: VecDeque::new(),
            len: 0,
            limit,
            start_offset: 0,
        }
    }

    fn reset(&mut self) {
        self.chunks.clear();
        self.len = 0;
        self.start_offset = 0;
    }

    fn append(&mut self, data: &Bytes) {
        if data.is_empty() {
            return;
        }
        self.chunks.push_back(data.clone());
        self.len += data.len();

        while self.len > self.limit {
            let excess = self.len - self.limit;
            let Some(front) = self.chunks.front_mut() else {
                break;
            };
            if front.len() <= excess {
                let dropped = front.len();
                self.chunks.pop_front();
                self.len -= dropped;
                self.start_offset += dropped as u64;
            } else {
                let _ = front.split_to(excess);
                self.len -= excess;
                self.start_offset += excess as u64;
            }
        }
    }

    fn snapshot(&self) -> Bytes {
        match self.chunks.len() {
            0 => Bytes::new(),
            1 => self.chunks[0].clone(),
            _ => {
                let mut joined = BytesMut::with_capacity(self.len);
                for chunk in &self.chunks {
                    joined.extend_from_slice(chunk);
                }
                joined.freeze()
            }
        }
    }

    fn replay_events(&self) -> Vec<TailEvent> {
        let mut events = Vec::with_capacity(2);
        if let Some((interface, path)) = &self.stream {
            events.push(TailEvent::StreamStarted {
                interface: interface.clone(),
                path: path.clone(),
            });
        }
        if self.len > 0 {
            events.push(TailEvent::Replay {
                offset: self.start_offset,
                data: self.snapshot(),
            });
        }
        events
    }
}

struct Inner {
    entries: Vec<Entry>,
    history: History,
}

/// Registration-ordered subscriber list plus the replay history.
pub struct SubscriberRegistry {
    inner: Mutex<Inner>,
    metrics: MetricsRecorder,
}

impl SubscriberRegistry {
    pub fn new(replay_limit: usize, metrics: MetricsRecorder) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: Vec::new(),
                history: History::new(replay_limit.max(1)),
            }),
            metrics,
        }
    }

    /// Registers `callback` under `id`. With `replay`, the current stream
    /// header and everything captured so far are delivered first, synchronously.
    pub fn attach(
        &self,
        id: SubscriberId,
        callback: Callback,
        replay: bool,
    ) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock();
        if inner.entries.iter().any(|entry| entry.id == id) {
            return Err(RegistryError::AlreadyAttached(id));
        }

        let mut entry = Entry {
            id,
            callback,
            delivered: 0,
        };
        if replay {
            for event in inner.history.replay_events() {
                if !entry.deliver(&event) {
                    return Err(RegistryError::ReplayRejected(id));
                }
            }
            debug!(subscriber = %id, replayed = entry.delivered, "Replay delivered");
        }

        inner.entries.push(entry);
        self.metrics.subscribers.set(inner.entries.len() as i64);
        Ok(())
    }

    /// Attaches a channel-backed subscriber and returns its receiving end.
    pub fn channel(
        &self,
        replay: bool,
    ) -> Result<(SubscriberId, mpsc::UnboundedReceiver<TailEvent>), RegistryError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = SubscriberId::next();
        self.attach(
            id,
            Box::new(move |event| tx.send(event.clone()).map_err(|_| DeliveryError::Closed)),
            replay,
        )?;
        Ok((id, rx))
    }

    /// Removes a subscriber. Returns false if it was not attached.
    pub fn detach(&self, id: SubscriberId) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|entry| entry.id != id);
        self.metrics.subscribers.set(inner.entries.len() as i64);
        inner.entries.len() != before
    }

    /// Records `event` in the history and delivers it to every subscriber in
    /// registration order. Subscribers that close or panic are dropped
    /// without affecting delivery to the rest.
    pub fn publish(&self, event: TailEvent) {
        let mut inner = self.inner.lock();
        match &event {
            TailEvent::StreamStarted { interface, path } => {
                inner.history.reset();
                inner.history.stream = Some((interface.clone(), path.clone()));
            }
            TailEvent::Discontinuity { .. } => inner.history.reset(),
            TailEvent::Chunk { data, .. } => inner.history.append(data),
            TailEvent::Replay { .. } => {}
        }

        let before = inner.entries.len();
        inner.entries.retain_mut(|entry| entry.deliver(&event));
        if inner.entries.len() != before {
            self.metrics.subscribers.set(inner.entries.len() as i64);
        }
        trace!(subscribers = inner.entries.len(), "Published tail event");
    }

    /// Forgets the current stream; subsequent late subscribers get no replay.
    pub fn end_stream(&self) {
        let mut inner = self.inner.lock();
        inner.history.reset();
        inner.history.stream = None;
    }

    /// Bytes retained for replay, in file order.
    pub fn snapshot(&self) -> Bytes {
        self.inner.lock().history.snapshot()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_attached(&self, id: SubscriberId) -> bool {
        self.inner.lock().entries.iter().any(|entry| entry.id == id)
    }
}
