//! Listener registry types.

use crate::types::{Teardown, Topic};
use crossbeam_channel::{Receiver, RecvError, RecvTimeoutError, TryRecvError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Unique identifier for a listener registration.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

impl fmt::Debug for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ListenerId({})", self.0)
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Removes exactly one listener registration. Idempotent.
pub type Unsubscribe = Teardown;

/// A listener that panicked while handling an event.
#[derive(Clone, Debug)]
pub struct ListenerFailure {
    pub topic: Topic,
    pub listener: ListenerId,
    /// The panic message, when it was a string.
    pub message: String,
}

/// Why a listener stream stopped receiving.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Buffer filled up (slow consumer).
    BufferOverflow,
    /// Receiving side went away.
    Disconnected,
    /// Explicitly closed.
    Unsubscribed,
}

/// A listener that buffers events into a bounded channel instead of
/// running a callback.
///
/// The receiving side disconnects once the listener has been removed from
/// the registry and the buffered events are drained. Dropping the stream
/// removes the listener.
pub struct ListenerStream<T> {
    pub id: ListenerId,
    pub topic: Topic,
    receiver: Receiver<T>,
    reason: Arc<Mutex<Option<DropReason>>>,
    teardown: Teardown,
}

impl<T> ListenerStream<T> {
    pub(crate) fn new(
        id: ListenerId,
        topic: Topic,
        receiver: Receiver<T>,
        reason: Arc<Mutex<Option<DropReason>>>,
        teardown: Teardown,
    ) -> Self {
        Self {
            id,
            topic,
            receiver,
            reason,
            teardown,
        }
    }

    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<T, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<T, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Events buffered and not yet received.
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }

    /// Set once the stream has been dropped from the registry.
    pub fn drop_reason(&self) -> Option<DropReason> {
        self.reason.lock().clone()
    }

    /// Stop receiving new events. Already-buffered events stay readable.
    pub fn close(&self) {
        self.reason.lock().get_or_insert(DropReason::Unsubscribed);
        self.teardown.close();
    }
}

impl<T> Drop for ListenerStream<T> {
    fn drop(&mut self) {
        self.teardown.close();
    }
}

impl<T> fmt::Debug for ListenerStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerStream")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("pending", &self.receiver.len())
            .field("drop_reason", &self.drop_reason())
            .finish()
    }
}
