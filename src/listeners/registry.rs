//! Topic-keyed listener registry.

use crate::types::{Teardown, Topic};
use crossbeam_channel::{bounded, TrySendError};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

use super::types::{DropReason, ListenerFailure, ListenerId, ListenerStream, Unsubscribe};

/// Closure type for listeners.
pub type ListenerFn<T> = dyn Fn(&T) + Send + Sync;

/// Closure type for the listener failure hook.
pub type ErrorHook = dyn Fn(&ListenerFailure) + Send + Sync;

struct Listener<T> {
    id: ListenerId,
    /// Cleared on removal so snapshots taken earlier skip this listener.
    active: AtomicBool,
    callback: Arc<ListenerFn<T>>,
}

struct RegistryInner<T> {
    topics: RwLock<HashMap<Topic, Vec<Arc<Listener<T>>>>>,
    next_id: AtomicU64,
    error_hook: RwLock<Option<Arc<ErrorHook>>>,
    failures: AtomicU64,
}

impl<T> RegistryInner<T> {
    fn remove(&self, topic: &Topic, id: ListenerId) -> bool {
        let mut topics = self.topics.write();
        let Some(listeners) = topics.get_mut(topic) else {
            return false;
        };
        match listeners.iter().position(|l| l.id == id) {
            Some(pos) => {
                let listener = listeners.remove(pos);
                listener.active.store(false, Ordering::Release);
                true
            }
            None => false,
        }
    }
}

/// Maps topics to listener callbacks and broadcasts payloads to them.
///
/// Cloning shares the same registry. All methods take `&self`; the lock is
/// never held while a callback runs, so callbacks may add or remove
/// listeners (including themselves).
///
/// Each registration is independent: adding the same callback twice makes
/// it fire twice per broadcast, and each [`Unsubscribe`] removes only its
/// own registration. Callback order within a topic is unspecified.
pub struct ListenerRegistry<T> {
    inner: Arc<RegistryInner<T>>,
}

impl<T> Clone for ListenerRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: 'static> ListenerRegistry<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                topics: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                error_hook: RwLock::new(None),
                failures: AtomicU64::new(0),
            }),
        }
    }

    /// Register `callback` under `topic`, creating the topic on first use.
    pub fn add_listener(
        &self,
        topic: impl Into<Topic>,
        callback: impl Fn(&T) + Send + Sync + 'static,
    ) -> Unsubscribe {
        let id = self.allocate_id();
        self.insert(topic.into(), id, Arc::new(callback))
    }

    /// Register a bounded channel under `topic`.
    ///
    /// When the buffer is full the stream is removed from the registry
    /// with [`DropReason::BufferOverflow`] rather than blocking dispatch.
    pub fn stream(&self, topic: impl Into<Topic>, buffer_size: usize) -> ListenerStream<T>
    where
        T: Clone + Send,
    {
        let topic = topic.into();
        let id = self.allocate_id();
        let (sender, receiver) = bounded(buffer_size.max(1));
        let reason = Arc::new(Mutex::new(None));

        let callback = {
            let topic = topic.clone();
            let reason = Arc::clone(&reason);
            let registry = Arc::downgrade(&self.inner);
            move |event: &T| {
                let dropped = match sender.try_send(event.clone()) {
                    Ok(()) => return,
                    Err(TrySendError::Full(_)) => DropReason::BufferOverflow,
                    Err(TrySendError::Disconnected(_)) => DropReason::Disconnected,
                };
                warn!(topic = %topic, listener = id.0, reason = ?dropped, "dropping listener stream");
                reason.lock().get_or_insert(dropped);
                if let Some(inner) = registry.upgrade() {
                    inner.remove(&topic, id);
                }
            }
        };

        let teardown = self.insert(topic.clone(), id, Arc::new(callback));
        ListenerStream::new(id, topic, receiver, reason, teardown)
    }

    /// Invoke every listener registered on `topic` with `payload`.
    ///
    /// A panicking listener is isolated: the panic is logged, reported to
    /// the error hook, and the remaining listeners still run. Returns the
    /// number of listeners that completed normally.
    pub fn notify(&self, topic: &Topic, payload: &T) -> usize {
        let snapshot: Vec<Arc<Listener<T>>> = {
            let topics = self.inner.topics.read();
            match topics.get(topic) {
                Some(listeners) => listeners.clone(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        for listener in snapshot {
            if !listener.active.load(Ordering::Acquire) {
                continue;
            }
            match panic::catch_unwind(AssertUnwindSafe(|| (listener.callback)(payload))) {
                Ok(()) => delivered += 1,
                Err(panic) => self.report_failure(topic, listener.id, &*panic),
            }
        }

        trace!(topic = %topic, delivered, "notified listeners");
        delivered
    }

    /// Install a hook called for every panicking listener.
    pub fn set_error_hook(&self, hook: impl Fn(&ListenerFailure) + Send + Sync + 'static) {
        *self.inner.error_hook.write() = Some(Arc::new(hook));
    }

    pub fn clear_error_hook(&self) {
        *self.inner.error_hook.write() = None;
    }

    /// Total listener panics observed.
    pub fn failure_count(&self) -> u64 {
        self.inner.failures.load(Ordering::Relaxed)
    }

    /// Listeners currently registered on `topic`.
    pub fn listener_count(&self, topic: &Topic) -> usize {
        self.inner.topics.read().get(topic).map_or(0, Vec::len)
    }

    pub fn total_listeners(&self) -> usize {
        self.inner.topics.read().values().map(Vec::len).sum()
    }

    /// Topics that have ever had a listener, sorted.
    pub fn topics(&self) -> Vec<Topic> {
        let mut topics: Vec<Topic> = self.inner.topics.read().keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Drop every registration on every topic.
    pub fn clear(&self) {
        let removed = std::mem::take(&mut *self.inner.topics.write());
        let mut count = 0;
        for listener in removed.values().flatten() {
            listener.active.store(false, Ordering::Release);
            count += 1;
        }
        debug!(removed = count, "cleared listener registry");
    }

    fn allocate_id(&self) -> ListenerId {
        ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn insert(&self, topic: Topic, id: ListenerId, callback: Arc<ListenerFn<T>>) -> Unsubscribe {
        let listener = Arc::new(Listener {
            id,
            active: AtomicBool::new(true),
            callback,
        });
        self.inner
            .topics
            .write()
            .entry(topic.clone())
            .or_default()
            .push(listener);
        debug!(topic = %topic, listener = id.0, "listener added");

        let registry = Arc::downgrade(&self.inner);
        Teardown::new(move || {
            if let Some(inner) = registry.upgrade() {
                if inner.remove(&topic, id) {
                    debug!(topic = %topic, listener = id.0, "listener removed");
                }
            }
        })
    }

    fn report_failure(&self, topic: &Topic, listener: ListenerId, panic: &(dyn Any + Send)) {
        let message = panic_message(panic);
        self.inner.failures.fetch_add(1, Ordering::Relaxed);
        error!(topic = %topic, listener = listener.0, error = %message, "listener panicked");

        let hook = self.inner.error_hook.read().clone();
        if let Some(hook) = hook {
            let failure = ListenerFailure {
                topic: topic.clone(),
                listener,
                message,
            };
            if panic::catch_unwind(AssertUnwindSafe(|| hook(&failure))).is_err() {
                error!(topic = %topic, "listener error hook panicked");
            }
        }
    }
}

impl<T: 'static> Default for ListenerRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
