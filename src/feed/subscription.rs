//! One live change feed for one table.

use crate::types::{ChangeEvent, ChannelSpec, ChannelStatus, RowFilter, TableName, Teardown};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::provider::{ChangeFeedProvider, ChannelCallbacks, PayloadCallback, StatusCallback};

/// Schema used by [`subscribe_to_table`].
pub const DEFAULT_SCHEMA: &str = "public";

/// Handle to one open table channel.
///
/// Never fails to construct: if the provider rejects the channel the
/// failure is logged, [`status`](Self::status) reports `ChannelError` and
/// [`close`](Self::close) is a no-op.
pub struct TableSubscription {
    spec: ChannelSpec,
    status: Arc<Mutex<ChannelStatus>>,
    /// Set on teardown; payloads arriving afterwards are discarded.
    closed: Arc<AtomicBool>,
    teardown: Teardown,
}

impl TableSubscription {
    /// Open a channel for `spec` and forward decoded changes to `on_change`.
    pub fn open<P, F>(provider: &P, spec: ChannelSpec, on_change: F) -> Self
    where
        P: ChangeFeedProvider + ?Sized,
        F: Fn(ChangeEvent) + Send + Sync + 'static,
    {
        let closed = Arc::new(AtomicBool::new(false));
        let status = Arc::new(Mutex::new(ChannelStatus::Joining));
        let table = spec.table.clone();

        let callbacks = ChannelCallbacks {
            on_payload: payload_handler(table.clone(), Arc::clone(&closed), on_change),
            on_status: status_handler(table.clone(), Arc::clone(&closed), Arc::clone(&status)),
        };

        let teardown = match provider.subscribe_filtered(&spec, callbacks) {
            Ok(channel) => {
                debug!(table = %table, channel = %spec.channel_name(), "change feed opened");
                let closed = Arc::clone(&closed);
                let status = Arc::clone(&status);
                Teardown::new(move || {
                    closed.store(true, Ordering::Release);
                    channel.close();
                    *status.lock() = ChannelStatus::Closed;
                    debug!(table = %table, "change feed closed");
                })
            }
            Err(e) => {
                warn!(
                    table = %table,
                    channel = %spec.channel_name(),
                    error = %e,
                    "failed to open change feed"
                );
                closed.store(true, Ordering::Release);
                *status.lock() = ChannelStatus::ChannelError;
                Teardown::noop()
            }
        };

        Self {
            spec,
            status,
            closed,
            teardown,
        }
    }

    pub fn table(&self) -> &TableName {
        &self.spec.table
    }

    pub fn spec(&self) -> &ChannelSpec {
        &self.spec
    }

    /// Latest status reported for the channel.
    pub fn status(&self) -> ChannelStatus {
        *self.status.lock()
    }

    /// Whether changes can still be delivered.
    pub fn is_active(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && !self.status().is_failure()
    }

    /// Close the channel. Safe to call any number of times.
    pub fn close(&self) {
        self.teardown.close();
    }

    /// Keep only the teardown action, discarding status tracking.
    pub fn into_teardown(self) -> Teardown {
        self.teardown
    }
}

/// Open a feed on `table` in the default schema.
pub fn subscribe_to_table<P, F>(
    provider: &P,
    table: TableName,
    on_change: F,
    filter: Option<RowFilter>,
) -> TableSubscription
where
    P: ChangeFeedProvider + ?Sized,
    F: Fn(ChangeEvent) + Send + Sync + 'static,
{
    let spec = ChannelSpec::new(DEFAULT_SCHEMA, table).with_filter(filter);
    TableSubscription::open(provider, spec, on_change)
}

fn payload_handler<F>(table: TableName, closed: Arc<AtomicBool>, on_change: F) -> PayloadCallback
where
    F: Fn(ChangeEvent) + Send + Sync + 'static,
{
    Arc::new(move |payload: &Value| {
        if closed.load(Ordering::Acquire) {
            trace!(table = %table, "discarding change after teardown");
            return;
        }

        if let Some(other) = payload.get("table").and_then(Value::as_str) {
            if other != table.as_str() {
                warn!(table = %table, payload_table = other, "dropping change for another table");
                return;
            }
        }

        match ChangeEvent::from_payload(payload) {
            Ok(change) => {
                trace!(table = %table, event_type = %change.event_type, "change received");
                on_change(change);
            }
            Err(e) => warn!(table = %table, error = %e, "dropping malformed change payload"),
        }
    })
}

fn status_handler(
    table: TableName,
    closed: Arc<AtomicBool>,
    status: Arc<Mutex<ChannelStatus>>,
) -> StatusCallback {
    Arc::new(move |next: ChannelStatus, reason: Option<String>| {
        // The teardown owns the final status.
        if closed.load(Ordering::Acquire) {
            trace!(table = %table, status = %next, "ignoring status after teardown");
            return;
        }

        *status.lock() = next;
        match next {
            ChannelStatus::ChannelError | ChannelStatus::TimedOut => {
                warn!(table = %table, status = %next, reason = ?reason, "change feed failed");
            }
            ChannelStatus::Subscribed => debug!(table = %table, "change feed subscribed"),
            ChannelStatus::Closed => trace!(table = %table, "provider closed channel"),
            ChannelStatus::Joining => {}
        }
    })
}
