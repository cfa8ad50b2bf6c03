//! In-process change feed provider.

use crate::error::{FanoutError, Result};
use crate::types::{ChangeEvent, ChannelSpec, ChannelStatus, Row, TableName, Teardown};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use super::provider::{ChangeFeedProvider, ChannelCallbacks, PayloadCallback, StatusCallback};

/// Closed channels kept for [`MemoryFeed::push_trailing`]; older ones are
/// dropped first.
pub const CLOSED_CHANNEL_RETENTION: usize = 64;

struct MemoryChannel {
    id: u64,
    spec: ChannelSpec,
    callbacks: ChannelCallbacks,
    open: bool,
}

#[derive(Default)]
struct FeedState {
    /// Closed channels are kept so trailing deliveries can be simulated.
    channels: Vec<MemoryChannel>,
    next_id: u64,
    /// Tables whose channel opens are refused, with the reason.
    rejected: HashMap<String, String>,
}

impl FeedState {
    /// Drop the oldest closed channels beyond the retention limit.
    fn prune_closed(&mut self) {
        let closed = self.channels.iter().filter(|c| !c.open).count();
        let mut excess = closed.saturating_sub(CLOSED_CHANNEL_RETENTION);
        if excess == 0 {
            return;
        }
        self.channels.retain(|c| {
            if !c.open && excess > 0 {
                excess -= 1;
                false
            } else {
                true
            }
        });
    }
}

/// A [`ChangeFeedProvider`] that delivers pushed changes synchronously on
/// the pushing thread.
///
/// Channels acknowledge with `Subscribed` as soon as they are opened.
/// Callbacks are always invoked without the internal lock held, so they
/// may open or close channels.
#[derive(Clone, Default)]
pub struct MemoryFeed {
    inner: Arc<Mutex<FeedState>>,
}

impl MemoryFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse future channel opens for `table`.
    pub fn reject_table(&self, table: &str, reason: impl Into<String>) {
        self.inner.lock().rejected.insert(table.to_string(), reason.into());
    }

    /// Accept channel opens for `table` again.
    pub fn accept_table(&self, table: &str) {
        self.inner.lock().rejected.remove(table);
    }

    /// Report `status` on every open channel of `table` and close them.
    ///
    /// Returns the number of channels affected.
    pub fn fail_channels(&self, table: &str, status: ChannelStatus, reason: &str) -> usize {
        let callbacks: Vec<StatusCallback> = {
            let mut state = self.inner.lock();
            let failed = state
                .channels
                .iter_mut()
                .filter(|c| c.open && c.spec.table == table)
                .map(|c| {
                    c.open = false;
                    Arc::clone(&c.callbacks.on_status)
                })
                .collect();
            state.prune_closed();
            failed
        };

        for on_status in &callbacks {
            on_status(status, Some(reason.to_string()));
        }
        callbacks.len()
    }

    /// Deliver a raw payload to every open channel on `table` whose filter
    /// accepts it. Returns the number of channels it was delivered to.
    pub fn push(&self, table: &TableName, payload: &Value) -> usize {
        self.deliver(table, payload, false)
    }

    /// Encode `change` for each matching channel's schema and deliver it.
    pub fn push_change(&self, table: &TableName, change: &ChangeEvent) -> usize {
        let targets = self.targets(table, &change.row().cloned(), false);
        for (schema, on_payload) in &targets {
            on_payload(&change.to_payload(schema, table));
        }
        targets.len()
    }

    /// Deliver a payload to matching channels on `table`, including ones
    /// already closed, as a provider flushing in-flight events would.
    pub fn push_trailing(&self, table: &TableName, payload: &Value) -> usize {
        self.deliver(table, payload, true)
    }

    /// Number of open channels on `table`.
    pub fn open_channels(&self, table: &str) -> usize {
        self.inner
            .lock()
            .channels
            .iter()
            .filter(|c| c.open && c.spec.table == table)
            .count()
    }

    /// Names of all open channels.
    pub fn channel_names(&self) -> Vec<String> {
        self.inner
            .lock()
            .channels
            .iter()
            .filter(|c| c.open)
            .map(|c| c.spec.channel_name())
            .collect()
    }

    /// Number of channels held, open or closed.
    pub fn retained_channels(&self) -> usize {
        self.inner.lock().channels.len()
    }

    fn deliver(&self, table: &TableName, payload: &Value, include_closed: bool) -> usize {
        let row = row_of(payload);
        let targets = self.targets(table, &row, include_closed);
        for (_, on_payload) in &targets {
            on_payload(payload);
        }
        targets.len()
    }

    fn targets(
        &self,
        table: &TableName,
        row: &Option<Row>,
        include_closed: bool,
    ) -> Vec<(String, PayloadCallback)> {
        let state = self.inner.lock();
        state
            .channels
            .iter()
            .filter(|c| (c.open || include_closed) && &c.spec.table == table)
            .filter(|c| match (&c.spec.filter, row) {
                (None, _) => true,
                (Some(filter), Some(row)) => filter.matches(row),
                (Some(_), None) => false,
            })
            .map(|c| (c.spec.schema.clone(), Arc::clone(&c.callbacks.on_payload)))
            .collect()
    }
}

impl ChangeFeedProvider for MemoryFeed {
    fn subscribe_filtered(&self, spec: &ChannelSpec, callbacks: ChannelCallbacks) -> Result<Teardown> {
        let id = {
            let mut state = self.inner.lock();
            if let Some(reason) = state.rejected.get(spec.table.as_str()) {
                return Err(FanoutError::SubscribeFailed {
                    table: spec.table.to_string(),
                    reason: reason.clone(),
                });
            }
            state.prune_closed();
            state.next_id += 1;
            let id = state.next_id;
            state.channels.push(MemoryChannel {
                id,
                spec: spec.clone(),
                callbacks: callbacks.clone(),
                open: true,
            });
            id
        };

        (callbacks.on_status)(ChannelStatus::Subscribed, None);

        let feed = Arc::downgrade(&self.inner);
        Ok(Teardown::new(move || close_channel(&feed, id)))
    }
}

fn close_channel(feed: &Weak<Mutex<FeedState>>, id: u64) {
    let Some(inner) = feed.upgrade() else {
        return;
    };

    let on_status = {
        let mut state = inner.lock();
        let closed = state
            .channels
            .iter_mut()
            .find(|c| c.id == id && c.open)
            .map(|c| {
                c.open = false;
                Arc::clone(&c.callbacks.on_status)
            });
        state.prune_closed();
        closed
    };

    if let Some(on_status) = on_status {
        on_status(ChannelStatus::Closed, None);
    }
}

/// The row a filter is evaluated against: `new`, or `old` for deletes.
fn row_of(payload: &Value) -> Option<Row> {
    let pick = |key: &str| {
        payload
            .get(key)
            .and_then(Value::as_object)
            .filter(|row| !row.is_empty())
            .cloned()
    };
    pick("new").or_else(|| pick("old"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RowFilter, Schema};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_callbacks() -> (Arc<AtomicUsize>, Arc<Mutex<Vec<ChannelStatus>>>, ChannelCallbacks) {
        let payloads = Arc::new(AtomicUsize::new(0));
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let p = Arc::clone(&payloads);
        let s = Arc::clone(&statuses);
        let callbacks = ChannelCallbacks {
            on_payload: Arc::new(move |_: &Value| {
                p.fetch_add(1, Ordering::SeqCst);
            }),
            on_status: Arc::new(move |status: ChannelStatus, _: Option<String>| s.lock().push(status)),
        };
        (payloads, statuses, callbacks)
    }

    #[test]
    fn test_channel_lifecycle() {
        let feed = MemoryFeed::new();
        let table = Schema::default().table("inquiries").unwrap();
        let (payloads, statuses, callbacks) = counting_callbacks();

        let teardown = feed
            .subscribe_filtered(&ChannelSpec::new("public", table.clone()), callbacks)
            .unwrap();
        assert_eq!(feed.open_channels("inquiries"), 1);
        assert_eq!(feed.channel_names(), vec!["realtime:public:inquiries".to_string()]);

        feed.push(&table, &json!({"eventType": "INSERT", "new": {"id": 1}}));
        assert_eq!(payloads.load(Ordering::SeqCst), 1);

        teardown.close();
        teardown.close();
        assert_eq!(feed.open_channels("inquiries"), 0);
        assert_eq!(feed.push(&table, &json!({"eventType": "INSERT", "new": {"id": 2}})), 0);
        assert_eq!(
            *statuses.lock(),
            vec![ChannelStatus::Subscribed, ChannelStatus::Closed]
        );
    }

    #[test]
    fn test_rejected_table() {
        let feed = MemoryFeed::new();
        feed.reject_table("inquiries", "jwt expired");
        let table = Schema::default().table("inquiries").unwrap();
        let (_, statuses, callbacks) = counting_callbacks();

        let result = feed.subscribe_filtered(&ChannelSpec::new("public", table.clone()), callbacks.clone());
        assert!(matches!(
            result,
            Err(FanoutError::SubscribeFailed { ref reason, .. }) if reason == "jwt expired"
        ));
        assert!(statuses.lock().is_empty());

        feed.accept_table("inquiries");
        assert!(feed.subscribe_filtered(&ChannelSpec::new("public", table), callbacks).is_ok());
    }

    #[test]
    fn test_filtered_delivery_uses_old_row_for_deletes() {
        let feed = MemoryFeed::new();
        let table = Schema::default().table("messages").unwrap();
        let (payloads, _, callbacks) = counting_callbacks();

        let spec = ChannelSpec::new("public", table.clone()).with_filter(Some(RowFilter::eq("id", "9")));
        let _teardown = feed.subscribe_filtered(&spec, callbacks).unwrap();

        feed.push(&table, &json!({"eventType": "DELETE", "new": {}, "old": {"id": 9}}));
        feed.push(&table, &json!({"eventType": "DELETE", "new": {}, "old": {"id": 8}}));
        feed.push(&table, &json!({"eventType": "DELETE", "new": {}, "old": {}}));
        assert_eq!(payloads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscribe_churn_bounds_retained_channels() {
        let feed = MemoryFeed::new();
        let table = Schema::default().table("projects").unwrap();
        let (_, _, callbacks) = counting_callbacks();
        let spec = ChannelSpec::new("public", table.clone());

        let _kept = feed.subscribe_filtered(&spec, callbacks.clone()).unwrap();
        for _ in 0..500 {
            let teardown = feed.subscribe_filtered(&spec, callbacks.clone()).unwrap();
            teardown.close();
        }
        assert_eq!(feed.retained_channels(), CLOSED_CHANNEL_RETENTION + 1);
        assert_eq!(feed.open_channels("projects"), 1);

        // The most recently closed channels still get trailing payloads.
        let payload = json!({"eventType": "INSERT", "new": {"id": 1}});
        assert_eq!(feed.push_trailing(&table, &payload), CLOSED_CHANNEL_RETENTION + 1);

        for _ in 0..10 {
            let _open = feed.subscribe_filtered(&spec, callbacks.clone()).unwrap();
        }
        feed.fail_channels("projects", ChannelStatus::ChannelError, "socket reset");
        assert_eq!(feed.retained_channels(), CLOSED_CHANNEL_RETENTION);
    }
}
