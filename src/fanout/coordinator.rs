//! Coordinator bridging table feeds into the listener registry.

use crate::error::Result;
use crate::feed::{ChangeFeedProvider, TableSubscription};
use crate::listeners::{ListenerFailure, ListenerRegistry, ListenerStream, Unsubscribe};
use crate::types::{
    ChangeEvent, ChannelSpec, ChannelStatus, DashboardEvent, FanoutEvent, TableName, Teardown,
    Topic,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use super::config::FanoutConfig;

/// Lifecycle of a coordinator. The only transition is `Active -> TornDown`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoordinatorState {
    Active,
    TornDown,
}

/// Owns one feed per watched table and re-publishes every change twice:
/// on the table's own topic, then on the dashboard topic.
///
/// Feeds that fail to open are logged and skipped; the rest keep working.
/// After [`cleanup`](Self::cleanup) nothing is delivered, even if the
/// provider flushes events for channels that are still closing. Dropping
/// the coordinator runs `cleanup`.
pub struct FanoutCoordinator {
    config: FanoutConfig,
    dashboard: Topic,
    registry: ListenerRegistry<FanoutEvent>,
    feeds: Vec<TableSubscription>,
    torn_down: Arc<AtomicBool>,
}

impl FanoutCoordinator {
    /// Validate `config` and open a feed for each watched table.
    ///
    /// Only an invalid config is an error; feed failures are not.
    pub fn new<P>(provider: &P, config: FanoutConfig) -> Result<Self>
    where
        P: ChangeFeedProvider + ?Sized,
    {
        let schema = config.validate()?;
        let registry = ListenerRegistry::new();
        let torn_down = Arc::new(AtomicBool::new(false));
        let dashboard = Topic::new(config.dashboard_topic.clone());

        let mut feeds = Vec::with_capacity(config.watched.len());
        for watched in &config.watched {
            let table = schema.table(&watched.table)?;
            let spec = ChannelSpec::new(schema.name(), table.clone()).with_filter(watched.filter.clone());
            let forward = forwarder(
                registry.clone(),
                Arc::clone(&torn_down),
                table,
                dashboard.clone(),
            );
            feeds.push(TableSubscription::open(provider, spec, forward));
        }

        let failed = feeds.iter().filter(|f| f.status().is_failure()).count();
        debug!(
            schema = schema.name(),
            tables = feeds.len(),
            failed,
            "fan-out coordinator active"
        );

        Ok(Self {
            config,
            dashboard,
            registry,
            feeds,
            torn_down,
        })
    }

    /// Register `callback` on `topic` (a table name or the dashboard topic).
    ///
    /// After cleanup this registers nothing and returns an inert handle.
    pub fn add_listener(
        &self,
        topic: impl Into<Topic>,
        callback: impl Fn(&FanoutEvent) + Send + Sync + 'static,
    ) -> Unsubscribe {
        self.listeners().add_listener(topic, callback)
    }

    /// Register a bounded stream on `topic` using the configured buffer size.
    pub fn stream(&self, topic: impl Into<Topic>) -> ListenerStream<FanoutEvent> {
        self.listeners().stream(topic)
    }

    pub fn stream_with_capacity(
        &self,
        topic: impl Into<Topic>,
        buffer_size: usize,
    ) -> ListenerStream<FanoutEvent> {
        self.listeners().stream_with_capacity(topic, buffer_size)
    }

    /// Install a hook observing panicking listeners.
    pub fn set_error_hook(&self, hook: impl Fn(&ListenerFailure) + Send + Sync + 'static) {
        self.registry.set_error_hook(hook);
    }

    /// A cloneable handle for consumers that register listeners without
    /// owning the coordinator. It cannot publish.
    pub fn listeners(&self) -> FanoutListeners {
        FanoutListeners {
            registry: self.registry.clone(),
            torn_down: Arc::clone(&self.torn_down),
            buffer_size: self.config.stream_buffer_size,
        }
    }

    pub fn config(&self) -> &FanoutConfig {
        &self.config
    }

    pub fn dashboard_topic(&self) -> &Topic {
        &self.dashboard
    }

    pub fn watched_tables(&self) -> Vec<TableName> {
        self.feeds.iter().map(|f| f.table().clone()).collect()
    }

    /// Latest channel status for each watched table.
    pub fn feed_statuses(&self) -> Vec<(TableName, ChannelStatus)> {
        self.feeds
            .iter()
            .map(|f| (f.table().clone(), f.status()))
            .collect()
    }

    /// Tables whose feed failed to open or broke since.
    pub fn failed_tables(&self) -> Vec<TableName> {
        self.feeds
            .iter()
            .filter(|f| f.status().is_failure())
            .map(|f| f.table().clone())
            .collect()
    }

    pub fn state(&self) -> CoordinatorState {
        if self.is_torn_down() {
            CoordinatorState::TornDown
        } else {
            CoordinatorState::Active
        }
    }

    /// Close every feed, then drop every listener. Irreversible; calling
    /// it again does nothing.
    pub fn cleanup(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }

        for feed in &self.feeds {
            feed.close();
        }
        self.registry.clear();
        debug!(tables = self.feeds.len(), "fan-out coordinator torn down");
    }

    fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }
}

impl Drop for FanoutCoordinator {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Subscribe-only view of a coordinator's topics.
///
/// Shares the coordinator's lifecycle: once the coordinator is torn down,
/// every handle registers nothing and hands out closed streams.
#[derive(Clone)]
pub struct FanoutListeners {
    registry: ListenerRegistry<FanoutEvent>,
    torn_down: Arc<AtomicBool>,
    buffer_size: usize,
}

impl FanoutListeners {
    pub fn add_listener(
        &self,
        topic: impl Into<Topic>,
        callback: impl Fn(&FanoutEvent) + Send + Sync + 'static,
    ) -> Unsubscribe {
        if self.is_torn_down() {
            debug!("listener registration after cleanup ignored");
            return Teardown::noop();
        }
        let unsubscribe = self.registry.add_listener(topic, callback);
        // Cleanup may have cleared the registry after the check above.
        if self.is_torn_down() {
            unsubscribe.close();
        }
        unsubscribe
    }

    pub fn stream(&self, topic: impl Into<Topic>) -> ListenerStream<FanoutEvent> {
        self.stream_with_capacity(topic, self.buffer_size)
    }

    pub fn stream_with_capacity(
        &self,
        topic: impl Into<Topic>,
        buffer_size: usize,
    ) -> ListenerStream<FanoutEvent> {
        let stream = self.registry.stream(topic, buffer_size);
        if self.is_torn_down() {
            stream.close();
        }
        stream
    }

    pub fn listener_count(&self, topic: &Topic) -> usize {
        self.registry.listener_count(topic)
    }

    pub fn total_listeners(&self) -> usize {
        self.registry.total_listeners()
    }

    /// Number of listener panics caught so far.
    pub fn failure_count(&self) -> u64 {
        self.registry.failure_count()
    }

    fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for FanoutListeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutListeners")
            .field("listeners", &self.registry.total_listeners())
            .field("torn_down", &self.is_torn_down())
            .finish()
    }
}

/// The per-table feed callback: table topic first, then the dashboard.
fn forwarder(
    registry: ListenerRegistry<FanoutEvent>,
    torn_down: Arc<AtomicBool>,
    table: TableName,
    dashboard: Topic,
) -> impl Fn(ChangeEvent) + Send + Sync + 'static {
    let table_topic = Topic::from(&table);
    move |change: ChangeEvent| {
        if torn_down.load(Ordering::Acquire) {
            trace!(table = %table, "discarding change after cleanup");
            return;
        }

        registry.notify(&table_topic, &FanoutEvent::Change(change.clone()));
        registry.notify(
            &dashboard,
            &FanoutEvent::Dashboard(DashboardEvent {
                table: table.clone(),
                data: change,
            }),
        );
    }
}
