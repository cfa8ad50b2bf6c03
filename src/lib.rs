//! # Realtime Fan-out
//!
//! Aggregates live row changes from several database tables into a single
//! in-process event bus.
//!
//! ## Core Concepts
//!
//! - **Table feeds**: One provider channel per table, decoded into uniform
//!   `{new, old, eventType}` changes
//! - **Listener registry**: Topic-keyed callbacks with idempotent unsubscribe
//!   and per-callback panic isolation
//! - **Coordinator**: Re-publishes each change on its table topic and on the
//!   aggregate dashboard topic, and owns feed teardown
//!
//! ## Example
//!
//! ```ignore
//! use realtime_fanout::{FanoutConfig, FanoutCoordinator, MemoryFeed, Topic};
//!
//! let feed = MemoryFeed::new();
//! let coordinator = FanoutCoordinator::new(&feed, FanoutConfig::default())?;
//!
//! let unsubscribe = coordinator.add_listener(Topic::dashboard(), |event| {
//!     println!("{:?}", event);
//! });
//!
//! // ...
//! unsubscribe.close();
//! coordinator.cleanup();
//! ```

pub mod error;
pub mod fanout;
pub mod feed;
pub mod listeners;
pub mod types;

// Re-exports
pub use error::{FanoutError, Result};
pub use fanout::{
    CoordinatorState, FanoutConfig, FanoutCoordinator, FanoutListeners, WatchedTable,
    DASHBOARD_TABLES,
};
pub use feed::{
    subscribe_to_table, ChangeFeedProvider, ChannelCallbacks, MemoryFeed, PayloadCallback,
    StatusCallback, TableSubscription, DEFAULT_SCHEMA,
};
pub use listeners::{
    DropReason, ErrorHook, ListenerFailure, ListenerFn, ListenerId, ListenerRegistry,
    ListenerStream, Unsubscribe,
};
pub use types::*;
