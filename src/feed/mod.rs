//! Per-table change feeds.
//!
//! A [`TableSubscription`] opens exactly one provider channel for one
//! table (optionally narrowed by a [`RowFilter`](crate::types::RowFilter))
//! and hands every decoded [`ChangeEvent`](crate::types::ChangeEvent) to a
//! callback. The provider itself sits behind the narrow
//! [`ChangeFeedProvider`] trait; [`MemoryFeed`] is the in-process
//! implementation used for local runs and tests.
//!
//! # Example
//!
//! ```ignore
//! let feed = MemoryFeed::new();
//! let table = Schema::default().table("inquiries")?;
//!
//! let subscription = subscribe_to_table(&feed, table, |change| {
//!     println!("{} {:?}", change.event_type, change.row());
//! }, None);
//!
//! // Later
//! subscription.close();
//! ```

mod memory;
mod provider;
mod subscription;

pub use memory::{MemoryFeed, CLOSED_CHANNEL_RETENTION};
pub use provider::{ChangeFeedProvider, ChannelCallbacks, PayloadCallback, StatusCallback};
pub use subscription::{subscribe_to_table, TableSubscription, DEFAULT_SCHEMA};
