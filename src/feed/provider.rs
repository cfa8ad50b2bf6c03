//! The contract a realtime provider client must satisfy.

use crate::error::Result;
use crate::types::{ChannelSpec, ChannelStatus, Teardown};
use serde_json::Value;
use std::sync::Arc;

/// Receives each raw change payload pushed on a channel.
pub type PayloadCallback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Receives channel status transitions, with an optional provider message.
pub type StatusCallback = Arc<dyn Fn(ChannelStatus, Option<String>) + Send + Sync>;

/// Callbacks wired into one provider channel.
#[derive(Clone)]
pub struct ChannelCallbacks {
    pub on_payload: PayloadCallback,
    pub on_status: StatusCallback,
}

/// A realtime client able to open filtered per-table change channels.
pub trait ChangeFeedProvider: Send + Sync {
    /// Open a channel for `spec`.
    ///
    /// An `Err` means the provider rejected the channel outright. Failures
    /// discovered later are reported through `on_status`. The returned
    /// [`Teardown`] closes the channel.
    fn subscribe_filtered(&self, spec: &ChannelSpec, callbacks: ChannelCallbacks) -> Result<Teardown>;
}

impl<P: ChangeFeedProvider + ?Sized> ChangeFeedProvider for Arc<P> {
    fn subscribe_filtered(&self, spec: &ChannelSpec, callbacks: ChannelCallbacks) -> Result<Teardown> {
        (**self).subscribe_filtered(spec, callbacks)
    }
}
