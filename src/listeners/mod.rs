//! Listener registry for decoupling change producers from consumers.
//!
//! Listeners register callbacks against a named [`Topic`](crate::types::Topic):
//! - Topics are created implicitly on first registration
//! - Every registration returns an idempotent [`Unsubscribe`]
//! - A panicking callback never stops its siblings from running
//!
//! Consumers that prefer pulling events can register a bounded
//! [`ListenerStream`] instead of a callback.
//!
//! # Example
//!
//! ```ignore
//! let registry = ListenerRegistry::<FanoutEvent>::new();
//!
//! let unsubscribe = registry.add_listener("inquiries", |event| {
//!     println!("inquiry changed: {:?}", event.change().event_type);
//! });
//!
//! let stream = registry.stream("dashboard", 100);
//! while let Ok(event) = stream.recv() {
//!     // ...
//! }
//!
//! unsubscribe.close();
//! ```

mod registry;
mod types;

pub use registry::{ErrorHook, ListenerFn, ListenerRegistry};
pub use types::{DropReason, ListenerFailure, ListenerId, ListenerStream, Unsubscribe};
