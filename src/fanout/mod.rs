//! Fan-out of table change feeds into topic listeners.
//!
//! The [`FanoutCoordinator`] opens one feed per watched table and bridges
//! every change into a [`ListenerRegistry`](crate::listeners::ListenerRegistry)
//! under two topics:
//! - the table's own topic (payload: the change)
//! - the dashboard topic (payload: `{type: <table>, data: <change>}`)
//!
//! # Example
//!
//! ```ignore
//! let coordinator = FanoutCoordinator::new(&provider, FanoutConfig::default())?;
//!
//! let _inquiries = coordinator.add_listener("inquiries", |event| {
//!     println!("{:?}", event.change());
//! });
//! let _dashboard = coordinator.add_listener(Topic::dashboard(), |event| {
//!     if let Some(update) = event.as_dashboard() {
//!         println!("{} changed", update.table);
//!     }
//! });
//!
//! // On shutdown
//! coordinator.cleanup();
//! ```

mod config;
mod coordinator;

pub use config::{FanoutConfig, WatchedTable, DASHBOARD_TABLES};
pub use coordinator::{CoordinatorState, FanoutCoordinator, FanoutListeners};
