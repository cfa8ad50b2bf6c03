//! Error handling and edge case tests.

use parking_lot::Mutex;
use realtime_fanout::{
    ChangeEvent, ChannelStatus, FanoutConfig, FanoutCoordinator, FanoutError, FanoutEvent,
    ListenerFailure, MemoryFeed, Row, Schema, TableName, Topic,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn row(value: serde_json::Value) -> Row {
    value.as_object().cloned().unwrap()
}

fn table(name: &str) -> TableName {
    Schema::default().table(name).unwrap()
}

fn counter() -> (Arc<AtomicUsize>, impl Fn(&FanoutEvent) + Send + Sync + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&count);
    (count, move |_: &FanoutEvent| {
        c.fetch_add(1, Ordering::SeqCst);
    })
}

// --- Feed Failures ---

#[test]
fn test_rejected_feed_does_not_block_others() {
    let feed = MemoryFeed::new();
    feed.reject_table("messages", "permission denied for table messages");

    let coordinator = FanoutCoordinator::new(&feed, FanoutConfig::default()).unwrap();
    assert_eq!(coordinator.failed_tables(), vec![table("messages")]);
    assert_eq!(coordinator.watched_tables().len(), 5);

    let (count, on_event) = counter();
    let _listener = coordinator.add_listener(Topic::dashboard(), on_event);

    feed.push_change(&table("messages"), &ChangeEvent::insert(row(json!({"id": 1}))));
    feed.push_change(&table("profiles"), &ChangeEvent::insert(row(json!({"id": 1}))));
    feed.push_change(&table("projects"), &ChangeEvent::insert(row(json!({"id": 1}))));

    assert_eq!(count.load(Ordering::SeqCst), 2);

    // Cleanup still works with a missing feed.
    coordinator.cleanup();
    coordinator.cleanup();
}

#[test]
fn test_every_feed_rejected() {
    let feed = MemoryFeed::new();
    for name in realtime_fanout::DASHBOARD_TABLES {
        feed.reject_table(name, "network unreachable");
    }

    let coordinator = FanoutCoordinator::new(&feed, FanoutConfig::default()).unwrap();
    assert_eq!(coordinator.failed_tables().len(), 5);
    assert!(coordinator
        .feed_statuses()
        .iter()
        .all(|(_, status)| *status == ChannelStatus::ChannelError));
}

#[test]
fn test_feed_breaking_later_is_reported() {
    let feed = MemoryFeed::new();
    let coordinator = FanoutCoordinator::new(&feed, FanoutConfig::default()).unwrap();
    let (count, on_event) = counter();
    let _listener = coordinator.add_listener("projects", on_event);

    feed.fail_channels("projects", ChannelStatus::TimedOut, "heartbeat timeout");

    assert_eq!(coordinator.failed_tables(), vec![table("projects")]);
    assert_eq!(
        feed.push_change(&table("projects"), &ChangeEvent::insert(row(json!({"id": 1})))),
        0
    );
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[test]
fn test_invalid_config_rejected() {
    let feed = MemoryFeed::new();

    let result = FanoutCoordinator::new(&feed, FanoutConfig::default().watch("audit_log", None));
    assert!(matches!(result, Err(FanoutError::UnknownTable(_))));

    // Nothing was opened for a rejected config.
    assert!(feed.channel_names().is_empty());
}

// --- Listener Failures ---

#[test]
fn test_panicking_listener_does_not_stop_sibling() {
    let feed = MemoryFeed::new();
    let coordinator = FanoutCoordinator::new(&feed, FanoutConfig::default()).unwrap();
    let failures: Arc<Mutex<Vec<ListenerFailure>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&failures);
    coordinator.set_error_hook(move |failure| sink.lock().push(failure.clone()));

    let _bad = coordinator.add_listener("inquiries", |_| panic!("render failed"));
    let (count, on_event) = counter();
    let _good = coordinator.add_listener("inquiries", on_event);
    let (dashboard, on_dashboard) = counter();
    let _dash = coordinator.add_listener(Topic::dashboard(), on_dashboard);

    feed.push_change(&table("inquiries"), &ChangeEvent::insert(row(json!({"id": 1}))));

    assert_eq!(count.load(Ordering::SeqCst), 1);
    // The dashboard topic still fires after a table-topic panic.
    assert_eq!(dashboard.load(Ordering::SeqCst), 1);

    let failures = failures.lock();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].topic, Topic::from("inquiries"));
    assert_eq!(failures[0].message, "render failed");
    assert_eq!(coordinator.listeners().failure_count(), 1);
}

#[test]
fn test_panicking_listener_keeps_its_registration() {
    let feed = MemoryFeed::new();
    let coordinator = FanoutCoordinator::new(&feed, FanoutConfig::default()).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&calls);
    let _flaky = coordinator.add_listener("messages", move |_| {
        if c.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("first call fails");
        }
    });

    let messages = table("messages");
    feed.push_change(&messages, &ChangeEvent::insert(row(json!({"id": 1}))));
    feed.push_change(&messages, &ChangeEvent::insert(row(json!({"id": 2}))));

    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

// --- Payload Errors ---

#[test]
fn test_malformed_payload_dropped() {
    let feed = MemoryFeed::new();
    let coordinator = FanoutCoordinator::new(&feed, FanoutConfig::default()).unwrap();
    let (count, on_event) = counter();
    let _listener = coordinator.add_listener(Topic::dashboard(), on_event);

    let profiles = table("profiles");
    feed.push(&profiles, &json!({"eventType": "INSERT"}));
    feed.push(&profiles, &json!({"eventType": "UPSERT", "new": {"id": 1}}));
    feed.push(&profiles, &json!("not an object"));
    assert_eq!(count.load(Ordering::SeqCst), 0);

    // Feed keeps working afterwards.
    feed.push(&profiles, &json!({"eventType": "INSERT", "new": {"id": 1}, "old": {}}));
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn test_decode_errors_are_typed() {
    let result = ChangeEvent::from_payload(&json!({"eventType": "UPDATE", "new": {}}));
    assert!(matches!(result, Err(FanoutError::Decode(_))));
}
