//! Scaling tests for Eventide with synthetic 10k+ event stores.
//!
//! Measures key operations:
//! - Store population across many streams
//! - Restart/rebuild from log
//! - Stream reads
//! - Subscription catch-up after a pause
//! - Administrative rewrites

use eventide::{
    CallbackResult, EventEnvelope, EventStore, Filter, Position, StoreConfig, StreamVersion,
    SubscriptionConfig, SubscriptionManager,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const EVENT_COUNT: usize = 10_000;
const STREAM_COUNT: usize = 100;

fn test_config(dir: &TempDir) -> StoreConfig {
    StoreConfig {
        path: dir.path().join("store"),
        create_if_missing: true,
        // Batch fsyncs; durability per commit is not what is measured here.
        sync_interval: 1000,
    }
}

/// Timing helper
struct Timer {
    start: Instant,
    name: &'static str,
}

impl Timer {
    fn new(name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            name,
        }
    }

    fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    fn report(&self) {
        println!("  {} took {:.2}ms", self.name, self.elapsed_ms());
    }

    fn report_with_count(&self, count: usize) {
        let ms = self.elapsed_ms();
        let per_item = if count > 0 { ms / count as f64 } else { 0.0 };
        println!(
            "  {} took {:.2}ms ({} items, {:.4}ms/item, {:.0} items/sec)",
            self.name,
            ms,
            count,
            per_item,
            if ms > 0.0 { count as f64 / (ms / 1000.0) } else { 0.0 }
        );
    }
}

/// Append `EVENT_COUNT` events round-robin over `STREAM_COUNT` streams.
fn populate(store: &EventStore) {
    let event_types = ["OrderPlaced", "OrderPaid", "OrderShipped", "OrderClosed"];
    let mut versions: HashMap<String, StreamVersion> = HashMap::new();

    for i in 0..EVENT_COUNT {
        let stream_id = format!("order-{}", i % STREAM_COUNT);
        let version = versions.entry(stream_id.clone()).or_default();
        let event = EventEnvelope::json(
            format!("evt-{}", i),
            "urn:shop",
            event_types[i % event_types.len()],
            &serde_json::json!({ "index": i, "data": format!("Event data for item {}", i) }),
        )
        .unwrap();
        *version = store.append(&stream_id, *version, vec![event]).unwrap();
    }
}

// =============================================================================
// Test: 10k events over 100 streams
// =============================================================================

#[test]
fn test_scaling_populate_and_reopen() {
    println!("\n=== 10k Events, 100 Streams ===");

    let dir = TempDir::new().unwrap();

    let timer = Timer::new("Create store");
    let store = EventStore::create(test_config(&dir)).unwrap();
    timer.report();

    let timer = Timer::new("Append 10k events");
    populate(&store);
    timer.report_with_count(EVENT_COUNT);

    let timer = Timer::new("Sync to disk");
    store.sync().unwrap();
    timer.report();

    let stats = store.stats();
    println!(
        "  Store stats: {} streams, {} events, {} bytes",
        stats.stream_count, stats.event_count, stats.log_size_bytes
    );
    assert_eq!(stats.event_count, EVENT_COUNT as u64);

    drop(store);

    let timer = Timer::new("Reopen store (rebuild index)");
    let store = EventStore::open(test_config(&dir)).unwrap();
    timer.report();

    assert_eq!(store.position(), Position(EVENT_COUNT as u64));

    let timer = Timer::new("Read all streams");
    let mut total = 0;
    for s in 0..STREAM_COUNT {
        let stream = store.read(&format!("order-{}", s)).unwrap();
        assert_eq!(stream.version, StreamVersion((EVENT_COUNT / STREAM_COUNT) as u64));
        total += stream.events.len();
    }
    timer.report_with_count(total);
    assert_eq!(total, EVENT_COUNT);

    println!("  ✓ Populate and reopen test passed");
}

// =============================================================================
// Test: subscription catch-up after a pause
// =============================================================================

#[test]
fn test_scaling_subscription_catch_up() {
    println!("\n=== Subscription Catch-up over 10k Events ===");

    let dir = TempDir::new().unwrap();
    let store = Arc::new(EventStore::create(test_config(&dir)).unwrap());
    let manager = SubscriptionManager::new(store.clone());

    // Pin the start position, then pause before anything is written.
    manager
        .subscribe("catch-up", |_: &[EventEnvelope]| -> CallbackResult { Ok(()) })
        .unwrap();
    manager.pause_subscription("catch-up");

    let timer = Timer::new("Populate store");
    populate(&store);
    timer.report_with_count(EVENT_COUNT);

    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = delivered.clone();
    let config = SubscriptionConfig {
        filter: Filter::event_types(["OrderPaid"]),
        poll_interval: Duration::from_millis(10),
        batch_read_limit: 1024,
        ..Default::default()
    };

    let timer = Timer::new("Resume + catch-up (OrderPaid only)");
    manager
        .subscribe_with("catch-up", config, move |batch: &[EventEnvelope]| -> CallbackResult {
            counter.fetch_add(batch.len(), Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

    let expected = EVENT_COUNT / 4;
    let deadline = Instant::now() + Duration::from_secs(60);
    while delivered.load(Ordering::SeqCst) < expected {
        assert!(Instant::now() < deadline, "catch-up did not finish");
        std::thread::sleep(Duration::from_millis(5));
    }
    timer.report_with_count(expected);
    assert_eq!(delivered.load(Ordering::SeqCst), expected);

    println!("  ✓ Subscription catch-up test passed");
}

// =============================================================================
// Test: administrative rewrites on a populated log
// =============================================================================

#[test]
fn test_scaling_admin_rewrite() {
    println!("\n=== Admin Rewrites on 10k Events ===");

    let dir = TempDir::new().unwrap();
    let store = EventStore::create(test_config(&dir)).unwrap();
    populate(&store);

    let timer = Timer::new("Delete one stream");
    store.delete_event_stream("order-7").unwrap();
    timer.report();

    let timer = Timer::new("Delete one event");
    assert!(store.delete_event("evt-42", "urn:shop").unwrap());
    timer.report();

    let timer = Timer::new("Update one event");
    let updated = store
        .update_event("evt-43", "urn:shop", |current| {
            Some(current.clone().with_data("application/json", b"{}".to_vec()))
        })
        .unwrap();
    timer.report();
    assert!(updated.is_some());

    let stats = store.stats();
    assert_eq!(stats.stream_count, (STREAM_COUNT - 1) as u64);
    assert_eq!(
        stats.event_count,
        (EVENT_COUNT - EVENT_COUNT / STREAM_COUNT - 1) as u64
    );
    assert_eq!(store.position(), Position(EVENT_COUNT as u64));

    println!("  ✓ Admin rewrite test passed");
}
