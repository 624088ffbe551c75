//! Connection-level metrics, registered against the process-wide default
//! Prometheus registry the same way the rest of the ecosystem does it:
//! construct once via `lazy_static`-style `once_cell::sync::Lazy`, update
//! from call sites, let an external exporter scrape the registry.

use once_cell::sync::Lazy;
use prometheus::{register_histogram, register_int_counter, register_int_counter_vec, Histogram, IntCounter, IntCounterVec};

pub struct ConnectionMetrics {
    pub frames_sent: IntCounter,
    pub frames_received: IntCounter,
    pub bytes_sent: IntCounter,
    pub bytes_received: IntCounter,
    pub messages_received_by_kind: IntCounterVec,
    pub reducer_round_trip: Histogram,
    pub active_subscriptions: IntCounter,
}

impl ConnectionMetrics {
    fn new() -> Self {
        ConnectionMetrics {
            frames_sent: register_int_counter!("spacetimedb_sdk_frames_sent_total", "WebSocket frames sent")
                .expect("metric registration is infallible outside of name collisions"),
            frames_received: register_int_counter!("spacetimedb_sdk_frames_received_total", "WebSocket frames received")
                .expect("metric registration is infallible outside of name collisions"),
            bytes_sent: register_int_counter!("spacetimedb_sdk_bytes_sent_total", "Bytes sent on the wire")
                .expect("metric registration is infallible outside of name collisions"),
            bytes_received: register_int_counter!("spacetimedb_sdk_bytes_received_total", "Bytes received on the wire")
                .expect("metric registration is infallible outside of name collisions"),
            messages_received_by_kind: register_int_counter_vec!(
                "spacetimedb_sdk_messages_received_total",
                "Server messages received, by kind",
                &["kind"]
            )
            .expect("metric registration is infallible outside of name collisions"),
            reducer_round_trip: register_histogram!(
                "spacetimedb_sdk_reducer_round_trip_seconds",
                "Time from a reducer call being sent to its result arriving"
            )
            .expect("metric registration is infallible outside of name collisions"),
            active_subscriptions: register_int_counter!(
                "spacetimedb_sdk_subscriptions_total",
                "Subscriptions that have reached the Active state"
            )
            .expect("metric registration is infallible outside of name collisions"),
        }
    }

    pub fn record_message_kind(&self, kind: &str) {
        self.messages_received_by_kind.with_label_values(&[kind]).inc();
    }
}

pub static METRICS: Lazy<ConnectionMetrics> = Lazy::new(ConnectionMetrics::new);

/// Monotonically-increasing `request_id` allocator, one per connection.
/// Every outbound `ClientMessage` carries an id from here so its eventual
/// reply can be matched back to the call that produced it.
#[derive(Default)]
pub struct RequestIdAllocator(std::sync::atomic::AtomicU32);

impl RequestIdAllocator {
    pub fn new() -> Self {
        RequestIdAllocator::default()
    }

    pub fn next(&self) -> u32 {
        self.0.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }
}

/// Monotonically-increasing `query_id` allocator, distinct from the
/// `request_id` counter above: a subscription keeps its `query_id` for its
/// whole lifetime, across however many `request_id`s it takes to set up and
/// tear down.
#[derive(Default)]
pub struct QueryIdAllocator(std::sync::atomic::AtomicU64);

impl QueryIdAllocator {
    pub fn new() -> Self {
        QueryIdAllocator::default()
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_initialize_and_increment() {
        METRICS.frames_sent.inc();
        METRICS.record_message_kind("TransactionUpdate");
        assert!(METRICS.frames_sent.get() >= 1);
    }

    #[test]
    fn request_and_query_id_allocators_are_independent_and_monotonic() {
        let request_ids = RequestIdAllocator::new();
        let query_ids = QueryIdAllocator::new();
        assert_eq!(request_ids.next(), 0);
        assert_eq!(request_ids.next(), 1);
        assert_eq!(query_ids.next(), 0);
        assert_eq!(request_ids.next(), 2);
        assert_eq!(query_ids.next(), 1);
    }
}
