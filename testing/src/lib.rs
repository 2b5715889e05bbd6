//! # Event Puller Testing
//!
//! Test doubles and helpers for the event puller.
//!
//! This crate provides:
//! - [`InMemoryBroker`]: a [`BrokerClient`](event_puller_core::BrokerClient)
//!   with a process-local lease table, call recording and fault injection
//! - [`RecordingHandler`]: an event handler that records what it saw and can
//!   be told to fail, reject, panic or block
//! - helpers for building events and waiting on asynchronous conditions
//!
//! ## Example
//!
//! ```ignore
//! use event_puller_testing::{InMemoryBroker, RecordingHandler, json_event};
//!
//! #[tokio::test]
//! async fn acknowledges_handled_events() {
//!     let broker = InMemoryBroker::new();
//!     broker.publish("orders", "billing", json_event("1", OrderPlaced::EVENT_NAME, &order));
//!
//!     let handler = RecordingHandler::<OrderPlaced>::new();
//!     let pipeline = DispatchPipeline::builder()
//!         .handler::<OrderPlaced, _>(handler.clone())?
//!         .build();
//!     // ... run a puller, then:
//!     assert!(wait_until(Duration::from_secs(1), || broker.acknowledged_count() == 1).await);
//! }
//! ```

pub mod broker;
pub mod handler;

pub use broker::{BrokerCall, InMemoryBroker, Settlement};
pub use handler::{HandlerBehavior, RecordingHandler};

use event_puller_core::RawEvent;
use serde::Serialize;
use std::sync::Once;
use std::time::Duration;

/// Source attribute of events built by [`json_event`].
pub const TEST_SOURCE: &str = "/event-puller/tests";

/// Build a CloudEvents-schema event with `payload` serialized as JSON.
///
/// # Panics
///
/// Panics if `payload` cannot be serialized.
#[must_use]
#[allow(clippy::expect_used)]
pub fn json_event(id: impl Into<String>, event_type: &str, payload: &impl Serialize) -> RawEvent {
    let data = serde_json::to_vec(payload).expect("test payload serializes");
    RawEvent::new(id, TEST_SOURCE, event_type, data).with_content_type("application/json")
}

/// Install a test-friendly `tracing` subscriber once per process.
///
/// Honors `RUST_LOG`; defaults to `warn`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Poll `condition` every millisecond until it holds or `timeout` elapses.
///
/// Returns whether the condition held.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use event_puller_core::EventEnvelope;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Ping {
        seq: u32,
    }

    #[test]
    fn json_event_round_trips_through_envelope() {
        let event = json_event("ping-1", "test.ping.v1", &Ping { seq: 4 });
        assert_eq!(event.source, TEST_SOURCE);

        let envelope = EventEnvelope::new(event);
        assert_eq!(envelope.event_name(), "test.ping.v1");
        assert_eq!(envelope.deserialize::<Ping>().unwrap(), Ping { seq: 4 });
    }

    #[tokio::test]
    async fn wait_until_times_out() {
        init_tracing();
        assert!(wait_until(Duration::from_millis(5), || true).await);
        assert!(!wait_until(Duration::from_millis(5), || false).await);
    }
}
