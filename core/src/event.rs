//! Wire-level event types.
//!
//! A [`RawEvent`] is one CloudEvents-shaped message as handed over by the broker
//! client. The broker client leases it to us under a [`LockToken`]; the pair, plus
//! the broker's delivery count, forms an [`EventBundle`]: one unit of pulled work.
//!
//! Application event types implement [`DomainEvent`], which binds a Rust type to
//! the wire event name used for routing.
//!
//! # Example
//!
//! ```
//! use event_puller_core::event::DomainEvent;
//! use serde::Deserialize;
//!
//! #[derive(Debug, Deserialize)]
//! struct OrderPlaced {
//!     order_id: String,
//! }
//!
//! impl DomainEvent for OrderPlaced {
//!     const EVENT_NAME: &'static str = "sales.order-placed.v1";
//! }
//!
//! assert_eq!(OrderPlaced::EVENT_NAME, "sales.order-placed.v1");
//! ```

use crate::envelope::EventEnvelope;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::collections::BTreeMap;
use std::fmt;

/// An application event type that can be pulled and dispatched.
///
/// `EVENT_NAME` is the stable wire identifier (the CloudEvents `type`
/// attribute). Use a versioned name so schemas can evolve:
///
/// - `"sales.order-placed.v1"`
/// - `"billing.invoice-paid.v2"`
pub trait DomainEvent: DeserializeOwned + Send + 'static {
    /// Wire event name this type is registered under.
    const EVENT_NAME: &'static str;
}

/// Schema the broker delivered the event in.
///
/// Both shapes are normalised into [`RawEvent`] by the broker client; the
/// schema is kept so handlers and behaviors can tell them apart.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventSchema {
    /// CloudEvents 1.0.
    #[default]
    CloudEvent,
    /// Legacy Event Grid schema.
    EventGrid,
}

impl fmt::Display for EventSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CloudEvent => f.write_str("cloudevent"),
            Self::EventGrid => f.write_str("eventgrid"),
        }
    }
}

/// One received wire event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    /// Producer-assigned event id.
    pub id: String,

    /// Event source URI reference.
    pub source: String,

    /// Event name (the CloudEvents `type` attribute).
    #[serde(rename = "type")]
    pub event_type: String,

    /// Optional subject.
    #[serde(default)]
    pub subject: Option<String>,

    /// Time the event was produced.
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,

    /// Media type of `data`. `None` means JSON.
    #[serde(default, rename = "datacontenttype")]
    pub data_content_type: Option<String>,

    /// Payload bytes.
    #[serde(default)]
    pub data: Vec<u8>,

    /// Extension attributes. Trace context (`traceparent`, `tracestate`)
    /// travels here as opaque strings.
    #[serde(default)]
    pub extensions: BTreeMap<String, String>,

    /// Schema the event arrived in.
    #[serde(default)]
    pub schema: EventSchema,
}

impl RawEvent {
    /// Create a CloudEvents-schema event with a JSON payload and no extensions.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        event_type: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            event_type: event_type.into(),
            subject: None,
            time: None,
            data_content_type: None,
            data,
            extensions: BTreeMap::new(),
            schema: EventSchema::CloudEvent,
        }
    }

    /// Set the payload media type.
    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.data_content_type = Some(content_type.into());
        self
    }

    /// Add one extension attribute.
    #[must_use]
    pub fn with_extension(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extensions.insert(key.into(), value.into());
        self
    }

    /// Set the schema the event arrived in.
    #[must_use]
    pub const fn with_schema(mut self, schema: EventSchema) -> Self {
        self.schema = schema;
        self
    }
}

impl fmt::Display for RawEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RawEvent {{ id: {}, type: {}, size: {} bytes }}",
            self.id,
            self.event_type,
            self.data.len()
        )
    }
}

/// Opaque broker-issued handle for one leased event instance.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LockToken(String);

impl LockToken {
    /// Wrap a broker token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The token as sent back to the broker.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for LockToken {
    fn from(token: String) -> Self {
        Self(token)
    }
}

impl From<&str> for LockToken {
    fn from(token: &str) -> Self {
        Self(token.to_string())
    }
}

/// One unit of pulled work.
///
/// Consumed exactly once by dispatch; its lock token survives into the outcome.
#[derive(Clone, Debug)]
pub struct EventBundle {
    /// The received event.
    pub envelope: EventEnvelope,

    /// Lease handle used to settle the event.
    pub lock_token: LockToken,

    /// Number of delivery attempts so far, 1 on first delivery.
    pub delivery_count: u32,
}

impl EventBundle {
    /// Bundle a raw event with its lease.
    #[must_use]
    pub fn new(event: RawEvent, lock_token: impl Into<LockToken>, delivery_count: u32) -> Self {
        Self {
            envelope: EventEnvelope::new(event),
            lock_token: lock_token.into(),
            delivery_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_event_builder_sets_attributes() {
        let event = RawEvent::new("evt-1", "/orders", "OrderPlaced.v1", b"{}".to_vec())
            .with_content_type("application/json")
            .with_extension("traceparent", "00-abc-def-01")
            .with_schema(EventSchema::EventGrid);

        assert_eq!(event.event_type, "OrderPlaced.v1");
        assert_eq!(event.data_content_type.as_deref(), Some("application/json"));
        assert_eq!(
            event.extensions.get("traceparent").map(String::as_str),
            Some("00-abc-def-01")
        );
        assert_eq!(event.schema, EventSchema::EventGrid);
    }

    #[test]
    fn raw_event_display() {
        let event = RawEvent::new("evt-1", "/orders", "OrderPlaced.v1", vec![1, 2, 3]);
        let display = format!("{event}");
        assert!(display.contains("OrderPlaced.v1"));
        assert!(display.contains("3 bytes"));
    }

    #[test]
    #[allow(clippy::expect_used)] // Panics: Test will fail if parsing fails
    fn raw_event_parses_cloudevents_attribute_names() {
        let json = r#"{
            "id": "evt-9",
            "source": "/billing",
            "type": "InvoicePaid.v1",
            "datacontenttype": "application/json",
            "extensions": { "traceparent": "00-1-2-01" }
        }"#;

        let event: RawEvent = serde_json::from_str(json).expect("valid event json");
        assert_eq!(event.event_type, "InvoicePaid.v1");
        assert_eq!(event.schema, EventSchema::CloudEvent);
        assert!(event.data.is_empty());
    }

    #[test]
    fn lock_token_conversions() {
        let token: LockToken = "lt-1".into();
        assert_eq!(token.as_str(), "lt-1");
        assert_eq!(token.to_string(), "lt-1");
        assert_eq!(LockToken::from("lt-1".to_string()), token);
    }

    #[test]
    fn bundle_wraps_event_in_envelope() {
        let bundle = EventBundle::new(
            RawEvent::new("evt-1", "/orders", "OrderPlaced.v1", Vec::new()),
            "lt-7",
            3,
        );
        assert_eq!(bundle.envelope.event_name(), "OrderPlaced.v1");
        assert_eq!(bundle.lock_token.as_str(), "lt-7");
        assert_eq!(bundle.delivery_count, 3);
    }
}
