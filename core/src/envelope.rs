//! Typed view over a received event.
//!
//! [`EventEnvelope`] exposes what dispatch needs without touching the payload:
//! the event name used for routing, the schema it arrived in, and the key/value
//! metadata carried in extension attributes (trace context lives there). The
//! payload is only decoded when [`EventEnvelope::deserialize`] is called with
//! the registered target type.
//!
//! # Payload formats
//!
//! | `datacontenttype`                              | Decoder      |
//! |------------------------------------------------|--------------|
//! | absent, `application/json`, `text/json`, `*+json` | `serde_json` |
//! | `application/x-bincode`, `application/bincode`  | `bincode`    |
//!
//! Media type parameters (`; charset=utf-8`) are ignored.

use crate::event::{EventSchema, RawEvent};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Metadata key of the W3C trace parent header.
pub const TRACEPARENT: &str = "traceparent";

/// Metadata key of the W3C trace state header.
pub const TRACESTATE: &str = "tracestate";

/// Errors raised while decoding an envelope's payload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// The payload media type has no decoder.
    #[error("Unsupported content type '{content_type}' for event '{event_name}'")]
    UnsupportedContentType {
        /// Event name of the envelope
        event_name: String,
        /// The declared media type
        content_type: String,
    },

    /// The payload did not decode into the requested type.
    #[error("Failed to decode event '{event_name}' as {target}: {reason}")]
    InvalidData {
        /// Event name of the envelope
        event_name: String,
        /// Rust type that was requested
        target: &'static str,
        /// Decoder error message
        reason: String,
    },
}

/// Payload decoder selected from the media type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PayloadFormat {
    Json,
    Bincode,
}

impl PayloadFormat {
    fn from_content_type(content_type: Option<&str>) -> Option<Self> {
        let Some(content_type) = content_type else {
            return Some(Self::Json);
        };

        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        match essence.as_str() {
            "" | "application/json" | "text/json" => Some(Self::Json),
            "application/x-bincode" | "application/bincode" => Some(Self::Bincode),
            other if other.ends_with("+json") => Some(Self::Json),
            _ => None,
        }
    }
}

/// One received wire event, adapted for dispatch.
///
/// Cheap to clone: the raw event is shared.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventEnvelope {
    event: Arc<RawEvent>,
}

impl EventEnvelope {
    /// Adapt a raw event.
    #[must_use]
    pub fn new(event: RawEvent) -> Self {
        Self {
            event: Arc::new(event),
        }
    }

    /// Wire event name used for registry lookup.
    #[must_use]
    pub fn event_name(&self) -> &str {
        &self.event.event_type
    }

    /// Producer-assigned event id.
    #[must_use]
    pub fn event_id(&self) -> &str {
        &self.event.id
    }

    /// Schema the event arrived in.
    #[must_use]
    pub fn schema(&self) -> EventSchema {
        self.event.schema
    }

    /// Key/value metadata (extension attributes).
    #[must_use]
    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.event.extensions
    }

    /// One metadata value.
    #[must_use]
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.event.extensions.get(key).map(String::as_str)
    }

    /// The `traceparent` value, if the producer propagated one.
    #[must_use]
    pub fn traceparent(&self) -> Option<&str> {
        self.metadata_value(TRACEPARENT)
    }

    /// The underlying raw event.
    #[must_use]
    pub fn raw(&self) -> &RawEvent {
        &self.event
    }

    /// Decode the payload into `T`.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::UnsupportedContentType`] if the media type has no
    /// decoder, or [`EnvelopeError::InvalidData`] if decoding fails.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        let content_type = self.event.data_content_type.as_deref();
        let format = PayloadFormat::from_content_type(content_type).ok_or_else(|| {
            EnvelopeError::UnsupportedContentType {
                event_name: self.event.event_type.clone(),
                content_type: content_type.unwrap_or_default().to_string(),
            }
        })?;

        let invalid = |reason: String| EnvelopeError::InvalidData {
            event_name: self.event.event_type.clone(),
            target: std::any::type_name::<T>(),
            reason,
        };

        match format {
            PayloadFormat::Json => {
                serde_json::from_slice(&self.event.data).map_err(|e| invalid(e.to_string()))
            },
            PayloadFormat::Bincode => {
                bincode::deserialize(&self.event.data).map_err(|e| invalid(e.to_string()))
            },
        }
    }
}

impl From<RawEvent> for EventEnvelope {
    fn from(event: RawEvent) -> Self {
        Self::new(event)
    }
}
