//! Dispatch error taxonomy.
//!
//! Every failure that can happen between "event received" and "handler
//! returned" is a [`DispatchError`]. Its [`DispatchErrorKind`] decides the
//! settlement: permanent errors reject the event, transient errors release it
//! for a delayed retry.
//!
//! | Variant             | Kind      | Settlement |
//! |---------------------|-----------|------------|
//! | `UnknownEventType`  | permanent | reject     |
//! | `Deserialization`   | permanent | reject     |
//! | `NoHandler`         | permanent | reject     |
//! | `Rejected`          | permanent | reject     |
//! | `Handler`           | transient | release    |
//! | `HandlerPanicked`   | transient | release    |
//!
//! Handlers return `anyhow::Result<()>`. A handler that wants to poison an event
//! returns a permanent `DispatchError` (for example via
//! [`DispatchError::rejected`]); the pipeline recovers it from the `anyhow`
//! chain instead of wrapping it as a handler fault.

use crate::envelope::EnvelopeError;
use thiserror::Error;

/// Whether a failure may succeed on a later attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DispatchErrorKind {
    /// Retrying cannot help.
    Permanent,
    /// Retrying may help.
    Transient,
}

/// Errors produced while dispatching one event.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// The event name has no registry entry
    #[error("Event type '{0}' is not registered")]
    UnknownEventType(String),

    /// The payload could not be decoded into the registered type
    #[error(transparent)]
    Deserialization(#[from] EnvelopeError),

    /// A registry entry exists but no handler was registered for it
    #[error("No handler registered for event '{event_name}' ({type_name})")]
    NoHandler {
        /// Event name being dispatched
        event_name: String,
        /// Registered target type
        type_name: &'static str,
    },

    /// The handler asked for the event to be dropped
    #[error("Event '{event_name}' rejected by handler: {reason}")]
    Rejected {
        /// Event name being dispatched
        event_name: String,
        /// Reason given by the handler
        reason: String,
    },

    /// The handler returned an error
    #[error("Handler failed for event '{event_name}': {source}")]
    Handler {
        /// Event name being dispatched
        event_name: String,
        /// The handler's error
        #[source]
        source: anyhow::Error,
    },

    /// The handler panicked
    #[error("Handler panicked while processing event '{0}'")]
    HandlerPanicked(String),
}

impl DispatchError {
    /// Handler-requested rejection.
    #[must_use]
    pub fn rejected(event_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Rejected {
            event_name: event_name.into(),
            reason: reason.into(),
        }
    }

    /// Convert a handler's error, keeping a `DispatchError` it returned as-is.
    #[must_use]
    pub fn from_handler(event_name: &str, error: anyhow::Error) -> Self {
        match error.downcast::<Self>() {
            Ok(dispatch_error) => dispatch_error,
            Err(source) => Self::Handler {
                event_name: event_name.to_string(),
                source,
            },
        }
    }

    /// Permanent or transient.
    #[must_use]
    pub const fn kind(&self) -> DispatchErrorKind {
        match self {
            Self::UnknownEventType(_)
            | Self::Deserialization(_)
            | Self::NoHandler { .. }
            | Self::Rejected { .. } => DispatchErrorKind::Permanent,
            Self::Handler { .. } | Self::HandlerPanicked(_) => DispatchErrorKind::Transient,
        }
    }

    /// Returns true if retrying cannot help.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self.kind(), DispatchErrorKind::Permanent)
    }
}
