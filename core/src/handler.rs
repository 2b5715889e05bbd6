//! Event handlers.
//!
//! Applications implement [`EventHandler<E>`] once per event type. Handlers are
//! stored type-erased in a [`HandlerSet`] under the [`HandlerKey`] of their
//! event type; the erased adapter owns deserialization, so dispatch never needs
//! to know the concrete type.
//!
//! # Example
//!
//! ```
//! use event_puller_core::handler::{EventHandler, HandlerFuture};
//! use tokio_util::sync::CancellationToken;
//! # use serde::Deserialize;
//! # #[derive(Deserialize)]
//! # struct OrderPlaced { order_id: String }
//!
//! struct SendConfirmation;
//!
//! impl EventHandler<OrderPlaced> for SendConfirmation {
//!     fn handle<'a>(&'a self, event: OrderPlaced, _cancel: &'a CancellationToken) -> HandlerFuture<'a> {
//!         Box::pin(async move {
//!             tracing::info!(order_id = %event.order_id, "Sending confirmation");
//!             Ok(())
//!         })
//!     }
//! }
//! ```

use crate::envelope::EventEnvelope;
use crate::error::DispatchError;
use crate::pipeline::DispatchFuture;
use crate::registry::HandlerKey;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Boxed future returned by [`EventHandler::handle`].
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>>;

/// Handles one event type.
///
/// Any error is treated as transient (the event is released for a delayed
/// retry) unless it is a permanent [`DispatchError`], for example
/// [`DispatchError::rejected`].
///
/// Handlers must be idempotent: delivery is at-least-once.
pub trait EventHandler<E>: Send + Sync + 'static {
    /// Process one event.
    fn handle<'a>(&'a self, event: E, cancel: &'a CancellationToken) -> HandlerFuture<'a>;
}

/// Adapter turning an async closure into an [`EventHandler`].
///
/// ```
/// use event_puller_core::handler::handler_fn;
/// # #[derive(serde::Deserialize)]
/// # struct Ping;
///
/// let handler = handler_fn(|_event: Ping, _cancel| async move { Ok::<(), anyhow::Error>(()) });
/// ```
pub struct FnHandler<F, E> {
    f: F,
    _event: PhantomData<fn(E)>,
}

/// Build an [`EventHandler`] from an async closure.
pub const fn handler_fn<F, E, Fut>(f: F) -> FnHandler<F, E>
where
    F: Fn(E, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    FnHandler {
        f,
        _event: PhantomData,
    }
}

impl<F, E, Fut> EventHandler<E> for FnHandler<F, E>
where
    F: Fn(E, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    E: 'static,
{
    fn handle<'a>(&'a self, event: E, cancel: &'a CancellationToken) -> HandlerFuture<'a> {
        Box::pin((self.f)(event, cancel.clone()))
    }
}

/// Type-erased handler: decodes the envelope and invokes the typed handler.
pub(crate) trait ErasedHandler: Send + Sync {
    fn invoke<'a>(
        &'a self,
        envelope: &'a EventEnvelope,
        cancel: &'a CancellationToken,
    ) -> DispatchFuture<'a>;
}

struct TypedHandler<E, H> {
    handler: H,
    _event: PhantomData<fn() -> E>,
}

impl<E, H> ErasedHandler for TypedHandler<E, H>
where
    E: DeserializeOwned + Send + 'static,
    H: EventHandler<E>,
{
    fn invoke<'a>(
        &'a self,
        envelope: &'a EventEnvelope,
        cancel: &'a CancellationToken,
    ) -> DispatchFuture<'a> {
        Box::pin(async move {
            let event: E = envelope.deserialize()?;
            self.handler
                .handle(event, cancel)
                .await
                .map_err(|e| DispatchError::from_handler(envelope.event_name(), e))
        })
    }
}

/// Handlers keyed by [`HandlerKey`].
#[derive(Clone, Default)]
pub struct HandlerSet {
    handlers: HashMap<HandlerKey, Arc<dyn ErasedHandler>>,
}

impl HandlerSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the handler for event type `E`, replacing any previous one.
    ///
    /// Returns the key the handler is stored under.
    pub fn insert<E, H>(&mut self, handler: H) -> HandlerKey
    where
        E: DeserializeOwned + Send + 'static,
        H: EventHandler<E>,
    {
        let key = HandlerKey::of::<E>();
        let erased: Arc<dyn ErasedHandler> = Arc::new(TypedHandler {
            handler,
            _event: PhantomData,
        });
        if self.handlers.insert(key, erased).is_some() {
            tracing::warn!(
                event_type = std::any::type_name::<E>(),
                "Replaced previously registered handler"
            );
        }
        key
    }

    /// Returns true if a handler is stored under `key`.
    #[must_use]
    pub fn contains(&self, key: HandlerKey) -> bool {
        self.handlers.contains_key(&key)
    }

    /// Number of handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns true if no handler is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub(crate) fn resolve(&self, key: HandlerKey) -> Option<&dyn ErasedHandler> {
        self.handlers.get(&key).map(AsRef::as_ref)
    }
}

impl std::fmt::Debug for HandlerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerSet")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}
