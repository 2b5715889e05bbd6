//! Dispatch pipeline.
//!
//! A [`DispatchPipeline`] is an ordered list of [`Behavior`]s wrapped around a
//! terminal step that resolves and invokes the registered handler:
//!
//! ```text
//! dispatch(envelope)
//!     │
//!     ▼
//! ┌────────────┐   next.run()   ┌────────────┐   next.run()   ┌──────────────────────┐
//! │ behavior 0 │ ─────────────► │ behavior 1 │ ─────────────► │ terminal             │
//! │            │ ◄───────────── │            │ ◄───────────── │ registry → handler   │
//! └────────────┘     result     └────────────┘     result     └──────────────────────┘
//! ```
//!
//! Behaviors may act before and after calling the rest of the chain, or return
//! without calling it at all. The chain is a plain value assembled once at
//! startup.
//!
//! # Terminal step
//!
//! 1. Look up the registry entry for the event name, else
//!    [`DispatchError::UnknownEventType`]
//! 2. Resolve the handler by its key, else [`DispatchError::NoHandler`]
//! 3. Decode the payload into the registered type, else
//!    [`DispatchError::Deserialization`]
//! 4. Invoke the handler; its error becomes [`DispatchError::Handler`] unless it
//!    already is a `DispatchError`

use crate::envelope::EventEnvelope;
use crate::error::DispatchError;
use crate::event::DomainEvent;
use crate::handler::{EventHandler, HandlerSet};
use crate::registry::{EventRegistry, RegistryError};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Boxed future produced by every pipeline stage.
pub type DispatchFuture<'a> = Pin<Box<dyn Future<Output = Result<(), DispatchError>> + Send + 'a>>;

/// Cross-cutting step around handler invocation.
///
/// # Example
///
/// ```
/// use event_puller_core::envelope::EventEnvelope;
/// use event_puller_core::pipeline::{Behavior, DispatchFuture, Next};
/// use tokio_util::sync::CancellationToken;
///
/// struct SkipHeartbeats;
///
/// impl Behavior for SkipHeartbeats {
///     fn handle<'a>(
///         &'a self,
///         envelope: &'a EventEnvelope,
///         next: Next<'a>,
///         cancel: &'a CancellationToken,
///     ) -> DispatchFuture<'a> {
///         if envelope.event_name() == "Heartbeat" {
///             return Box::pin(async { Ok(()) });
///         }
///         next.run(envelope, cancel)
///     }
/// }
/// ```
pub trait Behavior: Send + Sync + 'static {
    /// Run this step; call `next.run(..)` to continue down the chain.
    fn handle<'a>(
        &'a self,
        envelope: &'a EventEnvelope,
        next: Next<'a>,
        cancel: &'a CancellationToken,
    ) -> DispatchFuture<'a>;
}

/// The remainder of the chain after the current behavior.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    behaviors: &'a [Arc<dyn Behavior>],
    terminal: &'a Terminal,
}

impl<'a> Next<'a> {
    /// Continue with the next behavior, or the terminal step if none is left.
    #[must_use]
    pub fn run(self, envelope: &'a EventEnvelope, cancel: &'a CancellationToken) -> DispatchFuture<'a> {
        match self.behaviors.split_first() {
            Some((behavior, rest)) => behavior.handle(
                envelope,
                Next {
                    behaviors: rest,
                    terminal: self.terminal,
                },
                cancel,
            ),
            None => self.terminal.invoke(envelope, cancel),
        }
    }
}

/// Registry lookup + handler invocation.
struct Terminal {
    registry: EventRegistry,
    handlers: HandlerSet,
}

impl Terminal {
    fn invoke<'a>(&'a self, envelope: &'a EventEnvelope, cancel: &'a CancellationToken) -> DispatchFuture<'a> {
        Box::pin(async move {
            let entry = self
                .registry
                .lookup(envelope.event_name())
                .ok_or_else(|| DispatchError::UnknownEventType(envelope.event_name().to_string()))?;

            let handler = self
                .handlers
                .resolve(entry.handler_key)
                .ok_or_else(|| DispatchError::NoHandler {
                    event_name: entry.event_name.clone(),
                    type_name: entry.target.name(),
                })?;

            handler.invoke(envelope, cancel).await
        })
    }
}

struct PipelineInner {
    behaviors: Vec<Arc<dyn Behavior>>,
    terminal: Terminal,
}

/// Behaviors + terminal handler invocation, shared by all dispatch tasks.
///
/// Cloning is cheap.
#[derive(Clone)]
pub struct DispatchPipeline {
    inner: Arc<PipelineInner>,
}

impl DispatchPipeline {
    /// Assemble a pipeline from its parts.
    #[must_use]
    pub fn new(
        registry: EventRegistry,
        handlers: HandlerSet,
        behaviors: Vec<Arc<dyn Behavior>>,
    ) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                behaviors,
                terminal: Terminal { registry, handlers },
            }),
        }
    }

    /// Create a builder that registers events and handlers together.
    #[must_use]
    pub fn builder() -> DispatchPipelineBuilder {
        DispatchPipelineBuilder::default()
    }

    /// Dispatch one envelope through the chain.
    ///
    /// # Errors
    ///
    /// Returns the [`DispatchError`] produced by the chain; its kind decides
    /// whether the event is rejected or released.
    pub fn dispatch<'a>(
        &'a self,
        envelope: &'a EventEnvelope,
        cancel: &'a CancellationToken,
    ) -> DispatchFuture<'a> {
        Next {
            behaviors: &self.inner.behaviors,
            terminal: &self.inner.terminal,
        }
        .run(envelope, cancel)
    }

    /// The registry consulted by the terminal step.
    #[must_use]
    pub fn registry(&self) -> &EventRegistry {
        &self.inner.terminal.registry
    }

    /// Number of behaviors in the chain.
    #[must_use]
    pub fn behavior_count(&self) -> usize {
        self.inner.behaviors.len()
    }
}

impl std::fmt::Debug for DispatchPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchPipeline")
            .field("behaviors", &self.inner.behaviors.len())
            .field("events", &self.inner.terminal.registry.len())
            .field("handlers", &self.inner.terminal.handlers.len())
            .finish()
    }
}

/// Builder for [`DispatchPipeline`].
///
/// # Example
///
/// ```ignore
/// let pipeline = DispatchPipeline::builder()
///     .handler::<OrderPlaced, _>(OrderPlacedHandler)?
///     .handler::<OrderShipped, _>(OrderShippedHandler)?
///     .behavior(TracingBehavior)
///     .build();
/// ```
#[derive(Default)]
pub struct DispatchPipelineBuilder {
    registry: EventRegistry,
    handlers: HandlerSet,
    behaviors: Vec<Arc<dyn Behavior>>,
}

impl DispatchPipelineBuilder {
    /// Register `E` under its event name and store its handler.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Conflict`] if the event name is bound to another type.
    pub fn handler<E, H>(mut self, handler: H) -> Result<Self, RegistryError>
    where
        E: DomainEvent,
        H: EventHandler<E>,
    {
        self.registry.register::<E>()?;
        self.handlers.insert::<E, H>(handler);
        Ok(self)
    }

    /// Register `E` without a handler.
    ///
    /// Events of this type are rejected with [`DispatchError::NoHandler`] until
    /// a handler is added.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Conflict`] if the event name is bound to another type.
    pub fn event<E: DomainEvent>(mut self) -> Result<Self, RegistryError> {
        self.registry.register::<E>()?;
        Ok(self)
    }

    /// Route an additional event name to `E`'s handler.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Conflict`] if the name is bound to another type.
    pub fn alias<E: DomainEvent>(mut self, event_name: impl Into<String>) -> Result<Self, RegistryError> {
        self.registry.register_as::<E>(event_name)?;
        Ok(self)
    }

    /// Append a behavior; behaviors run in the order they are added.
    #[must_use]
    pub fn behavior(mut self, behavior: impl Behavior) -> Self {
        self.behaviors.push(Arc::new(behavior));
        self
    }

    /// Build the pipeline.
    #[must_use]
    pub fn build(self) -> DispatchPipeline {
        tracing::info!(
            events = self.registry.len(),
            handlers = self.handlers.len(),
            behaviors = self.behaviors.len(),
            "Dispatch pipeline built"
        );
        DispatchPipeline::new(self.registry, self.handlers, self.behaviors)
    }
}

/// Opens a span per dispatch and logs the result.
///
/// The span carries the event name, id, schema and the propagated
/// `traceparent`, so handler logs correlate with the producer's trace.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingBehavior;

impl Behavior for TracingBehavior {
    fn handle<'a>(
        &'a self,
        envelope: &'a EventEnvelope,
        next: Next<'a>,
        cancel: &'a CancellationToken,
    ) -> DispatchFuture<'a> {
        let span = tracing::info_span!(
            "dispatch",
            event_name = %envelope.event_name(),
            event_id = %envelope.event_id(),
            schema = %envelope.schema(),
            traceparent = envelope.traceparent().unwrap_or_default(),
        );

        Box::pin(
            async move {
                let started = Instant::now();
                let result = next.run(envelope, cancel).await;
                let elapsed_ms = started.elapsed().as_millis();

                match &result {
                    Ok(()) => tracing::debug!(elapsed_ms, "Event handled"),
                    Err(e) if e.is_permanent() => {
                        tracing::warn!(elapsed_ms, error = %e, "Event cannot be handled");
                    },
                    Err(e) => tracing::warn!(elapsed_ms, error = %e, "Event handling failed"),
                }

                result
            }
            .instrument(span),
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::event::RawEvent;
    use crate::handler::handler_fn;
    use serde::Deserialize;
    use std::sync::Mutex;

    #[derive(Debug, Deserialize)]
    struct OrderPlaced {
        order_id: String,
    }

    impl DomainEvent for OrderPlaced {
        const EVENT_NAME: &'static str = "OrderPlaced.v1";
    }

    #[derive(Debug, Deserialize)]
    struct OrderShipped;

    impl DomainEvent for OrderShipped {
        const EVENT_NAME: &'static str = "OrderShipped.v1";
    }

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recording {
        name: &'static str,
        log: Log,
    }

    impl Behavior for Recording {
        fn handle<'a>(
            &'a self,
            envelope: &'a EventEnvelope,
            next: Next<'a>,
            cancel: &'a CancellationToken,
        ) -> DispatchFuture<'a> {
            Box::pin(async move {
                self.log.lock().unwrap().push(format!("{}:before", self.name));
                let result = next.run(envelope, cancel).await;
                self.log.lock().unwrap().push(format!("{}:after", self.name));
                result
            })
        }
    }

    struct ShortCircuit;

    impl Behavior for ShortCircuit {
        fn handle<'a>(
            &'a self,
            _envelope: &'a EventEnvelope,
            _next: Next<'a>,
            _cancel: &'a CancellationToken,
        ) -> DispatchFuture<'a> {
            Box::pin(async { Ok(()) })
        }
    }

    fn envelope(event_type: &str, data: &str) -> EventEnvelope {
        EventEnvelope::new(RawEvent::new("evt-1", "/orders", event_type, data.as_bytes().to_vec()))
    }

    fn logging_handler(log: &Log) -> impl EventHandler<OrderPlaced> {
        let log = Arc::clone(log);
        handler_fn(move |event: OrderPlaced, _cancel| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(format!("handler:{}", event.order_id));
                Ok::<(), anyhow::Error>(())
            }
        })
    }

    #[tokio::test]
    async fn behaviors_wrap_handler_in_order() {
        let log: Log = Arc::default();
        let pipeline = DispatchPipeline::builder()
            .handler::<OrderPlaced, _>(logging_handler(&log))
            .unwrap()
            .behavior(Recording { name: "outer", log: Arc::clone(&log) })
            .behavior(Recording { name: "inner", log: Arc::clone(&log) })
            .build();

        let cancel = CancellationToken::new();
        pipeline
            .dispatch(&envelope("OrderPlaced.v1", r#"{"order_id":"o-1"}"#), &cancel)
            .await
            .unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["outer:before", "inner:before", "handler:o-1", "inner:after", "outer:after"]
        );
    }

    #[tokio::test]
    async fn behavior_can_short_circuit() {
        let log: Log = Arc::default();
        let pipeline = DispatchPipeline::builder()
            .handler::<OrderPlaced, _>(logging_handler(&log))
            .unwrap()
            .behavior(ShortCircuit)
            .build();

        let cancel = CancellationToken::new();
        pipeline
            .dispatch(&envelope("OrderPlaced.v1", r#"{"order_id":"o-1"}"#), &cancel)
            .await
            .unwrap();

        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_event_type_is_permanent() {
        let pipeline = DispatchPipeline::builder().behavior(TracingBehavior).build();
        let cancel = CancellationToken::new();

        let err = pipeline
            .dispatch(&envelope("Mystery.v1", "{}"), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::UnknownEventType(ref name) if name == "Mystery.v1"));
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn registered_event_without_handler_is_permanent() {
        let pipeline = DispatchPipeline::builder().event::<OrderShipped>().unwrap().build();
        let cancel = CancellationToken::new();

        let err = pipeline
            .dispatch(&envelope("OrderShipped.v1", "null"), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::NoHandler { .. }));
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn alias_routes_to_same_handler() {
        let log: Log = Arc::default();
        let pipeline = DispatchPipeline::builder()
            .handler::<OrderPlaced, _>(logging_handler(&log))
            .unwrap()
            .alias::<OrderPlaced>("legacy.order-placed")
            .unwrap()
            .build();

        let cancel = CancellationToken::new();
        pipeline
            .dispatch(&envelope("legacy.order-placed", r#"{"order_id":"o-9"}"#), &cancel)
            .await
            .unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["handler:o-9"]);
    }

    #[tokio::test]
    async fn handler_failures_keep_their_classification() {
        let pipeline = DispatchPipeline::builder()
            .handler::<OrderPlaced, _>(handler_fn(|event: OrderPlaced, _cancel| async move {
                let result: anyhow::Result<()> = if event.order_id == "poison" {
                    Err(DispatchError::UnknownEventType("Nested.v1".to_string()).into())
                } else {
                    Err(anyhow::anyhow!("connection reset"))
                };
                result
            }))
            .unwrap()
            .behavior(TracingBehavior)
            .build();
        let cancel = CancellationToken::new();

        let poison = pipeline
            .dispatch(&envelope("OrderPlaced.v1", r#"{"order_id":"poison"}"#), &cancel)
            .await
            .unwrap_err();
        assert!(poison.is_permanent());

        let flaky = pipeline
            .dispatch(&envelope("OrderPlaced.v1", r#"{"order_id":"o-1"}"#), &cancel)
            .await
            .unwrap_err();
        assert!(!flaky.is_permanent());
    }

    #[test]
    fn builder_rejects_conflicting_alias() {
        let result = DispatchPipeline::builder()
            .event::<OrderPlaced>()
            .unwrap()
            .alias::<OrderShipped>("OrderPlaced.v1");
        assert!(result.is_err());
    }
}
