//! # Event Puller Core
//!
//! Core traits and types for pull-based consumption of broker-delivered events.
//!
//! This crate holds everything that does not depend on a scheduler:
//!
//! - **Events**: the raw CloudEvents-shaped wire event, lock tokens and event bundles
//! - **Envelope**: a typed view over a raw event with on-demand deserialization
//! - **Broker**: the contract a pull broker client must fulfil
//! - **Registry**: event-name → target type + handler key bindings
//! - **Handlers**: the typed [`EventHandler`](handler::EventHandler) trait and its type-erased set
//! - **Pipeline**: ordered behaviors around the terminal handler invocation
//! - **Outcome**: acknowledge / release / reject classification
//!
//! The concurrency engine (bounded dispatch, drain loops, the service that runs
//! one puller per subscription) lives in `event-puller-runtime`.
//!
//! ## Example
//!
//! ```ignore
//! use event_puller_core::{DispatchPipeline, DomainEvent, EventHandler};
//!
//! let pipeline = DispatchPipeline::builder()
//!     .handler::<OrderPlaced, _>(OrderPlacedHandler::new(repo))?
//!     .behavior(TracingBehavior)
//!     .build();
//!
//! pipeline.dispatch(&envelope, &cancel).await?;
//! ```

pub mod broker;
pub mod envelope;
pub mod error;
pub mod event;
pub mod handler;
pub mod outcome;
pub mod pipeline;
pub mod registry;

// Re-export commonly used types
pub use broker::{BrokerClient, BrokerError, BrokerFuture};
pub use envelope::{EnvelopeError, EventEnvelope};
pub use error::{DispatchError, DispatchErrorKind};
pub use event::{DomainEvent, EventBundle, EventSchema, LockToken, RawEvent};
pub use handler::{EventHandler, FnHandler, HandlerFuture, HandlerSet, handler_fn};
pub use outcome::{Outcome, OutcomeKind, ReleaseDelay};
pub use pipeline::{
    Behavior, DispatchFuture, DispatchPipeline, DispatchPipelineBuilder, Next, TracingBehavior,
};
pub use registry::{EventRegistry, HandlerKey, RegistryEntry, RegistryError, TargetType};
pub use tokio_util::sync::CancellationToken;
