//! Broker client contract for pull delivery.
//!
//! This module provides the [`BrokerClient`] trait the subscription puller
//! drives. A pull broker leases events to the client under a lock token; the
//! client must later settle each lease exactly once:
//!
//! ```text
//!            receive_batch
//! ┌────────┐ ────────────► ┌──────────────┐
//! │ Broker │               │    Puller    │
//! │        │ ◄──────────── │              │
//! └────────┘  acknowledge  └──────────────┘
//!             release(delay)
//!             reject
//! ```
//!
//! # Key Principles
//!
//! - **At-least-once delivery**: a lease that is never settled expires and the
//!   event is delivered again
//! - **Batched settlement**: every settle call takes a slice of lock tokens
//! - **Cancellation-aware**: every call takes the caller's [`CancellationToken`]
//!
//! # Implementations
//!
//! - `InMemoryBroker` in `event-puller-testing` - for tests and demos
//! - Network clients live outside this workspace
//!
//! # Example
//!
//! ```rust,ignore
//! use event_puller_core::broker::BrokerClient;
//!
//! async fn example(broker: impl BrokerClient, cancel: CancellationToken) -> Result<(), BrokerError> {
//!     let bundles = broker.receive_batch("orders", "billing", 10, &cancel).await?;
//!     let tokens: Vec<_> = bundles.iter().map(|b| b.lock_token.clone()).collect();
//!     broker.acknowledge("orders", "billing", &tokens, &cancel).await
//! }
//! ```

use crate::event::{EventBundle, LockToken};
use crate::outcome::ReleaseDelay;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Errors that can occur during broker operations.
///
/// All of them are transport-level: they never change an event's outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Network or protocol failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// The broker did not answer in time
    #[error("Broker call timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The call was abandoned because the cancellation token fired
    #[error("Broker call cancelled")]
    Cancelled,

    /// Topic or subscription does not exist or is not accessible
    #[error("Invalid subscription '{subscription}' on topic '{topic}'")]
    InvalidSubscription {
        /// The topic name
        topic: String,
        /// The subscription name
        subscription: String,
    },

    /// Generic error for other failures
    #[error("Broker error: {0}")]
    Other(String),
}

/// Boxed future returned by [`BrokerClient`] methods.
pub type BrokerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BrokerError>> + Send + 'a>>;

/// Trait for pull broker clients.
///
/// # Dyn Compatibility
///
/// Methods return [`BrokerFuture`] instead of using `async fn` so the puller can
/// hold an `Arc<dyn BrokerClient>` shared across all subscriptions.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`: receive and the three settle loops
/// call into the client concurrently.
pub trait BrokerClient: Send + Sync {
    /// Lease up to `max_count` events from a subscription.
    ///
    /// May return fewer events than requested, including none.
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerError`] if the call fails.
    fn receive_batch<'a>(
        &'a self,
        topic: &'a str,
        subscription: &'a str,
        max_count: usize,
        cancel: &'a CancellationToken,
    ) -> BrokerFuture<'a, Vec<EventBundle>>;

    /// Settle leases as successfully processed.
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerError`] if the call fails.
    fn acknowledge<'a>(
        &'a self,
        topic: &'a str,
        subscription: &'a str,
        lock_tokens: &'a [LockToken],
        cancel: &'a CancellationToken,
    ) -> BrokerFuture<'a, ()>;

    /// Return leases to the subscription for redelivery after `delay`.
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerError`] if the call fails.
    fn release<'a>(
        &'a self,
        topic: &'a str,
        subscription: &'a str,
        lock_tokens: &'a [LockToken],
        delay: ReleaseDelay,
        cancel: &'a CancellationToken,
    ) -> BrokerFuture<'a, ()>;

    /// Remove leases from the subscription permanently.
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerError`] if the call fails.
    fn reject<'a>(
        &'a self,
        topic: &'a str,
        subscription: &'a str,
        lock_tokens: &'a [LockToken],
        cancel: &'a CancellationToken,
    ) -> BrokerFuture<'a, ()>;
}
