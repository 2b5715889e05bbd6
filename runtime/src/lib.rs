//! # Event Puller Runtime
//!
//! Pull engine for broker-delivered events.
//!
//! This crate turns the contracts of `event-puller-core` into a running
//! consumer: it leases events from a [`BrokerClient`](event_puller_core::BrokerClient),
//! dispatches them through a [`DispatchPipeline`](event_puller_core::DispatchPipeline)
//! with bounded concurrency, and settles every lease exactly once.
//!
//! ## Core Components
//!
//! - **[`TaskBoundedChannel`]**: admits up to N concurrent operations and yields
//!   their outputs in completion order
//! - **[`SubscriptionPuller`]**: feed loop, completion loop and three drain
//!   loops for one subscription
//! - **[`PullerService`]**: one puller per configured subscription, with
//!   graceful shutdown and health reporting
//! - **[`RetryPolicy`]**: release delay for transient failures
//!
//! ## Example
//!
//! ```ignore
//! use event_puller_runtime::{PullerConfig, PullerService};
//!
//! let pipeline = DispatchPipeline::builder()
//!     .handler::<OrderPlaced, _>(SendConfirmation)?
//!     .behavior(TracingBehavior)
//!     .build();
//!
//! let service = PullerService::new(broker, pipeline, PullerConfig::from_env()?)?;
//! service.run_until(async { let _ = tokio::signal::ctrl_c().await; }).await?;
//! ```

/// Bounded completion multiplexer
pub mod channel;

/// Puller configuration
pub mod config;

/// Per-event dispatch and outcome classification
pub mod dispatch;

/// Prometheus metrics for observability
pub mod metrics;

/// Subscription puller
pub mod puller;

/// Outcome queues
pub mod queue;

/// Release delay computation
pub mod retry;

/// Puller service
pub mod service;

/// Error types for the puller runtime
pub mod error {
    use thiserror::Error;

    /// Errors that can occur while configuring or running pullers.
    ///
    /// Broker and dispatch failures never surface here: they are logged and
    /// turned into outcomes inside the puller.
    #[derive(Error, Debug)]
    pub enum RuntimeError {
        /// Invalid configuration
        #[error("Invalid configuration: {0}")]
        Config(String),

        /// Shutdown timed out waiting for pullers to drain
        ///
        /// In-progress settlement was cancelled; unsettled events are
        /// redelivered by the broker once their locks expire.
        #[error("Shutdown timed out with {0} pullers still running")]
        ShutdownTimeout(usize),

        /// The channel or queue no longer accepts work
        #[error("Channel is closed")]
        Closed,

        /// A puller task panicked or was aborted
        #[error("Puller task failed: {0}")]
        TaskJoin(#[from] tokio::task::JoinError),
    }
}

pub use channel::TaskBoundedChannel;
pub use config::{PullerConfig, SubscriptionConfig, SubscriptionConfigBuilder};
pub use dispatch::{Completion, classify, dispatch_bundle};
pub use error::RuntimeError;
pub use metrics::{MetricsServer, PullerMetrics};
pub use puller::{PullerHandle, PullerState, SubscriptionPuller};
pub use queue::OutcomeQueue;
pub use retry::{RetryPolicy, RetryPolicyBuilder};
pub use service::{PullerService, ServiceHandle};

/// Health check status levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthStatus {
    /// Component is fully operational
    Healthy,

    /// Component works but is not pulling at full capacity (starting, draining)
    Degraded,

    /// Component is not operational
    Unhealthy,
}

impl HealthStatus {
    /// Check if status is healthy
    #[must_use]
    pub const fn is_healthy(self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// Check if status is degraded
    #[must_use]
    pub const fn is_degraded(self) -> bool {
        matches!(self, Self::Degraded)
    }

    /// Check if status is unhealthy
    #[must_use]
    pub const fn is_unhealthy(self) -> bool {
        matches!(self, Self::Unhealthy)
    }

    /// The worse of two statuses
    #[must_use]
    pub fn worst(self, other: Self) -> Self {
        self.max(other)
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Health of one puller
#[derive(Debug, Clone)]
pub struct HealthCheck {
    /// Component name, `puller:topic/subscription`
    pub component: String,

    /// Current health status
    pub status: HealthStatus,

    /// Why the component is not healthy
    pub message: Option<String>,

    /// Extra key/value details (e.g. the puller state)
    pub metadata: Vec<(String, String)>,
}

impl HealthCheck {
    fn with_status(component: String, status: HealthStatus, message: Option<String>) -> Self {
        Self {
            component,
            status,
            message,
            metadata: Vec::new(),
        }
    }

    /// Healthy component
    #[must_use]
    pub fn healthy(component: impl Into<String>) -> Self {
        Self::with_status(component.into(), HealthStatus::Healthy, None)
    }

    /// Degraded component
    #[must_use]
    pub fn degraded(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(component.into(), HealthStatus::Degraded, Some(message.into()))
    }

    /// Unhealthy component
    #[must_use]
    pub fn unhealthy(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(component.into(), HealthStatus::Unhealthy, Some(message.into()))
    }

    /// Attach a metadata entry
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.push((key.into(), value.into()));
        self
    }

    /// Look up a metadata entry
    #[must_use]
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Aggregated health of a puller service
///
/// The overall status is the worst of all checks; a service without pullers
/// is healthy.
#[derive(Debug, Clone)]
pub struct HealthReport {
    /// Overall status (worst of all checks)
    pub status: HealthStatus,

    /// Individual puller checks
    pub checks: Vec<HealthCheck>,

    /// When the report was generated
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl HealthReport {
    /// Aggregate checks into a report
    #[must_use]
    pub fn new(checks: Vec<HealthCheck>) -> Self {
        let status = checks
            .iter()
            .map(|c| c.status)
            .fold(HealthStatus::Healthy, HealthStatus::worst);

        Self {
            status,
            checks,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Check if the service is healthy
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        self.status.is_healthy()
    }

    /// Check if the service is degraded
    #[must_use]
    pub const fn is_degraded(&self) -> bool {
        self.status.is_degraded()
    }

    /// Check if the service is unhealthy
    #[must_use]
    pub const fn is_unhealthy(&self) -> bool {
        self.status.is_unhealthy()
    }

    /// The check for `component`, if present
    #[must_use]
    pub fn check(&self, component: &str) -> Option<&HealthCheck> {
        self.checks.iter().find(|c| c.component == component)
    }
}
