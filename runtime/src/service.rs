//! Puller service: one [`SubscriptionPuller`] per configured subscription.
//!
//! # Example
//!
//! ```ignore
//! let service = PullerService::new(broker, pipeline, PullerConfig::from_env()?)?;
//! let handle = service.start();
//!
//! tokio::signal::ctrl_c().await?;
//! handle.shutdown(Duration::from_secs(30)).await?;
//! ```

use crate::config::PullerConfig;
use crate::error::RuntimeError;
use crate::puller::{PullerHandle, PullerState, SubscriptionPuller};
use crate::{HealthCheck, HealthReport};
use event_puller_core::{BrokerClient, CancellationToken, DispatchPipeline};
use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Runs every configured subscription for the life of the process.
pub struct PullerService {
    broker: Arc<dyn BrokerClient>,
    pipeline: DispatchPipeline,
    config: PullerConfig,
}

impl PullerService {
    /// Create a service.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Config`] if the configuration is invalid.
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        pipeline: DispatchPipeline,
        config: PullerConfig,
    ) -> Result<Self, RuntimeError> {
        config.validate()?;
        Ok(Self {
            broker,
            pipeline,
            config,
        })
    }

    /// The service configuration.
    #[must_use]
    pub const fn config(&self) -> &PullerConfig {
        &self.config
    }

    /// Spawn one puller per subscription.
    #[must_use]
    pub fn start(self) -> ServiceHandle {
        let shutdown = CancellationToken::new();
        let abort = CancellationToken::new();

        let pullers: Vec<PullerHandle> = self
            .config
            .subscriptions
            .iter()
            .map(|subscription| {
                SubscriptionPuller::new(
                    subscription.clone(),
                    Arc::clone(&self.broker),
                    self.pipeline.clone(),
                )
                .spawn(shutdown.clone(), abort.clone())
            })
            .collect();

        tracing::info!(
            subscriptions = pullers.len(),
            registered_events = self.pipeline.registry().len(),
            "Puller service started"
        );

        ServiceHandle {
            cancel: shutdown,
            abort,
            pullers,
            shutdown_grace: self.config.shutdown_grace,
        }
    }

    /// Start, run until `signal` resolves, then shut down with the configured
    /// grace period.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::ShutdownTimeout`] if the pullers did not drain
    /// in time, or the first puller error.
    pub async fn run_until(self, signal: impl Future<Output = ()>) -> Result<(), RuntimeError> {
        let handle = self.start();
        signal.await;
        let grace = handle.shutdown_grace;
        handle.shutdown(grace).await
    }
}

impl std::fmt::Debug for PullerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PullerService")
            .field("config", &self.config)
            .field("pipeline", &self.pipeline)
            .finish_non_exhaustive()
    }
}

/// Handle to a started [`PullerService`].
#[derive(Debug)]
pub struct ServiceHandle {
    cancel: CancellationToken,
    abort: CancellationToken,
    pullers: Vec<PullerHandle>,
    shutdown_grace: Duration,
}

impl ServiceHandle {
    /// `(topic/subscription, state)` of every puller.
    #[must_use]
    pub fn states(&self) -> Vec<(String, PullerState)> {
        self.pullers
            .iter()
            .map(|puller| (puller.name().to_string(), puller.state()))
            .collect()
    }

    /// The pullers' handles.
    #[must_use]
    pub fn pullers(&self) -> &[PullerHandle] {
        &self.pullers
    }

    /// Token that stops the pullers when cancelled.
    ///
    /// Cancelling it directly begins a shutdown without a grace deadline.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Configured grace period.
    #[must_use]
    pub const fn shutdown_grace(&self) -> Duration {
        self.shutdown_grace
    }

    /// Health of every puller.
    ///
    /// Running is healthy; idle and draining are degraded; a puller that
    /// stopped while the service was not shutting down is unhealthy.
    #[must_use]
    pub fn health(&self) -> HealthReport {
        let shutting_down = self.cancel.is_cancelled();
        let checks = self
            .pullers
            .iter()
            .map(|puller| {
                let component = format!("puller:{}", puller.name());
                let state = puller.state();
                let check = match state {
                    PullerState::Running => HealthCheck::healthy(component),
                    PullerState::Idle => HealthCheck::degraded(component, "Puller has not started"),
                    PullerState::Draining => {
                        HealthCheck::degraded(component, "Puller is draining in-flight events")
                    },
                    PullerState::Stopped if shutting_down => {
                        HealthCheck::degraded(component, "Puller stopped for shutdown")
                    },
                    PullerState::Stopped => {
                        HealthCheck::unhealthy(component, "Puller stopped unexpectedly")
                    },
                };
                check.with_metadata("state", state.as_str())
            })
            .collect();
        HealthReport::new(checks)
    }

    /// Stop receiving and wait up to `grace` for every puller to drain.
    ///
    /// If the grace period expires, in-progress settlement calls and handlers
    /// are cancelled through the abort token and the call fails.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::ShutdownTimeout`] with the number of pullers
    /// still running when the grace period expired, or the first puller error.
    pub async fn shutdown(self, grace: Duration) -> Result<(), RuntimeError> {
        tracing::info!(
            pullers = self.pullers.len(),
            grace_ms = grace.as_millis(),
            "Initiating graceful shutdown"
        );
        self.cancel.cancel();

        let states: Vec<_> = self
            .pullers
            .iter()
            .map(PullerHandle::subscribe_state)
            .collect();
        let abort = self.abort;

        match tokio::time::timeout(grace, join_all(self.pullers.into_iter().map(PullerHandle::join)))
            .await
        {
            Ok(results) => {
                results.into_iter().collect::<Result<Vec<()>, _>>()?;
                tracing::info!("All pullers drained, shutdown successful");
                Ok(())
            },
            Err(_) => {
                abort.cancel();
                let still_running = states
                    .iter()
                    .filter(|state| *state.borrow() != PullerState::Stopped)
                    .count();
                tracing::error!(
                    still_running,
                    "Shutdown timeout: {} pullers still running", still_running
                );
                Err(RuntimeError::ShutdownTimeout(still_running))
            },
        }
    }

    /// Wait for every puller to stop on its own (after the shutdown token
    /// has been cancelled elsewhere).
    ///
    /// # Errors
    ///
    /// Returns the first puller error.
    pub async fn wait(self) -> Result<(), RuntimeError> {
        join_all(self.pullers.into_iter().map(PullerHandle::join))
            .await
            .into_iter()
            .collect::<Result<Vec<()>, _>>()
            .map(|_| ())
    }
}
