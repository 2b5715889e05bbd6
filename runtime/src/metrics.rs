//! Prometheus metrics for the puller engine.
//!
//! Metrics are recorded through the `metrics` facade, so they cost nothing
//! until a recorder is installed. [`MetricsServer`] installs the Prometheus
//! recorder and renders the scrape payload.
//!
//! | Metric | Kind | Labels |
//! |---|---|---|
//! | `puller_events_received_total` | counter | `subscription` |
//! | `puller_outcomes_total` | counter | `subscription`, `outcome` |
//! | `puller_receive_errors_total` | counter | `subscription` |
//! | `puller_settle_errors_total` | counter | `subscription`, `outcome` |
//! | `puller_in_flight` | gauge | `subscription` |
//! | `puller_dispatch_duration_seconds` | histogram | `subscription` |
//!
//! # Example
//!
//! ```rust,no_run
//! use event_puller_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! # Ok(())
//! # }
//! ```

use event_puller_core::OutcomeKind;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Installs the global Prometheus recorder. With an address, the exporter's
/// own HTTP listener serves `/metrics` there; the payload is always available
/// through [`render`](Self::render).
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server bound to `addr` once started.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Describe the puller metrics and install the Prometheus recorder.
    ///
    /// Must be called from within a tokio runtime; the HTTP listener runs as
    /// a background task.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or installed.
    /// A recorder that is already installed (e.g. by another test) is not an
    /// error.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        let builder = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let (recorder, exporter) = builder
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;
        let handle = recorder.handle();

        match metrics::set_global_recorder(recorder) {
            Ok(()) => {
                let addr = self.addr;
                tokio::spawn(async move {
                    if exporter.await.is_err() {
                        tracing::error!(%addr, "Metrics exporter stopped");
                    }
                });
                describe_metrics();
                self.handle = Some(handle);
                tracing::info!(
                    addr = %self.addr,
                    "Metrics server started - available at http://{}/metrics",
                    self.addr
                );
                Ok(())
            },
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            },
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn describe_metrics() {
    describe_counter!(
        "puller_events_received_total",
        "Total number of events received from the broker"
    );
    describe_counter!(
        "puller_outcomes_total",
        "Total number of dispatch outcomes, by outcome"
    );
    describe_counter!(
        "puller_receive_errors_total",
        "Total number of failed receive calls"
    );
    describe_counter!(
        "puller_settle_errors_total",
        "Total number of failed acknowledge/release/reject calls"
    );
    describe_gauge!(
        "puller_in_flight",
        "Number of events currently being dispatched"
    );
    describe_histogram!(
        "puller_dispatch_duration_seconds",
        "Time taken to dispatch one event"
    );
}

/// Puller metrics recorder for one subscription.
#[derive(Debug, Clone)]
pub struct PullerMetrics {
    subscription: String,
}

impl PullerMetrics {
    /// Recorder labelled with `subscription` (usually `topic/subscription`).
    #[must_use]
    pub fn new(subscription: impl Into<String>) -> Self {
        Self {
            subscription: subscription.into(),
        }
    }

    /// Record a received batch.
    pub fn record_received(&self, count: usize) {
        counter!("puller_events_received_total", "subscription" => self.subscription.clone())
            .increment(count as u64);
    }

    /// Record a failed receive call.
    pub fn record_receive_error(&self) {
        counter!("puller_receive_errors_total", "subscription" => self.subscription.clone())
            .increment(1);
    }

    /// Record a finished dispatch and its outcome.
    pub fn record_outcome(&self, kind: &OutcomeKind, duration: Duration) {
        counter!(
            "puller_outcomes_total",
            "subscription" => self.subscription.clone(),
            "outcome" => kind.as_str()
        )
        .increment(1);
        histogram!(
            "puller_dispatch_duration_seconds",
            "subscription" => self.subscription.clone()
        )
        .record(duration.as_secs_f64());
    }

    /// Record a failed settlement call covering `count` lock tokens.
    pub fn record_settle_error(&self, outcome: &'static str, count: usize) {
        counter!(
            "puller_settle_errors_total",
            "subscription" => self.subscription.clone(),
            "outcome" => outcome
        )
        .increment(count as u64);
    }

    /// Record current occupancy.
    #[allow(clippy::cast_precision_loss)] // in-flight counts are far below 2^52
    pub fn record_in_flight(&self, in_flight: usize) {
        gauge!("puller_in_flight", "subscription" => self.subscription.clone())
            .set(in_flight as f64);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use event_puller_core::ReleaseDelay;

    #[tokio::test]
    async fn test_metrics_server_creation() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let server = MetricsServer::new(addr);
        assert!(server.handle().is_none());
        assert!(server.render().is_none());
    }

    #[tokio::test]
    async fn test_metrics_server_render() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut server = MetricsServer::new(addr);
        server.start().unwrap();

        let metrics = PullerMetrics::new("orders/billing");
        metrics.record_received(3);
        metrics.record_outcome(&OutcomeKind::Acknowledge, Duration::from_millis(5));
        metrics.record_outcome(
            &OutcomeKind::Release {
                delay: ReleaseDelay::TenSeconds,
            },
            Duration::from_millis(7),
        );
        metrics.record_in_flight(2);

        // If another test installed the recorder first, handle is None. That's
        // fine: the metrics are still recorded globally.
        if let Some(rendered) = server.render() {
            assert!(rendered.contains("puller_events_received_total"));
            assert!(rendered.contains("puller_outcomes_total"));
            assert!(rendered.contains("outcome=\"release\""));
        }
    }

    #[test]
    fn recording_without_recorder_is_a_no_op() {
        let metrics = PullerMetrics::new("orders/audit");
        metrics.record_receive_error();
        metrics.record_settle_error("acknowledge", 4);
    }
}
