//! Puller Demo - one service, an in-memory broker, Prometheus metrics
//!
//! A background producer publishes a mix of events. Orders are handled.
//! Payments sometimes fail and get released for a retry, or are declined and
//! rejected. Loyalty events have no registered type and are rejected too.
//!
//! # Running the Example
//!
//! ```bash
//! cargo run -p puller-demo
//! ```
//!
//! Then visit:
//! - Metrics endpoint: <http://localhost:9000/metrics>
//!
//! Configuration is read from the environment (`EVENT_PULLER_TOPIC`,
//! `EVENT_PULLER_SUBSCRIPTION`, `EVENT_PULLER_MAX_IN_FLIGHT`, or a full JSON
//! document in `EVENT_PULLER_CONFIG`); without it the demo pulls
//! `orders/fulfillment` with 8 events in flight.

#![allow(missing_docs)]

use event_puller_core::{
    BrokerClient, CancellationToken, DispatchError, DispatchPipeline, DomainEvent,
    TracingBehavior, handler_fn,
};
use event_puller_runtime::{MetricsServer, PullerConfig, PullerService, SubscriptionConfig};
use event_puller_testing::{InMemoryBroker, json_event};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Serialize, Deserialize)]
struct OrderPlaced {
    order_id: u64,
    total_cents: u64,
}

impl DomainEvent for OrderPlaced {
    const EVENT_NAME: &'static str = "sales.order-placed.v1";
}

#[derive(Debug, Serialize, Deserialize)]
struct PaymentCaptured {
    order_id: u64,
    amount_cents: u64,
}

impl DomainEvent for PaymentCaptured {
    const EVENT_NAME: &'static str = "billing.payment-captured.v1";
}

#[derive(Debug, Serialize)]
struct LoyaltyPointsAwarded {
    order_id: u64,
    points: u32,
}

fn load_config() -> anyhow::Result<PullerConfig> {
    match PullerConfig::from_env() {
        Ok(config) => Ok(config),
        Err(error) => {
            tracing::info!(%error, "No puller configuration in the environment, using defaults");
            let subscription = SubscriptionConfig::builder("orders", "fulfillment")
                .max_in_flight(8)
                .build()?;
            Ok(PullerConfig::new(vec![subscription]).with_shutdown_grace(Duration::from_secs(5)))
        },
    }
}

fn build_pipeline() -> anyhow::Result<DispatchPipeline> {
    let pipeline = DispatchPipeline::builder()
        .handler::<OrderPlaced, _>(handler_fn(|order: OrderPlaced, _cancel| async move {
            tokio::time::sleep(Duration::from_millis(25)).await;
            tracing::info!(order_id = order.order_id, total_cents = order.total_cents, "Order fulfilled");
            Ok::<(), anyhow::Error>(())
        }))?
        .handler::<PaymentCaptured, _>(handler_fn(|payment: PaymentCaptured, _cancel| async move {
            if payment.order_id % 4 == 0 {
                anyhow::bail!("payment gateway timeout for order {}", payment.order_id);
            }
            if payment.order_id % 7 == 0 {
                return Err(DispatchError::rejected(PaymentCaptured::EVENT_NAME, "card declined").into());
            }
            tracing::info!(order_id = payment.order_id, amount_cents = payment.amount_cents, "Payment recorded");
            Ok::<(), anyhow::Error>(())
        }))?
        .behavior(TracingBehavior)
        .build();
    Ok(pipeline)
}

/// Publish a few events per tick on every configured subscription.
async fn produce(broker: InMemoryBroker, config: PullerConfig, stop: CancellationToken) {
    let mut ticker = tokio::time::interval(Duration::from_millis(200));
    let mut order_id = 0_u64;

    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            _ = ticker.tick() => {},
        }
        order_id += 1;

        for subscription in &config.subscriptions {
            let topic = subscription.topic();
            let name = subscription.subscription();
            broker.publish(
                topic,
                name,
                json_event(
                    format!("order-{order_id}"),
                    OrderPlaced::EVENT_NAME,
                    &OrderPlaced { order_id, total_cents: order_id * 1_250 },
                ),
            );
            broker.publish(
                topic,
                name,
                json_event(
                    format!("payment-{order_id}"),
                    PaymentCaptured::EVENT_NAME,
                    &PaymentCaptured { order_id, amount_cents: order_id * 1_250 },
                ),
            );
            if order_id % 10 == 0 {
                broker.publish(
                    topic,
                    name,
                    json_event(
                        format!("loyalty-{order_id}"),
                        "loyalty.points-awarded.v1",
                        &LoyaltyPointsAwarded { order_id, points: 50 },
                    ),
                );
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Initialize tracing subscriber
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,event_puller_runtime=debug,puller_demo=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Puller Demo");

    // 2. Install Prometheus exporter
    let mut metrics = MetricsServer::new(([0, 0, 0, 0], 9000).into());
    metrics.start()?;

    // 3. Configuration, broker and pipeline
    let config = load_config()?;
    let broker = InMemoryBroker::new().with_receive_wait(Duration::from_millis(250));
    let client: Arc<dyn BrokerClient> = Arc::new(broker.clone());
    let pipeline = build_pipeline()?;

    // 4. Start producing and pulling
    let stop_producer = CancellationToken::new();
    let producer = tokio::spawn(produce(broker.clone(), config.clone(), stop_producer.clone()));

    let grace = config.shutdown_grace;
    let handle = PullerService::new(client, pipeline, config)?.start();

    tracing::info!("========================================");
    tracing::info!("Pullers running!");
    tracing::info!("Visit: http://localhost:9000/metrics");
    tracing::info!("Press Ctrl+C to exit");
    tracing::info!("========================================");

    // 5. Report health until Ctrl+C
    let mut health_ticker = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            },
            _ = health_ticker.tick() => {
                let report = handle.health();
                tracing::info!(
                    status = %report.status,
                    acknowledged = broker.acknowledged_count(),
                    "Health check"
                );
            },
        }
    }

    tracing::info!("Shutdown signal received, stopping...");

    // 6. Graceful shutdown
    stop_producer.cancel();
    producer.await?;
    handle.shutdown(grace).await?;

    tracing::info!("✓ Clean shutdown complete");
    Ok(())
}
