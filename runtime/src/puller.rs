//! Subscription puller.
//!
//! One [`SubscriptionPuller`] owns the whole lifecycle of one subscription:
//!
//! ```text
//!                 ┌────────────┐   bundles   ┌──────────────────┐
//!  broker ──────▶ │ feed loop  │ ──────────▶ │ TaskBoundedChannel│
//!  receive_batch  └────────────┘             └────────┬─────────┘
//!                                                     │ completions
//!                                            ┌────────▼─────────┐
//!                                            │ completion loop  │
//!                                            └──┬──────┬──────┬─┘
//!                                        ack    │ release     │ reject
//!                                            ┌──▼─┐ ┌──▼─┐ ┌──▼─┐
//!                                            │ Q  │ │ Q  │ │ Q  │
//!                                            └──┬─┘ └──┬─┘ └──┬─┘
//!  broker ◀─────────────── one batched call per drain iteration
//! ```
//!
//! The feed loop only asks the broker for as many events as there are free
//! slots, so at most `max_in_flight` events are leased and unsettled at any
//! time (plus whatever is waiting in the outcome queues).
//!
//! # Shutdown
//!
//! When the shutdown token fires, the feed loop finishes its current
//! iteration and stops (state [`PullerState::Draining`]). The channel is
//! closed, in-flight dispatches run to completion, every outcome is routed and
//! flushed, and the puller reaches [`PullerState::Stopped`]. Settlement calls
//! and handlers observe a separate abort token that only fires if the
//! service's grace period runs out.

use crate::channel::TaskBoundedChannel;
use crate::config::SubscriptionConfig;
use crate::dispatch::{Completion, dispatch_bundle};
use crate::error::RuntimeError;
use crate::metrics::PullerMetrics;
use crate::queue::OutcomeQueue;
use event_puller_core::{
    BrokerClient, BrokerError, CancellationToken, DispatchPipeline, LockToken, OutcomeKind,
    ReleaseDelay,
};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Lifecycle of a [`SubscriptionPuller`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PullerState {
    /// Created, not started.
    Idle,
    /// Receiving and dispatching.
    Running,
    /// No longer receiving; finishing in-flight work and flushing outcomes.
    Draining,
    /// All loops have exited.
    Stopped,
}

impl PullerState {
    /// Lowercase label for logs and health metadata.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for PullerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-outcome queues fed by the completion loop.
#[derive(Debug, Default)]
struct OutcomeQueues {
    acknowledge: OutcomeQueue<LockToken>,
    release: OutcomeQueue<(LockToken, ReleaseDelay)>,
    reject: OutcomeQueue<LockToken>,
}

impl OutcomeQueues {
    fn route(&self, lock_token: LockToken, kind: OutcomeKind) {
        let dropped = match kind {
            OutcomeKind::Acknowledge => self.acknowledge.push(lock_token).err(),
            OutcomeKind::Release { delay } => self
                .release
                .push((lock_token, delay))
                .err()
                .map(|(lock_token, _)| lock_token),
            OutcomeKind::Reject => self.reject.push(lock_token).err(),
        };
        if let Some(lock_token) = dropped {
            tracing::error!(
                lock_token = %lock_token,
                outcome = %kind,
                "Outcome queue closed, outcome dropped"
            );
        }
    }

    fn close(&self) {
        self.acknowledge.close();
        self.release.close();
        self.reject.close();
    }
}

/// Pulls one subscription.
///
/// Single use: [`run`](Self::run) and [`spawn`](Self::spawn) consume the puller.
pub struct SubscriptionPuller {
    config: SubscriptionConfig,
    broker: Arc<dyn BrokerClient>,
    pipeline: DispatchPipeline,
    metrics: PullerMetrics,
    state: watch::Sender<PullerState>,
}

impl SubscriptionPuller {
    /// Create an idle puller.
    #[must_use]
    pub fn new(
        config: SubscriptionConfig,
        broker: Arc<dyn BrokerClient>,
        pipeline: DispatchPipeline,
    ) -> Self {
        let metrics = PullerMetrics::new(config.name());
        let (state, _) = watch::channel(PullerState::Idle);
        Self {
            config,
            broker,
            pipeline,
            metrics,
            state,
        }
    }

    /// The subscription this puller serves.
    #[must_use]
    pub const fn config(&self) -> &SubscriptionConfig {
        &self.config
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> PullerState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<PullerState> {
        self.state.subscribe()
    }

    /// Run the puller on a new task.
    #[must_use]
    pub fn spawn(self, shutdown: CancellationToken, abort: CancellationToken) -> PullerHandle {
        let name = self.config.name();
        let state = self.state.subscribe();
        let task = tokio::spawn(self.run(shutdown, abort));
        PullerHandle { name, state, task }
    }

    /// Run until `shutdown` fires and everything received has been settled.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Config`] if the subscription's `max_in_flight`
    /// is zero.
    pub async fn run(
        self,
        shutdown: CancellationToken,
        abort: CancellationToken,
    ) -> Result<(), RuntimeError> {
        let channel = TaskBoundedChannel::new(self.config.max_in_flight())?;
        let queues = OutcomeQueues::default();

        self.transition(PullerState::Running);

        let feed = async {
            self.feed(&channel, &shutdown, &abort).await;
            self.transition(PullerState::Draining);
            channel.close();
        };

        tokio::join!(
            feed,
            self.route_completions(&channel, &queues),
            self.drain_acknowledged(&queues.acknowledge, &abort),
            self.drain_released(&queues.release, &abort),
            self.drain_rejected(&queues.reject, &abort),
        );

        self.metrics.record_in_flight(0);
        self.transition(PullerState::Stopped);
        Ok(())
    }

    fn transition(&self, next: PullerState) {
        let previous = self.state.send_replace(next);
        tracing::info!(
            topic = self.config.topic(),
            subscription = self.config.subscription(),
            from = %previous,
            to = %next,
            "Puller state changed"
        );
    }

    /// Receive and admit until shutdown.
    async fn feed(
        &self,
        channel: &TaskBoundedChannel<Completion>,
        shutdown: &CancellationToken,
        abort: &CancellationToken,
    ) {
        let topic = self.config.topic();
        let subscription = self.config.subscription();

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                () = channel.wait_for_capacity() => {},
            }

            let want = channel.capacity().saturating_sub(channel.in_flight_count());
            if want == 0 {
                continue;
            }

            let bundles = match self
                .broker
                .receive_batch(topic, subscription, want, shutdown)
                .await
            {
                Ok(bundles) => bundles,
                Err(BrokerError::Cancelled) if shutdown.is_cancelled() => break,
                Err(error) => {
                    self.metrics.record_receive_error();
                    tracing::warn!(
                        topic,
                        subscription,
                        error = %error,
                        backoff_ms = self.config.receive_error_backoff().as_millis(),
                        "Receive failed, retrying after backoff"
                    );
                    if self.back_off(shutdown).await {
                        break;
                    }
                    continue;
                },
            };

            if bundles.is_empty() {
                tracing::trace!(topic, subscription, "Receive returned no events");
                continue;
            }

            tracing::debug!(topic, subscription, count = bundles.len(), requested = want, "Received events");
            self.metrics.record_received(bundles.len());

            for bundle in bundles {
                let lock_token = bundle.lock_token.clone();
                let dispatch = dispatch_bundle(
                    self.pipeline.clone(),
                    bundle,
                    self.config.retry_policy().clone(),
                    abort.clone(),
                );
                if let Err(error) = channel.submit(dispatch).await {
                    tracing::error!(
                        topic,
                        subscription,
                        lock_token = %lock_token,
                        error = %error,
                        "Failed to admit event, it will be redelivered after its lock expires"
                    );
                }
            }
            self.metrics.record_in_flight(channel.in_flight_count());
        }

        tracing::debug!(topic, subscription, "Feed loop stopped");
    }

    /// Sleep for the receive error backoff. Returns true if shutdown fired.
    async fn back_off(&self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => true,
            () = tokio::time::sleep(self.config.receive_error_backoff()) => false,
        }
    }

    /// Route completions, in completion order, into the outcome queues.
    async fn route_completions(
        &self,
        channel: &TaskBoundedChannel<Completion>,
        queues: &OutcomeQueues,
    ) {
        while let Some(Completion { outcome, elapsed }) = channel.next().await {
            self.metrics.record_outcome(&outcome.kind, elapsed);
            self.metrics.record_in_flight(channel.in_flight_count());
            queues.route(outcome.lock_token, outcome.kind);
        }
        queues.close();
        tracing::debug!(
            topic = self.config.topic(),
            subscription = self.config.subscription(),
            "Completion loop stopped"
        );
    }

    async fn drain_acknowledged(&self, queue: &OutcomeQueue<LockToken>, abort: &CancellationToken) {
        while let Some(lock_tokens) = queue.next_batch().await {
            let result = self
                .broker
                .acknowledge(self.config.topic(), self.config.subscription(), &lock_tokens, abort)
                .await;
            self.report_settlement("acknowledge", &lock_tokens, result);
        }
    }

    /// Settle releases, one broker call per distinct delay in each snapshot.
    async fn drain_released(
        &self,
        queue: &OutcomeQueue<(LockToken, ReleaseDelay)>,
        abort: &CancellationToken,
    ) {
        while let Some(batch) = queue.next_batch().await {
            let mut by_delay: BTreeMap<ReleaseDelay, Vec<LockToken>> = BTreeMap::new();
            for (lock_token, delay) in batch {
                by_delay.entry(delay).or_default().push(lock_token);
            }

            for (delay, lock_tokens) in by_delay {
                let result = self
                    .broker
                    .release(
                        self.config.topic(),
                        self.config.subscription(),
                        &lock_tokens,
                        delay,
                        abort,
                    )
                    .await;
                self.report_settlement("release", &lock_tokens, result);
            }
        }
    }

    async fn drain_rejected(&self, queue: &OutcomeQueue<LockToken>, abort: &CancellationToken) {
        while let Some(lock_tokens) = queue.next_batch().await {
            let result = self
                .broker
                .reject(self.config.topic(), self.config.subscription(), &lock_tokens, abort)
                .await;
            self.report_settlement("reject", &lock_tokens, result);
        }
    }

    /// Settlement failures are not retried: the broker redelivers once the
    /// lock expires.
    fn report_settlement(
        &self,
        outcome: &'static str,
        lock_tokens: &[LockToken],
        result: Result<(), BrokerError>,
    ) {
        let topic = self.config.topic();
        let subscription = self.config.subscription();
        match result {
            Ok(()) => tracing::debug!(
                topic,
                subscription,
                outcome,
                count = lock_tokens.len(),
                "Settled events"
            ),
            Err(error) => {
                self.metrics.record_settle_error(outcome, lock_tokens.len());
                tracing::error!(
                    topic,
                    subscription,
                    outcome,
                    count = lock_tokens.len(),
                    error = %error,
                    "Failed to settle events"
                );
            },
        }
    }
}

impl fmt::Debug for SubscriptionPuller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionPuller")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Handle to a spawned [`SubscriptionPuller`].
#[derive(Debug)]
pub struct PullerHandle {
    name: String,
    state: watch::Receiver<PullerState>,
    task: JoinHandle<Result<(), RuntimeError>>,
}

impl PullerHandle {
    /// `topic/subscription` of the puller.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> PullerState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<PullerState> {
        self.state.clone()
    }

    /// Wait until the puller reaches `target` (or any later state).
    ///
    /// Returns the state observed. Resolves immediately if the puller task has
    /// already gone away.
    pub async fn wait_for(&self, target: PullerState) -> PullerState {
        let mut state = self.state.clone();
        let reached = state
            .wait_for(|current| rank(*current) >= rank(target))
            .await
            .map(|current| *current);
        reached.unwrap_or(PullerState::Stopped)
    }

    /// Returns true once the puller task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the puller task to exit.
    ///
    /// # Errors
    ///
    /// Returns the puller's own error, or [`RuntimeError::TaskJoin`] if the
    /// task panicked or was aborted.
    pub async fn join(self) -> Result<(), RuntimeError> {
        self.task.await?
    }
}

const fn rank(state: PullerState) -> u8 {
    match state {
        PullerState::Idle => 0,
        PullerState::Running => 1,
        PullerState::Draining => 2,
        PullerState::Stopped => 3,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use event_puller_testing::{BrokerCall, InMemoryBroker};

    fn puller(broker: &InMemoryBroker) -> SubscriptionPuller {
        let config = SubscriptionConfig::builder("orders", "billing").build().unwrap();
        SubscriptionPuller::new(
            config,
            Arc::new(broker.clone()),
            DispatchPipeline::builder().build(),
        )
    }

    #[test]
    fn states_are_ranked_in_lifecycle_order() {
        let states = [
            PullerState::Idle,
            PullerState::Running,
            PullerState::Draining,
            PullerState::Stopped,
        ];
        for pair in states.windows(2) {
            assert!(rank(pair[0]) < rank(pair[1]));
        }
        assert_eq!(PullerState::Draining.to_string(), "draining");
    }

    #[tokio::test]
    async fn outcomes_are_routed_to_their_queue() {
        let queues = OutcomeQueues::default();
        queues.route(LockToken::new("a"), OutcomeKind::Release { delay: ReleaseDelay::OneMinute });
        queues.route(LockToken::new("b"), OutcomeKind::Acknowledge);
        queues.route(LockToken::new("c"), OutcomeKind::Release { delay: ReleaseDelay::TenSeconds });
        queues.route(LockToken::new("d"), OutcomeKind::Reject);
        queues.close();

        assert_eq!(queues.acknowledge.next_batch().await.unwrap(), vec![LockToken::new("b")]);
        assert_eq!(queues.reject.next_batch().await.unwrap(), vec![LockToken::new("d")]);
        assert_eq!(queues.release.next_batch().await.unwrap().len(), 2);
        assert!(queues.release.next_batch().await.is_none());
    }

    #[tokio::test]
    async fn releases_are_grouped_by_delay() {
        let broker = InMemoryBroker::new();
        let puller = puller(&broker);
        let queue = OutcomeQueue::new();
        queue.push((LockToken::new("a"), ReleaseDelay::OneMinute)).unwrap();
        queue.push((LockToken::new("b"), ReleaseDelay::TenSeconds)).unwrap();
        queue.push((LockToken::new("c"), ReleaseDelay::OneMinute)).unwrap();
        queue.close();

        puller.drain_released(&queue, &CancellationToken::new()).await;

        let releases: Vec<_> = broker
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                BrokerCall::Release { lock_tokens, delay, .. } => Some((delay, lock_tokens)),
                _ => None,
            })
            .collect();
        assert_eq!(
            releases,
            vec![
                (ReleaseDelay::TenSeconds, vec![LockToken::new("b")]),
                (ReleaseDelay::OneMinute, vec![LockToken::new("a"), LockToken::new("c")]),
            ]
        );
    }

    #[tokio::test]
    async fn failed_settlement_is_not_retried() {
        let broker = InMemoryBroker::new();
        broker.fail_settlements(1, BrokerError::Transport("connection reset".into()));
        let puller = puller(&broker);
        let queue = OutcomeQueue::new();
        queue.push(LockToken::new("a")).unwrap();
        queue.close();

        puller.drain_acknowledged(&queue, &CancellationToken::new()).await;

        let acknowledges = broker
            .calls()
            .iter()
            .filter(|call| matches!(call, BrokerCall::Acknowledge { .. }))
            .count();
        assert_eq!(acknowledges, 1);
        assert!(broker.settlements().is_empty());
    }
}
