//! In-memory pull broker.
//!
//! [`InMemoryBroker`] implements [`BrokerClient`] against a process-local
//! lease table, so puller behavior can be tested without a real broker:
//!
//! - [`publish`](InMemoryBroker::publish) makes an event available on a
//!   subscription;
//! - `receive_batch` leases available events, assigning lock tokens and
//!   incrementing delivery counts. With nothing available it long-polls for up
//!   to [`receive_wait`](InMemoryBroker::with_receive_wait) before returning an
//!   empty batch;
//! - acknowledge drops the lease, reject moves the event to a dead-letter list,
//!   release makes it available again once the release delay has passed
//!   (measured with `tokio::time`, so paused-clock tests can advance it).
//!
//! Every call is recorded for assertions, and failures can be injected.

#![allow(clippy::missing_panics_doc)]

use event_puller_core::{
    BrokerClient, BrokerError, BrokerFuture, CancellationToken, EventBundle, LockToken,
    OutcomeKind, RawEvent, ReleaseDelay,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// One recorded broker call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerCall {
    /// `receive_batch`
    Receive {
        /// Subscription key, `topic/subscription`
        subscription: String,
        /// Requested maximum
        max_count: usize,
        /// Number of events actually returned
        returned: usize,
    },
    /// `acknowledge`
    Acknowledge {
        /// Subscription key, `topic/subscription`
        subscription: String,
        /// Settled lock tokens
        lock_tokens: Vec<LockToken>,
    },
    /// `release`
    Release {
        /// Subscription key, `topic/subscription`
        subscription: String,
        /// Settled lock tokens
        lock_tokens: Vec<LockToken>,
        /// Requested delay
        delay: ReleaseDelay,
    },
    /// `reject`
    Reject {
        /// Subscription key, `topic/subscription`
        subscription: String,
        /// Settled lock tokens
        lock_tokens: Vec<LockToken>,
    },
}

/// One lock token's settlement, in the order the broker saw them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    /// The settled lease
    pub lock_token: LockToken,
    /// How it was settled
    pub kind: OutcomeKind,
}

#[derive(Debug, Clone)]
struct Stored {
    event: RawEvent,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct SubscriptionState {
    available: VecDeque<Stored>,
    delayed: Vec<(Instant, Stored)>,
    leased: HashMap<LockToken, Stored>,
    dead_letters: Vec<RawEvent>,
}

impl SubscriptionState {
    fn promote_due(&mut self, now: Instant) {
        let mut index = 0;
        while index < self.delayed.len() {
            if self.delayed[index].0 <= now {
                let (_, stored) = self.delayed.swap_remove(index);
                self.available.push_back(stored);
            } else {
                index += 1;
            }
        }
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    subscriptions: HashMap<String, SubscriptionState>,
    calls: Vec<BrokerCall>,
    settlements: Vec<Settlement>,
    receive_faults: VecDeque<BrokerError>,
    settle_faults: VecDeque<BrokerError>,
    next_token: u64,
    receive_wait: Duration,
    settle_latency: Duration,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<BrokerState>,
    published: Notify,
}

/// In-memory [`BrokerClient`].
///
/// Clones share the same lease table.
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

fn key(topic: &str, subscription: &str) -> String {
    format!("{topic}/{subscription}")
}

impl InMemoryBroker {
    /// Create an empty broker with a 20ms long-poll and instant settlement.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState {
                    receive_wait: Duration::from_millis(20),
                    ..BrokerState::default()
                }),
                published: Notify::new(),
            }),
        }
    }

    /// How long an empty `receive_batch` waits for events before returning.
    #[must_use]
    pub fn with_receive_wait(self, receive_wait: Duration) -> Self {
        self.lock().receive_wait = receive_wait;
        self
    }

    /// Delay every settlement call by `latency`.
    #[must_use]
    pub fn with_settle_latency(self, latency: Duration) -> Self {
        self.lock().settle_latency = latency;
        self
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `event` available on a subscription.
    pub fn publish(&self, topic: &str, subscription: &str, event: RawEvent) {
        self.lock()
            .subscriptions
            .entry(key(topic, subscription))
            .or_default()
            .available
            .push_back(Stored {
                event,
                delivery_count: 0,
            });
        self.shared.published.notify_waiters();
    }

    /// Make every event available on a subscription.
    pub fn publish_all(
        &self,
        topic: &str,
        subscription: &str,
        events: impl IntoIterator<Item = RawEvent>,
    ) {
        {
            let mut state = self.lock();
            let queue = &mut state
                .subscriptions
                .entry(key(topic, subscription))
                .or_default()
                .available;
            queue.extend(events.into_iter().map(|event| Stored {
                event,
                delivery_count: 0,
            }));
        }
        self.shared.published.notify_waiters();
    }

    /// Fail the next `count` receive calls with `error`.
    pub fn fail_receives(&self, count: usize, error: BrokerError) {
        self.lock()
            .receive_faults
            .extend(std::iter::repeat_n(error, count));
    }

    /// Fail the next `count` settlement calls with `error`.
    ///
    /// A failed settlement leaves its leases in place, as a real broker would.
    pub fn fail_settlements(&self, count: usize, error: BrokerError) {
        self.lock()
            .settle_faults
            .extend(std::iter::repeat_n(error, count));
    }

    /// Every call, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<BrokerCall> {
        self.lock().calls.clone()
    }

    /// `max_count` of every receive call, in order.
    #[must_use]
    pub fn receive_requests(&self) -> Vec<usize> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                BrokerCall::Receive { max_count, .. } => Some(*max_count),
                _ => None,
            })
            .collect()
    }

    /// Number of events returned by every receive call that returned any.
    #[must_use]
    pub fn received_batches(&self) -> Vec<usize> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                BrokerCall::Receive { returned, .. } if *returned > 0 => Some(*returned),
                _ => None,
            })
            .collect()
    }

    /// Every settled lock token, in order.
    #[must_use]
    pub fn settlements(&self) -> Vec<Settlement> {
        self.lock().settlements.clone()
    }

    /// Lock tokens settled with `kind` (release delays are compared too).
    #[must_use]
    pub fn settled_as(&self, kind: OutcomeKind) -> Vec<LockToken> {
        self.lock()
            .settlements
            .iter()
            .filter(|settlement| settlement.kind == kind)
            .map(|settlement| settlement.lock_token.clone())
            .collect()
    }

    /// Number of acknowledged lock tokens.
    #[must_use]
    pub fn acknowledged_count(&self) -> usize {
        self.settled_as(OutcomeKind::Acknowledge).len()
    }

    /// Events leased and not yet settled on a subscription.
    #[must_use]
    pub fn leased_count(&self, topic: &str, subscription: &str) -> usize {
        self.lock()
            .subscriptions
            .get(&key(topic, subscription))
            .map_or(0, |s| s.leased.len())
    }

    /// Events waiting to be received (including delayed redeliveries).
    #[must_use]
    pub fn pending_count(&self, topic: &str, subscription: &str) -> usize {
        self.lock()
            .subscriptions
            .get(&key(topic, subscription))
            .map_or(0, |s| s.available.len() + s.delayed.len())
    }

    /// Rejected events of a subscription.
    #[must_use]
    pub fn dead_letters(&self, topic: &str, subscription: &str) -> Vec<RawEvent> {
        self.lock()
            .subscriptions
            .get(&key(topic, subscription))
            .map(|s| s.dead_letters.clone())
            .unwrap_or_default()
    }

    fn try_lease(&self, topic: &str, subscription: &str, max_count: usize) -> Vec<EventBundle> {
        let mut state = self.lock();
        let BrokerState {
            subscriptions,
            next_token,
            ..
        } = &mut *state;
        let sub = subscriptions.entry(key(topic, subscription)).or_default();
        sub.promote_due(Instant::now());

        let take = max_count.min(sub.available.len());
        let mut bundles = Vec::with_capacity(take);
        for mut stored in sub.available.drain(..take) {
            *next_token += 1;
            let lock_token = LockToken::new(format!("lock-{next_token}"));
            stored.delivery_count += 1;
            bundles.push(EventBundle::new(
                stored.event.clone(),
                lock_token.clone(),
                stored.delivery_count,
            ));
            sub.leased.insert(lock_token, stored);
        }
        bundles
    }

    fn record_receive(&self, topic: &str, subscription: &str, max_count: usize, returned: usize) {
        self.lock().calls.push(BrokerCall::Receive {
            subscription: key(topic, subscription),
            max_count,
            returned,
        });
    }

    async fn settle(
        &self,
        topic: &str,
        subscription: &str,
        lock_tokens: &[LockToken],
        kind: OutcomeKind,
        cancel: &CancellationToken,
    ) -> Result<(), BrokerError> {
        let latency = self.lock().settle_latency;
        if !latency.is_zero() {
            tokio::select! {
                () = cancel.cancelled() => return Err(BrokerError::Cancelled),
                () = tokio::time::sleep(latency) => {},
            }
        }

        let mut state = self.lock();
        let name = key(topic, subscription);
        state.calls.push(match kind {
            OutcomeKind::Acknowledge => BrokerCall::Acknowledge {
                subscription: name.clone(),
                lock_tokens: lock_tokens.to_vec(),
            },
            OutcomeKind::Release { delay } => BrokerCall::Release {
                subscription: name.clone(),
                lock_tokens: lock_tokens.to_vec(),
                delay,
            },
            OutcomeKind::Reject => BrokerCall::Reject {
                subscription: name.clone(),
                lock_tokens: lock_tokens.to_vec(),
            },
        });
        if let Some(error) = state.settle_faults.pop_front() {
            tracing::debug!(topic, subscription, outcome = %kind, error = %error, "Injected settlement failure");
            return Err(error);
        }

        let BrokerState {
            subscriptions,
            settlements,
            ..
        } = &mut *state;
        let sub = subscriptions.entry(name).or_default();
        let mut unknown = Vec::new();
        for lock_token in lock_tokens {
            let Some(stored) = sub.leased.remove(lock_token) else {
                unknown.push(lock_token.to_string());
                continue;
            };
            settlements.push(Settlement {
                lock_token: lock_token.clone(),
                kind,
            });
            match kind {
                OutcomeKind::Acknowledge => {},
                OutcomeKind::Release { delay } => {
                    sub.delayed.push((Instant::now() + delay.as_duration(), stored));
                },
                OutcomeKind::Reject => sub.dead_letters.push(stored.event),
            }
        }
        drop(state);

        if matches!(kind, OutcomeKind::Release { delay: ReleaseDelay::None }) {
            self.shared.published.notify_waiters();
        }

        if unknown.is_empty() {
            Ok(())
        } else {
            Err(BrokerError::Other(format!(
                "unknown lock tokens: {}",
                unknown.join(", ")
            )))
        }
    }
}

impl BrokerClient for InMemoryBroker {
    fn receive_batch<'a>(
        &'a self,
        topic: &'a str,
        subscription: &'a str,
        max_count: usize,
        cancel: &'a CancellationToken,
    ) -> BrokerFuture<'a, Vec<EventBundle>> {
        Box::pin(async move {
            let (fault, receive_wait) = {
                let mut state = self.lock();
                (state.receive_faults.pop_front(), state.receive_wait)
            };
            if let Some(error) = fault {
                tracing::debug!(topic, subscription, error = %error, "Injected receive failure");
                self.record_receive(topic, subscription, max_count, 0);
                return Err(error);
            }

            let deadline = Instant::now() + receive_wait;
            loop {
                let published = self.shared.published.notified();
                let bundles = self.try_lease(topic, subscription, max_count);
                if !bundles.is_empty() || Instant::now() >= deadline {
                    tracing::trace!(topic, subscription, max_count, leased = bundles.len(), "Receive completed");
                    self.record_receive(topic, subscription, max_count, bundles.len());
                    return Ok(bundles);
                }

                tokio::select! {
                    () = cancel.cancelled() => {
                        self.record_receive(topic, subscription, max_count, 0);
                        return Err(BrokerError::Cancelled);
                    },
                    () = published => {},
                    () = tokio::time::sleep_until(deadline) => {},
                }
            }
        })
    }

    fn acknowledge<'a>(
        &'a self,
        topic: &'a str,
        subscription: &'a str,
        lock_tokens: &'a [LockToken],
        cancel: &'a CancellationToken,
    ) -> BrokerFuture<'a, ()> {
        Box::pin(self.settle(topic, subscription, lock_tokens, OutcomeKind::Acknowledge, cancel))
    }

    fn release<'a>(
        &'a self,
        topic: &'a str,
        subscription: &'a str,
        lock_tokens: &'a [LockToken],
        delay: ReleaseDelay,
        cancel: &'a CancellationToken,
    ) -> BrokerFuture<'a, ()> {
        Box::pin(self.settle(
            topic,
            subscription,
            lock_tokens,
            OutcomeKind::Release { delay },
            cancel,
        ))
    }

    fn reject<'a>(
        &'a self,
        topic: &'a str,
        subscription: &'a str,
        lock_tokens: &'a [LockToken],
        cancel: &'a CancellationToken,
    ) -> BrokerFuture<'a, ()> {
        Box::pin(self.settle(topic, subscription, lock_tokens, OutcomeKind::Reject, cancel))
    }
}
