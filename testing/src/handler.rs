//! Recording event handler.

#![allow(clippy::missing_panics_doc)]

use event_puller_core::{CancellationToken, DispatchError, EventHandler, HandlerFuture};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Semaphore;

/// What a [`RecordingHandler`] does after recording an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerBehavior {
    /// Return `Ok(())`.
    Succeed,
    /// Return a transient error with this message (the event is released).
    Fail(String),
    /// Return [`DispatchError::Rejected`] with this reason (the event is rejected).
    Reject(String),
    /// Panic with this message.
    Panic(String),
}

#[derive(Debug)]
struct Recorded<E> {
    events: Mutex<Vec<E>>,
    behavior: Mutex<HandlerBehavior>,
    running: AtomicUsize,
    peak: AtomicUsize,
    gate: Option<Arc<Semaphore>>,
    latency: Duration,
}

/// Handler that records every event it sees.
///
/// Clones share the recording, so keep one clone for assertions and hand the
/// other to the pipeline. Optionally each invocation waits for a permit from a
/// gate semaphore before completing, which lets tests hold events in flight.
#[derive(Debug)]
pub struct RecordingHandler<E> {
    recorded: Arc<Recorded<E>>,
}

impl<E> Clone for RecordingHandler<E> {
    fn clone(&self) -> Self {
        Self {
            recorded: Arc::clone(&self.recorded),
        }
    }
}

impl<E> Default for RecordingHandler<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> RecordingHandler<E> {
    fn build(gate: Option<Arc<Semaphore>>, latency: Duration) -> Self {
        Self {
            recorded: Arc::new(Recorded {
                events: Mutex::new(Vec::new()),
                behavior: Mutex::new(HandlerBehavior::Succeed),
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                gate,
                latency,
            }),
        }
    }

    /// A handler that succeeds immediately.
    #[must_use]
    pub fn new() -> Self {
        Self::build(None, Duration::ZERO)
    }

    /// A handler whose invocations each need a permit from `gate` to finish.
    #[must_use]
    pub fn gated(gate: Arc<Semaphore>) -> Self {
        Self::build(Some(gate), Duration::ZERO)
    }

    /// A handler that takes `latency` per event.
    #[must_use]
    pub fn with_latency(latency: Duration) -> Self {
        Self::build(None, latency)
    }

    /// Change what subsequent invocations do.
    pub fn set_behavior(&self, behavior: HandlerBehavior) {
        *lock(&self.recorded.behavior) = behavior;
    }

    /// Number of events recorded so far.
    #[must_use]
    pub fn count(&self) -> usize {
        lock(&self.recorded.events).len()
    }

    /// Highest number of simultaneously running invocations seen.
    #[must_use]
    pub fn peak_concurrency(&self) -> usize {
        self.recorded.peak.load(Ordering::SeqCst)
    }

    /// Number of invocations currently running.
    #[must_use]
    pub fn running(&self) -> usize {
        self.recorded.running.load(Ordering::SeqCst)
    }
}

impl<E: Clone> RecordingHandler<E> {
    /// Recorded events, in invocation order.
    #[must_use]
    pub fn events(&self) -> Vec<E> {
        lock(&self.recorded.events).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct RunningGuard<'a>(&'a AtomicUsize);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<E> EventHandler<E> for RecordingHandler<E>
where
    E: Send + 'static,
{
    fn handle<'a>(&'a self, event: E, _cancel: &'a CancellationToken) -> HandlerFuture<'a> {
        Box::pin(async move {
            let recorded = &self.recorded;
            let now = recorded.running.fetch_add(1, Ordering::SeqCst) + 1;
            let _running = RunningGuard(&recorded.running);
            recorded.peak.fetch_max(now, Ordering::SeqCst);

            lock(&recorded.events).push(event);
            let behavior = lock(&recorded.behavior).clone();

            if let Some(gate) = &recorded.gate {
                gate.acquire().await?.forget();
            }
            if !recorded.latency.is_zero() {
                tokio::time::sleep(recorded.latency).await;
            }

            match behavior {
                HandlerBehavior::Succeed => Ok(()),
                HandlerBehavior::Fail(message) => Err(anyhow::anyhow!(message)),
                HandlerBehavior::Reject(reason) => {
                    Err(DispatchError::rejected("recording-handler", reason).into())
                },
                // The caller asked for a panic.
                #[allow(clippy::panic)]
                HandlerBehavior::Panic(message) => panic!("{message}"),
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_and_shares_between_clones() {
        let handler = RecordingHandler::<u32>::new();
        let clone = handler.clone();
        let cancel = CancellationToken::new();

        clone.handle(1, &cancel).await.unwrap();
        clone.handle(2, &cancel).await.unwrap();
        assert_eq!(handler.events(), vec![1, 2]);
        assert_eq!(handler.running(), 0);
    }

    #[tokio::test]
    async fn behaviors_map_to_errors() {
        let handler = RecordingHandler::<u32>::new();
        let cancel = CancellationToken::new();

        handler.set_behavior(HandlerBehavior::Fail("db down".into()));
        let err = handler.handle(1, &cancel).await.unwrap_err();
        assert_eq!(err.to_string(), "db down");

        handler.set_behavior(HandlerBehavior::Reject("poison".into()));
        let err = handler.handle(2, &cancel).await.unwrap_err();
        assert!(err.downcast_ref::<DispatchError>().is_some_and(DispatchError::is_permanent));
    }

    #[tokio::test]
    async fn panic_behavior_panics_the_invocation() {
        let handler = RecordingHandler::<u32>::new();
        handler.set_behavior(HandlerBehavior::Panic("boom".into()));

        let task = {
            let handler = handler.clone();
            tokio::spawn(async move { handler.handle(3, &CancellationToken::new()).await })
        };
        let error = task.await.unwrap_err();
        assert!(error.is_panic());
        assert_eq!(handler.events(), vec![3]);
        assert_eq!(handler.running(), 0);
    }

    #[tokio::test]
    async fn gate_holds_invocations() {
        let gate = Arc::new(Semaphore::new(0));
        let handler = RecordingHandler::<u32>::gated(Arc::clone(&gate));

        let task = {
            let handler = handler.clone();
            tokio::spawn(async move { handler.handle(7, &CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(handler.running(), 1);
        assert!(!task.is_finished());

        gate.add_permits(1);
        task.await.unwrap().unwrap();
        assert_eq!(handler.peak_concurrency(), 1);
    }
}
