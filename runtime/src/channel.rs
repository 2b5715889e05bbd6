//! Bounded completion multiplexer.
//!
//! [`TaskBoundedChannel`] admits at most `capacity` concurrently running
//! operations and yields each operation's output as soon as it finishes,
//! independent of the order in which the operations were submitted.
//!
//! Two independent pieces of state make this work:
//!
//! - an in-flight set guarded by one mutex, touched only at admission and at
//!   completion, plus a `watch` generation counter bumped whenever a full
//!   channel frees a slot. Waiters subscribe to the counter while holding the
//!   lock, so they can only observe releases that happen after their check;
//! - an unbounded output queue. A slow reader never blocks admission beyond
//!   the capacity check.
//!
//! Operations run as tokio tasks on the shared worker pool. The slot is freed
//! by a drop guard, so an operation that panics still returns its slot (its
//! output is lost; callers that need an output for every operation catch
//! panics inside the operation).
//!
//! # Example
//!
//! ```
//! use event_puller_runtime::channel::TaskBoundedChannel;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), event_puller_runtime::RuntimeError> {
//! let channel = TaskBoundedChannel::new(2)?;
//! channel.submit(async { 1 }).await?;
//! channel.submit(async { 2 }).await?;
//! channel.close();
//!
//! let mut total = 0;
//! while let Some(value) = channel.next().await {
//!     total += value;
//! }
//! assert_eq!(total, 3);
//! # Ok(())
//! # }
//! ```

use crate::error::RuntimeError;
use async_stream::stream;
use futures::Stream;
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};

struct Slots<T> {
    in_flight: HashSet<u64>,
    next_id: u64,
    /// `None` once closed.
    output: Option<mpsc::UnboundedSender<T>>,
}

struct Shared<T> {
    capacity: usize,
    slots: Mutex<Slots<T>>,
    released: watch::Sender<u64>,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Slots<T>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Must be called with the slot lock held.
    fn signal_release(&self) {
        self.released.send_modify(|generation| *generation = generation.wrapping_add(1));
    }
}

/// Frees an in-flight slot when dropped.
struct SlotGuard<T> {
    shared: Arc<Shared<T>>,
    id: u64,
}

impl<T> Drop for SlotGuard<T> {
    fn drop(&mut self) {
        let mut slots = self.shared.lock();
        let was_full = slots.in_flight.len() >= self.shared.capacity;
        slots.in_flight.remove(&self.id);
        if was_full {
            self.shared.signal_release();
        }
    }
}

/// Runs at most `capacity` operations at once and yields their outputs in
/// completion order.
///
/// Writers ([`submit`](Self::submit), [`try_admit`](Self::try_admit)) and the
/// reader ([`next`](Self::next), [`drain`](Self::drain)) may live on different
/// tasks; share the channel behind an `Arc`.
pub struct TaskBoundedChannel<T> {
    shared: Arc<Shared<T>>,
    output: tokio::sync::Mutex<mpsc::UnboundedReceiver<T>>,
}

impl<T: Send + 'static> TaskBoundedChannel<T> {
    /// Create a channel admitting up to `capacity` concurrent operations.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Config`] if `capacity` is zero.
    pub fn new(capacity: usize) -> Result<Self, RuntimeError> {
        if capacity == 0 {
            return Err(RuntimeError::Config(
                "channel capacity must be at least 1".to_string(),
            ));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let (released, _) = watch::channel(0);

        Ok(Self {
            shared: Arc::new(Shared {
                capacity,
                slots: Mutex::new(Slots {
                    in_flight: HashSet::with_capacity(capacity),
                    next_id: 0,
                    output: Some(sender),
                }),
                released,
            }),
            output: tokio::sync::Mutex::new(receiver),
        })
    }

    /// Admit `op`, waiting cooperatively for a free slot if the channel is full.
    ///
    /// Returns as soon as the operation has been started; its output is
    /// delivered through [`next`](Self::next).
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Closed`] if the channel is closed before the
    /// operation could be admitted. The operation is dropped without running.
    pub async fn submit<F>(&self, op: F) -> Result<(), RuntimeError>
    where
        F: Future<Output = T> + Send + 'static,
    {
        loop {
            let mut released = {
                let mut slots = self.shared.lock();
                let Some(sender) = slots.output.clone() else {
                    return Err(RuntimeError::Closed);
                };
                if slots.in_flight.len() < self.shared.capacity {
                    self.admit_locked(&mut slots, sender, op);
                    return Ok(());
                }
                self.shared.released.subscribe()
            };

            // The sender lives as long as `shared`, so this only fails if the
            // channel itself is gone.
            if released.changed().await.is_err() {
                return Err(RuntimeError::Closed);
            }
        }
    }

    /// Admit `op` if a slot is free, without waiting.
    ///
    /// # Errors
    ///
    /// Hands the operation back unchanged if the channel is full or closed.
    pub fn try_admit<F>(&self, op: F) -> Result<(), F>
    where
        F: Future<Output = T> + Send + 'static,
    {
        let mut slots = self.shared.lock();
        match slots.output.clone() {
            Some(sender) if slots.in_flight.len() < self.shared.capacity => {
                self.admit_locked(&mut slots, sender, op);
                Ok(())
            },
            _ => Err(op),
        }
    }

    /// Resolve once at least one slot is free, without admitting anything.
    ///
    /// Also resolves when the channel is closed, so a waiting feeder can
    /// observe the shutdown.
    pub async fn wait_for_capacity(&self) {
        loop {
            let mut released = {
                let slots = self.shared.lock();
                if slots.output.is_none() || slots.in_flight.len() < self.shared.capacity {
                    return;
                }
                self.shared.released.subscribe()
            };

            if released.changed().await.is_err() {
                return;
            }
        }
    }

    /// Next completed output, in completion order.
    ///
    /// Returns `None` once the channel is closed, every admitted operation
    /// has finished, and every output has been read.
    pub async fn next(&self) -> Option<T> {
        self.output.lock().await.recv().await
    }

    /// All outputs as a stream, in completion order.
    ///
    /// The stream ends under the same condition as [`next`](Self::next).
    pub fn drain(&self) -> impl Stream<Item = T> + '_ {
        stream! {
            while let Some(output) = self.next().await {
                yield output;
            }
        }
    }

    /// Number of operations currently running.
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.shared.lock().in_flight.len()
    }

    /// Maximum number of concurrently running operations.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Stop admitting operations.
    ///
    /// Operations already admitted keep running and their outputs can still
    /// be read; the reader then observes end-of-stream. Idempotent.
    pub fn close(&self) {
        let mut slots = self.shared.lock();
        if slots.output.take().is_some() {
            self.shared.signal_release();
            tracing::trace!(
                in_flight = slots.in_flight.len(),
                "Task channel closed"
            );
        }
    }

    /// Returns true once [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.lock().output.is_none()
    }

    fn admit_locked<F>(
        &self,
        slots: &mut Slots<T>,
        sender: mpsc::UnboundedSender<T>,
        op: F,
    ) where
        F: Future<Output = T> + Send + 'static,
    {
        let id = slots.next_id;
        slots.next_id = slots.next_id.wrapping_add(1);
        slots.in_flight.insert(id);

        let guard = SlotGuard {
            shared: Arc::clone(&self.shared),
            id,
        };

        tokio::spawn(async move {
            let output = op.await;
            drop(guard);
            // The receiver lives as long as the channel; a send error only
            // means nobody will read this output any more.
            let _ = sender.send(output);
        });
    }
}

impl<T> std::fmt::Debug for TaskBoundedChannel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slots = self.shared.lock();
        f.debug_struct("TaskBoundedChannel")
            .field("capacity", &self.shared.capacity)
            .field("in_flight", &slots.in_flight.len())
            .field("closed", &slots.output.is_none())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn channel_should_fail() -> bool {
        true
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(
            TaskBoundedChannel::<()>::new(0),
            Err(RuntimeError::Config(_))
        ));
    }

    #[tokio::test]
    async fn try_admit_hands_back_operation_when_full() {
        let channel = TaskBoundedChannel::new(1).unwrap();
        let (release, gate) = oneshot::channel::<()>();

        assert!(channel
            .try_admit(async move {
                let _ = gate.await;
                1
            })
            .is_ok());
        assert_eq!(channel.in_flight_count(), 1);

        let rejected = channel.try_admit(async { 2 });
        assert!(rejected.is_err());

        release.send(()).unwrap();
        assert_eq!(channel.next().await, Some(1));

        // The slot is free again once the output has been produced.
        tokio::time::timeout(Duration::from_secs(1), channel.wait_for_capacity())
            .await
            .unwrap();
        let handed_back = rejected.err().unwrap();
        assert!(channel.try_admit(handed_back).is_ok());
        assert_eq!(channel.next().await, Some(2));
    }

    #[tokio::test]
    async fn outputs_arrive_in_completion_order() {
        let channel = TaskBoundedChannel::new(3).unwrap();
        let mut gates = Vec::new();
        for value in ["a", "b", "c"] {
            let (tx, rx) = oneshot::channel::<()>();
            gates.push(tx);
            channel
                .submit(async move {
                    let _ = rx.await;
                    value
                })
                .await
                .unwrap();
        }

        // Finish in the order c, a, b.
        let mut gates = gates.into_iter().map(Some).collect::<Vec<_>>();
        for index in [2, 0, 1] {
            gates[index].take().unwrap().send(()).unwrap();
            let expected = ["a", "b", "c"][index];
            assert_eq!(channel.next().await, Some(expected));
        }
    }

    #[tokio::test]
    async fn submit_waits_for_a_free_slot() {
        let channel = Arc::new(TaskBoundedChannel::new(1).unwrap());
        let (release, gate) = oneshot::channel::<()>();
        channel
            .submit(async move {
                let _ = gate.await;
                "first"
            })
            .await
            .unwrap();

        let submitter = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { channel.submit(async { "second" }).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!submitter.is_finished());

        release.send(()).unwrap();
        submitter.await.unwrap().unwrap();
        assert_eq!(channel.next().await, Some("first"));
        assert_eq!(channel.next().await, Some("second"));
    }

    #[tokio::test]
    async fn capacity_waiter_is_woken_when_a_slot_frees() {
        let channel = TaskBoundedChannel::new(1).unwrap();
        let (release, gate) = oneshot::channel::<()>();
        channel
            .submit(async move {
                let _ = gate.await;
            })
            .await
            .unwrap();

        let mut waiter = tokio_test::task::spawn(channel.wait_for_capacity());
        tokio_test::assert_pending!(waiter.poll());

        release.send(()).unwrap();
        assert_eq!(channel.next().await, Some(()));
        assert!(waiter.is_woken());
        tokio_test::assert_ready!(waiter.poll());
    }

    #[tokio::test]
    async fn wait_for_capacity_ignores_earlier_releases() {
        let channel = TaskBoundedChannel::new(1).unwrap();
        let (release_first, gate) = oneshot::channel::<()>();
        channel
            .submit(async move {
                let _ = gate.await;
                "first"
            })
            .await
            .unwrap();
        release_first.send(()).unwrap();
        assert_eq!(channel.next().await, Some("first"));

        let (release_second, gate) = oneshot::channel::<()>();
        channel
            .submit(async move {
                let _ = gate.await;
                "second"
            })
            .await
            .unwrap();

        // The slot freed by "first" is taken again, so the waiter must park.
        let mut waiter = tokio_test::task::spawn(channel.wait_for_capacity());
        tokio_test::assert_pending!(waiter.poll());
        assert!(!waiter.is_woken());

        release_second.send(()).unwrap();
        assert_eq!(channel.next().await, Some("second"));
        assert!(waiter.is_woken());
        tokio_test::assert_ready!(waiter.poll());
    }

    #[tokio::test]
    async fn unread_outputs_do_not_block_submit() {
        let channel = TaskBoundedChannel::new(1).unwrap();
        for value in 0..20_usize {
            tokio::time::timeout(Duration::from_secs(1), channel.submit(async move { value }))
                .await
                .unwrap()
                .unwrap();
        }
        channel.close();

        let outputs: Vec<usize> = channel.drain().collect().await;
        assert_eq!(outputs.len(), 20);
    }

    #[tokio::test]
    async fn panicking_operation_frees_its_slot() {
        let channel = TaskBoundedChannel::new(1).unwrap();
        channel
            .submit(async {
                if channel_should_fail() {
                    panic!("operation failed");
                }
                0
            })
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), channel.submit(async { 7 }))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(channel.next().await, Some(7));
    }

    #[tokio::test]
    async fn close_ends_the_stream_after_in_flight_work() {
        let channel = TaskBoundedChannel::new(4).unwrap();
        for value in 0..4_u32 {
            channel
                .submit(async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    value
                })
                .await
                .unwrap();
        }
        channel.close();
        assert!(channel.is_closed());
        assert!(matches!(
            channel.submit(async { 99 }).await,
            Err(RuntimeError::Closed)
        ));

        let mut values: Vec<u32> = channel.drain().collect().await;
        values.sort_unstable();
        assert_eq!(values, vec![0, 1, 2, 3]);
        assert_eq!(channel.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn close_wakes_capacity_waiters() {
        let channel = Arc::new(TaskBoundedChannel::new(1).unwrap());
        let (_hold, gate) = oneshot::channel::<()>();
        channel
            .submit(async move {
                let _ = gate.await;
            })
            .await
            .unwrap();

        let waiter = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { channel.wait_for_capacity().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        channel.close();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn occupancy_never_exceeds_capacity_under_load() {
        let channel = Arc::new(TaskBoundedChannel::new(5).unwrap());
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let reader = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { channel.drain().count().await })
        };

        for _ in 0..200 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            channel
                .submit(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .await
                .unwrap();
            assert!(channel.in_flight_count() <= channel.capacity());
        }
        channel.close();

        assert_eq!(reader.await.unwrap(), 200);
        assert!(peak.load(Ordering::SeqCst) <= 5);
    }
}
