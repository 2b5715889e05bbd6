//! Outcome queues between the completion loop and the drain loops.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Unbounded single-consumer queue drained in snapshots.
///
/// [`next_batch`](Self::next_batch) waits until the queue is non-empty, then
/// takes exactly the items present at that instant. Anything pushed while the
/// consumer is processing a batch goes into the next one, so a steady producer
/// can never keep a drain iteration from finishing.
pub struct OutcomeQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
}

impl<T> OutcomeQueue<T> {
    /// Create an empty, open queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an item.
    ///
    /// # Errors
    ///
    /// Hands the item back if the queue has been closed.
    pub fn push(&self, item: T) -> Result<(), T> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(item);
            }
            state.items.push_back(item);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Wait for items and take every item queued at this moment.
    ///
    /// Returns `None` once the queue is closed and empty.
    pub async fn next_batch(&self) -> Option<Vec<T>> {
        loop {
            {
                let mut state = self.lock();
                if !state.items.is_empty() {
                    let depth = state.items.len();
                    return Some(state.items.drain(..depth).collect());
                }
                if state.closed {
                    return None;
                }
            }
            // A push between the check and this await leaves a permit behind,
            // so the wakeup is not lost.
            self.notify.notified().await;
        }
    }

    /// Stop accepting items. Items already queued can still be taken.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    /// Number of queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }
}

impl<T> Default for OutcomeQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for OutcomeQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("OutcomeQueue")
            .field("len", &state.items.len())
            .field("closed", &state.closed)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn batch_is_a_snapshot_of_current_depth() {
        let queue = Arc::new(OutcomeQueue::new());
        for n in 0..3 {
            queue.push(n).unwrap();
        }

        let first = queue.next_batch().await.unwrap();
        // Arrives while the first batch is being "settled".
        queue.push(3).unwrap();
        queue.push(4).unwrap();
        assert_eq!(first, vec![0, 1, 2]);

        assert_eq!(queue.next_batch().await.unwrap(), vec![3, 4]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn consumer_wakes_on_push() {
        let queue = Arc::new(OutcomeQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.next_batch().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push("ack").unwrap();

        let batch = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch, Some(vec!["ack"]));
    }

    #[tokio::test]
    async fn close_flushes_then_ends() {
        let queue = OutcomeQueue::new();
        queue.push(1).unwrap();
        queue.close();

        assert_eq!(queue.push(2), Err(2));
        assert_eq!(queue.next_batch().await, Some(vec![1]));
        assert_eq!(queue.next_batch().await, None);
    }

    #[tokio::test]
    async fn close_wakes_an_idle_consumer() {
        let queue = Arc::new(OutcomeQueue::<u8>::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.next_batch().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();

        let batch = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert!(batch.is_none());
    }
}
