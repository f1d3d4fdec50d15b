//! Keyed work queue for reconciliation workers.
//!
//! Semantics:
//! - `add` is idempotent while a key is waiting to be processed
//! - A key handed out by `get` is not handed out again until `done` is called;
//!   adds that arrive in the meantime are replayed on `done`
//! - `add_after` keeps only the earliest pending deadline per key

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

#[derive(Debug)]
struct State<K> {
    /// Keys ready to be handed out, in FIFO order.
    queue: VecDeque<K>,

    /// Keys that need processing (queued, or re-added while processing).
    dirty: HashSet<K>,

    /// Keys currently held by a worker.
    processing: HashSet<K>,

    /// Pending delayed adds: key -> deadline.
    waiting: HashMap<K, Instant>,

    shutting_down: bool,
}

#[derive(Debug)]
struct Inner<K> {
    state: Mutex<State<K>>,
    notify: Notify,
}

/// De-duplicating, delay-aware work queue.
///
/// Cloning the queue yields another handle to the same queue.
#[derive(Debug)]
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> Default for WorkQueue<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> WorkQueue<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    waiting: HashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State<K>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark `key` as needing processing.
    pub fn add(&self, key: K) {
        let mut state = self.state();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }

        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            // Replayed by `done`.
            return;
        }

        state.queue.push_back(key);
        drop(state);
        self.inner.notify.notify_waiters();
    }

    /// Add `key` once `delay` has elapsed.
    ///
    /// Must be called from within a tokio runtime.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }

        let deadline = Instant::now() + delay;
        {
            let mut state = self.state();
            if state.shutting_down {
                return;
            }
            if state
                .waiting
                .get(&key)
                .is_some_and(|existing| *existing <= deadline)
            {
                return;
            }
            state.waiting.insert(key.clone(), deadline);
        }

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            queue.fire(key, deadline);
        });
    }

    /// Move a delayed key into the queue if its deadline is still current.
    fn fire(&self, key: K, deadline: Instant) {
        {
            let mut state = self.state();
            if state.waiting.get(&key) != Some(&deadline) {
                // Superseded by an earlier deadline.
                return;
            }
            state.waiting.remove(&key);
        }
        trace!("Delayed key is due");
        self.add(key);
    }

    /// Wait for the next key to process.
    ///
    /// Returns `None` once the queue has been shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            // Registered before checking the state so a concurrent `add`
            // cannot slip between the check and the wait.
            let notified = self.inner.notify.notified();
            {
                let mut state = self.state();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Release a key handed out by `get`.
    pub fn done(&self, key: &K) {
        let mut state = self.state();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.inner.notify.notify_waiters();
        }
    }

    /// Number of keys ready to be handed out.
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    /// Returns true if no key is ready to be handed out.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if `key` has a delayed add pending.
    pub fn is_waiting(&self, key: &K) -> bool {
        self.state().waiting.contains_key(key)
    }

    /// Stop handing out keys and wake every waiting worker.
    pub fn shutdown(&self) {
        self.state().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    /// Returns true once `shutdown` has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_deduplicates() {
        let queue = WorkQueue::new();
        queue.add("mvm-1");
        queue.add("mvm-1");
        queue.add("mvm-2");

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get().await, Some("mvm-1"));
        assert_eq!(queue.get().await, Some("mvm-2"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_key_not_handed_out_twice_while_processing() {
        let queue = WorkQueue::new();
        queue.add("mvm-1");

        let key = queue.get().await.unwrap();
        queue.add("mvm-1");

        // Re-added while processing: parked until done.
        assert!(queue.is_empty());

        queue.done(&key);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some("mvm-1"));
    }

    #[tokio::test]
    async fn test_done_without_readd_drops_key() {
        let queue = WorkQueue::new();
        queue.add("mvm-1");

        let key = queue.get().await.unwrap();
        queue.done(&key);

        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_get_wakes_on_add() {
        let queue = WorkQueue::new();
        let worker = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };

        tokio::task::yield_now().await;
        queue.add("mvm-1");

        assert_eq!(worker.await.unwrap(), Some("mvm-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after_waits_for_deadline() {
        let queue = WorkQueue::new();
        queue.add_after("mvm-1", Duration::from_secs(30));

        assert!(queue.is_waiting(&"mvm-1"));
        assert!(queue.is_empty());

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(queue.is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(queue.len(), 1);
        assert!(!queue.is_waiting(&"mvm-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after_keeps_earliest_deadline() {
        let queue = WorkQueue::new();
        queue.add_after("mvm-1", Duration::from_secs(30));
        queue.add_after("mvm-1", Duration::from_secs(5));
        queue.add_after("mvm-1", Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(queue.get().await, Some("mvm-1"));
        queue.done(&"mvm-1");

        // The superseded 30s timer must not re-add the key.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_releases_workers() {
        let queue: WorkQueue<&str> = WorkQueue::new();
        let worker = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };

        tokio::task::yield_now().await;
        queue.shutdown();

        assert_eq!(worker.await.unwrap(), None);
        assert!(queue.is_shutting_down());

        queue.add("mvm-1");
        assert!(queue.is_empty());
    }
}
