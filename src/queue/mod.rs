//! Rate-limited work queue with per-key deduplication
//!
//! Semantics follow the classic controller work queue:
//! - an item added while the same key is already waiting replaces the waiting
//!   payload instead of queueing twice
//! - a key is handed to at most one worker at a time; re-adds that arrive
//!   while it is being processed are parked until [`WorkQueue::done`]
//! - after [`WorkQueue::shut_down`], adds are ignored and [`WorkQueue::get`]
//!   returns whatever is still queued, then `None`

mod rate_limiter;

pub use rate_limiter::{
    controller_rate_limiter, default_controller_rate_limiter, BackoffConfig, BucketRateLimiter,
    ItemExponentialFailureRateLimiter, MaxOfRateLimiter, RateLimiter, DEFAULT_BUCKET_BURST,
    DEFAULT_BUCKET_QPS,
};

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Items stored in a [`WorkQueue`] expose the key they are deduplicated by
pub trait Keyed {
    /// Dedup and retry key
    type Key: Clone + Debug + Eq + Hash + Send + Sync + 'static;

    /// Key for this item
    fn key(&self) -> Self::Key;
}

struct State<T: Keyed> {
    /// Keys ready to be handed out, in arrival order
    order: VecDeque<T::Key>,
    /// Latest payload per key waiting to be processed
    dirty: HashMap<T::Key, T>,
    /// Keys currently held by a worker
    processing: HashSet<T::Key>,
    shutting_down: bool,
}

struct Inner<T: Keyed> {
    state: Mutex<State<T>>,
    notify: Notify,
    rate_limiter: Box<dyn RateLimiter<T::Key>>,
    delayed: CancellationToken,
}

/// Shared, cloneable handle to a work queue
pub struct WorkQueue<T: Keyed> {
    inner: Arc<Inner<T>>,
}

impl<T: Keyed> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> WorkQueue<T>
where
    T: Keyed + Send + 'static,
{
    /// Create a queue using the given rate limiter for failed items
    pub fn new(rate_limiter: impl RateLimiter<T::Key> + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    order: VecDeque::new(),
                    dirty: HashMap::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                rate_limiter: Box::new(rate_limiter),
                delayed: CancellationToken::new(),
            }),
        }
    }

    /// Create a queue with [`default_controller_rate_limiter`]
    pub fn with_default_rate_limiter() -> Self {
        Self::new(default_controller_rate_limiter())
    }

    /// Enqueue an item, collapsing it into any waiting item with the same key
    pub fn add(&self, item: T) {
        let key = item.key();
        {
            let mut state = self.inner.state.lock();
            if state.shutting_down {
                trace!(?key, "queue shutting down, dropping add");
                return;
            }
            if state.dirty.insert(key.clone(), item).is_some() {
                trace!(?key, "coalesced with waiting item");
                return;
            }
            if state.processing.contains(&key) {
                return;
            }
            state.order.push_back(key);
        }
        self.inner.notify.notify_one();
    }

    /// Wait for the next item.
    ///
    /// Returns `None` once the queue is shut down and nothing is left to hand
    /// out. The caller must pass the item to [`WorkQueue::done`] when finished.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                while let Some(key) = state.order.pop_front() {
                    if let Some(item) = state.dirty.remove(&key) {
                        state.processing.insert(key);
                        return Some(item);
                    }
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Mark an item's key as no longer being processed
    pub fn done(&self, item: &T) {
        let key = item.key();
        let requeued = {
            let mut state = self.inner.state.lock();
            state.processing.remove(&key);
            if state.dirty.contains_key(&key) {
                state.order.push_back(key);
                true
            } else {
                false
            }
        };
        if requeued {
            self.inner.notify.notify_one();
        }
    }

    /// Add the item after `delay`. Pending delayed adds are dropped on shutdown.
    pub fn add_after(&self, item: T, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }

        let queue = self.clone();
        let cancelled = self.inner.delayed.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(delay) => queue.add(item),
            }
        });
    }

    /// Add the item after the rate limiter's delay for its key
    pub fn add_rate_limited(&self, item: T) {
        let delay = self.inner.rate_limiter.when(&item.key());
        self.add_after(item, delay);
    }

    /// Stop tracking failures for the item's key
    pub fn forget(&self, item: &T) {
        self.inner.rate_limiter.forget(&item.key());
    }

    /// Number of times the item's key has been rate-limited since last forgotten
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.inner.rate_limiter.num_requeues(&item.key())
    }

    /// Stop accepting work and wake every waiting worker
    pub fn shut_down(&self) {
        self.inner.state.lock().shutting_down = true;
        self.inner.delayed.cancel();
        self.inner.notify.notify_waiters();
    }

    /// Whether [`WorkQueue::shut_down`] has been called
    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }

    /// Number of keys waiting to be handed out
    pub fn len(&self) -> usize {
        self.inner.state.lock().order.len()
    }

    /// Returns true when no keys are waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
