//! Rate limiters deciding how long a failed item waits before it is re-queued.
//!
//! The default controller limiter combines two policies and takes the larger
//! delay of the two:
//! - per-item exponential backoff, so a single failing key backs off quickly
//! - an overall token bucket, so a burst of failures across many keys cannot
//!   hammer the API server

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Decides requeue delays and tracks per-key failure counts
pub trait RateLimiter<K>: Send + Sync {
    /// Delay before `key` may be processed again. Records one failure.
    fn when(&self, key: &K) -> Duration;

    /// Clear all bookkeeping for `key`
    fn forget(&self, key: &K);

    /// Number of failures recorded for `key` since it was last forgotten
    fn num_requeues(&self, key: &K) -> u32;
}

/// Backoff parameters for [`ItemExponentialFailureRateLimiter`]
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Multiplier applied per additional failure
    pub backoff_multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
            backoff_multiplier: 2.0,
        }
    }
}

/// Exponential backoff per key: `initial_delay * multiplier^failures`, capped
pub struct ItemExponentialFailureRateLimiter<K> {
    config: BackoffConfig,
    failures: Mutex<HashMap<K, u32>>,
}

impl<K: Eq + Hash> ItemExponentialFailureRateLimiter<K> {
    /// Create a limiter with the given backoff parameters
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone + Send> RateLimiter<K> for ItemExponentialFailureRateLimiter<K> {
    fn when(&self, key: &K) -> Duration {
        let exp = {
            let mut failures = self.failures.lock();
            let count = failures.entry(key.clone()).or_insert(0);
            let exp = *count;
            *count = count.saturating_add(1);
            exp
        };

        let exp = i32::try_from(exp).unwrap_or(i32::MAX);
        let delay = self.config.initial_delay.as_secs_f64() * self.config.backoff_multiplier.powi(exp);
        if !delay.is_finite() || delay >= self.config.max_delay.as_secs_f64() {
            return self.config.max_delay;
        }
        Duration::from_secs_f64(delay)
    }

    fn forget(&self, key: &K) {
        self.failures.lock().remove(key);
    }

    fn num_requeues(&self, key: &K) -> u32 {
        self.failures.lock().get(key).copied().unwrap_or(0)
    }
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Overall token bucket shared by all keys. Does not track failures.
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    /// Bucket refilling at `qps` tokens per second, holding at most `burst`
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst);
        Self {
            qps,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last: Instant::now(),
            }),
        }
    }
}

impl<K> RateLimiter<K> for BucketRateLimiter {
    fn when(&self, _key: &K) -> Duration {
        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
        bucket.last = now;

        // Reserve a token; a negative balance is the wait for that reservation
        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 || self.qps <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / self.qps)
        }
    }

    fn forget(&self, _key: &K) {}

    fn num_requeues(&self, _key: &K) -> u32 {
        0
    }
}

/// Combines limiters, returning the longest delay and the highest count
pub struct MaxOfRateLimiter<K> {
    limiters: Vec<Box<dyn RateLimiter<K>>>,
}

impl<K> MaxOfRateLimiter<K> {
    /// Combine the given limiters
    pub fn new(limiters: Vec<Box<dyn RateLimiter<K>>>) -> Self {
        Self { limiters }
    }
}

impl<K> RateLimiter<K> for MaxOfRateLimiter<K> {
    fn when(&self, key: &K) -> Duration {
        self.limiters
            .iter()
            .map(|l| l.when(key))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&self, key: &K) {
        for limiter in &self.limiters {
            limiter.forget(key);
        }
    }

    fn num_requeues(&self, key: &K) -> u32 {
        self.limiters
            .iter()
            .map(|l| l.num_requeues(key))
            .max()
            .unwrap_or(0)
    }
}

/// Refill rate of the overall bucket in the default limiter
pub const DEFAULT_BUCKET_QPS: f64 = 10.0;

/// Capacity of the overall bucket in the default limiter
pub const DEFAULT_BUCKET_BURST: u32 = 100;

/// Per-item exponential backoff combined with an overall token bucket
pub fn controller_rate_limiter<K>(backoff: BackoffConfig, qps: f64, burst: u32) -> MaxOfRateLimiter<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialFailureRateLimiter::new(backoff)),
        Box::new(BucketRateLimiter::new(qps, burst)),
    ])
}

/// Per-item exponential backoff (5ms to 1000s) combined with a 10 qps, burst
/// 100 token bucket
pub fn default_controller_rate_limiter<K>() -> MaxOfRateLimiter<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    controller_rate_limiter(BackoffConfig::default(), DEFAULT_BUCKET_QPS, DEFAULT_BUCKET_BURST)
}
