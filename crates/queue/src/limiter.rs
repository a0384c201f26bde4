//! Retry delay policies for [`crate::WorkQueue::add_rate_limited`].

#![forbid(unsafe_code)]

use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;

/// Decides how long a key waits before it is re-queued.
pub trait RateLimiter<K>: Send + Sync {
    /// Delay for the next retry of `item`; records the attempt.
    fn when(&self, item: &K) -> Duration;
    /// Failures recorded for `item` since the last [`RateLimiter::forget`].
    fn num_requeues(&self, item: &K) -> u32;
    /// Stop tracking `item`.
    fn forget(&self, item: &K);
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`.
pub struct ItemExponentialLimiter<K> {
    base: Duration,
    max: Duration,
    failures: Mutex<FxHashMap<K, u32>>,
}

impl<K: Eq + Hash + Clone> ItemExponentialLimiter<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, failures: Mutex::new(FxHashMap::default()) }
    }

    fn delay_for(&self, exp: u32) -> Duration {
        2u32.checked_pow(exp)
            .and_then(|factor| self.base.checked_mul(factor))
            .map(|d| d.min(self.max))
            .unwrap_or(self.max)
    }
}

impl<K: Eq + Hash + Clone + Send> RateLimiter<K> for ItemExponentialLimiter<K> {
    fn when(&self, item: &K) -> Duration {
        let exp = {
            let mut failures = lock(&self.failures);
            let n = failures.entry(item.clone()).or_insert(0);
            let exp = *n;
            *n = n.saturating_add(1);
            exp
        };
        self.delay_for(exp)
    }

    fn num_requeues(&self, item: &K) -> u32 {
        lock(&self.failures).get(item).copied().unwrap_or(0)
    }

    fn forget(&self, item: &K) {
        lock(&self.failures).remove(item);
    }
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Overall token bucket shared by every key. Reservation style: a caller that
/// finds the bucket empty is told how long until its token exists.
pub struct BucketLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self { qps: qps.max(f64::MIN_POSITIVE), burst, bucket: Mutex::new(Bucket { tokens: burst, last: Instant::now() }) }
    }

    fn reserve(&self) -> Duration {
        let mut b = lock(&self.bucket);
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(b.last).as_secs_f64();
        b.last = now;
        b.tokens = (b.tokens + elapsed * self.qps).min(self.burst) - 1.0;
        if b.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-b.tokens / self.qps)
        }
    }
}

impl<K> RateLimiter<K> for BucketLimiter {
    fn when(&self, _item: &K) -> Duration {
        self.reserve()
    }

    fn num_requeues(&self, _item: &K) -> u32 {
        0
    }

    fn forget(&self, _item: &K) {}
}

/// Worst case of several limiters.
pub struct MaxOfLimiter<K> {
    limiters: Vec<Box<dyn RateLimiter<K>>>,
}

impl<K> MaxOfLimiter<K> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<K>>>) -> Self {
        Self { limiters }
    }
}

impl<K> RateLimiter<K> for MaxOfLimiter<K> {
    fn when(&self, item: &K) -> Duration {
        // Every child must see the attempt, so no short-circuiting.
        self.limiters.iter().map(|l| l.when(item)).fold(Duration::ZERO, Duration::max)
    }

    fn num_requeues(&self, item: &K) -> u32 {
        self.limiters.iter().map(|l| l.num_requeues(item)).max().unwrap_or(0)
    }

    fn forget(&self, item: &K) {
        for l in &self.limiters {
            l.forget(item);
        }
    }
}

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);
pub const DEFAULT_QPS: f64 = 10.0;
pub const DEFAULT_BURST: u32 = 100;

/// Per-key exponential backoff combined with an overall 10 qps / 100 burst bucket.
pub fn default_controller_limiter<K>() -> MaxOfLimiter<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    controller_limiter(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY, DEFAULT_QPS, DEFAULT_BURST)
}

pub fn controller_limiter<K>(base: Duration, max: Duration, qps: f64, burst: u32) -> MaxOfLimiter<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    MaxOfLimiter::new(vec![
        Box::new(ItemExponentialLimiter::new(base, max)),
        Box::new(BucketLimiter::new(qps, burst)),
    ])
}
