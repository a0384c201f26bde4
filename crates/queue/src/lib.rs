//! autolabel queue: deduplicating, rate-limited work queue shared by controller workers.
//!
//! A key moves through three places: *queued* (waiting for a worker), *processing*
//! (handed out by [`WorkQueue::get`] and not yet [`WorkQueue::done`]), and *delayed*
//! (scheduled by [`WorkQueue::add_after`]). A key is never queued twice and never
//! handed to two workers at once; re-adding a key that is processing parks it until
//! `done`, after which it is queued exactly once.

#![forbid(unsafe_code)]

pub mod limiter;

use std::collections::{BTreeMap, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

pub use limiter::{
    controller_limiter, default_controller_limiter, BucketLimiter, ItemExponentialLimiter, MaxOfLimiter, RateLimiter,
};

/// Bound for queue keys.
pub trait QueueKey: Eq + Hash + Clone + Send + Sync + std::fmt::Debug + 'static {}
impl<T: Eq + Hash + Clone + Send + Sync + std::fmt::Debug + 'static> QueueKey for T {}

struct Delayed<K> {
    /// (ready_at, seq) -> key; seq keeps equal deadlines distinct.
    by_time: BTreeMap<(Instant, u64), K>,
    by_key: FxHashMap<K, (Instant, u64)>,
    seq: u64,
}

impl<K: QueueKey> Delayed<K> {
    fn new() -> Self {
        Self { by_time: BTreeMap::new(), by_key: FxHashMap::default(), seq: 0 }
    }

    /// Returns true when this became the earliest deadline.
    fn schedule(&mut self, key: K, ready_at: Instant) -> bool {
        if let Some(&(cur, seq)) = self.by_key.get(&key) {
            if cur <= ready_at {
                return false;
            }
            self.by_time.remove(&(cur, seq));
        }
        self.seq = self.seq.wrapping_add(1);
        let slot = (ready_at, self.seq);
        self.by_time.insert(slot, key.clone());
        self.by_key.insert(key, slot);
        self.next_deadline() == Some(ready_at)
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.by_time.keys().next().map(|(t, _)| *t)
    }

    fn pop_ready(&mut self, now: Instant) -> Vec<K> {
        let mut out = Vec::new();
        while let Some(entry) = self.by_time.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let key = entry.remove();
            self.by_key.remove(&key);
            out.push(key);
        }
        out
    }

    fn clear(&mut self) {
        self.by_time.clear();
        self.by_key.clear();
    }

    fn len(&self) -> usize {
        self.by_time.len()
    }
}

struct State<K> {
    queue: VecDeque<K>,
    /// Keys waiting for a worker: everything in `queue`, plus keys re-added while processing.
    dirty: FxHashSet<K>,
    processing: FxHashSet<K>,
    delayed: Delayed<K>,
    queued_at: FxHashMap<K, Instant>,
    started_at: FxHashMap<K, Instant>,
    shutting_down: bool,
}

struct Shared<K> {
    name: String,
    state: Mutex<State<K>>,
    /// Wakes workers blocked in `get`.
    ready: Notify,
    /// Wakes the delay loop when the earliest deadline moves or on shutdown.
    timer: Notify,
    /// Wakes `shut_down_with_drain` whenever processing empties.
    idle: Notify,
}

impl<K: QueueKey> Shared<K> {
    fn lock(&self) -> MutexGuard<'_, State<K>> {
        // Every critical section leaves the sets consistent, so a poisoned lock is still usable.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn add(&self, key: K) {
        let mut st = self.lock();
        if st.shutting_down {
            trace!(queue = %self.name, ?key, "add after shutdown dropped");
            return;
        }
        if !st.dirty.insert(key.clone()) {
            return;
        }
        counter!("workqueue_adds_total", 1u64, "name" => self.name.clone());
        if st.processing.contains(&key) {
            return;
        }
        st.queued_at.insert(key.clone(), Instant::now());
        st.queue.push_back(key);
        gauge!("workqueue_depth", st.queue.len() as f64, "name" => self.name.clone());
        drop(st);
        self.ready.notify_one();
    }
}

/// Shared work queue. Wrap in an `Arc` and hand clones to producers and workers.
///
/// Dropping the queue shuts it down.
pub struct WorkQueue<K: QueueKey> {
    shared: Arc<Shared<K>>,
    limiter: Box<dyn RateLimiter<K>>,
}

impl<K: QueueKey> WorkQueue<K> {
    /// Create a queue and spawn its delay loop on the current tokio runtime.
    pub fn new(name: impl Into<String>, limiter: impl RateLimiter<K> + 'static) -> Self {
        let shared = Arc::new(Shared {
            name: name.into(),
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: FxHashSet::default(),
                processing: FxHashSet::default(),
                delayed: Delayed::new(),
                queued_at: FxHashMap::default(),
                started_at: FxHashMap::default(),
                shutting_down: false,
            }),
            ready: Notify::new(),
            timer: Notify::new(),
            idle: Notify::new(),
        });
        tokio::spawn(run_delay_loop(Arc::clone(&shared)));
        Self { shared, limiter: Box::new(limiter) }
    }

    /// Queue `key` unless it is already waiting. A key that is processing is
    /// re-queued once its current run calls [`WorkQueue::done`].
    pub fn add(&self, key: K) {
        self.shared.add(key);
    }

    /// Queue `key` after `delay`. Scheduling an already-delayed key keeps the earlier deadline.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let ready_at = Instant::now() + delay;
        let mut st = self.shared.lock();
        if st.shutting_down {
            return;
        }
        let earliest = st.delayed.schedule(key, ready_at);
        drop(st);
        if earliest {
            self.shared.timer.notify_one();
        }
    }

    /// Queue `key` after the delay the rate limiter assigns to it.
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.limiter.when(&key);
        counter!("workqueue_retries_total", 1u64, "name" => self.shared.name.clone());
        debug!(queue = %self.shared.name, ?key, delay_ms = delay.as_millis() as u64, "requeue with backoff");
        self.add_after(key, delay);
    }

    pub fn num_requeues(&self, key: &K) -> u32 {
        self.limiter.num_requeues(key)
    }

    /// Reset the retry count for `key`. Does not touch queued or processing state.
    pub fn forget(&self, key: &K) {
        self.limiter.forget(key);
    }

    /// Wait for the next key and mark it processing. Returns `None` once the queue
    /// is shut down and nothing is left to hand out.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.shared.ready.notified();
            tokio::pin!(notified);
            // Register before inspecting state so an add between the check and the await is not missed.
            notified.as_mut().enable();
            {
                let mut st = self.shared.lock();
                if let Some(key) = st.queue.pop_front() {
                    let now = Instant::now();
                    if let Some(t0) = st.queued_at.remove(&key) {
                        histogram!("workqueue_queue_ms", now.duration_since(t0).as_secs_f64() * 1000.0, "name" => self.shared.name.clone());
                    }
                    st.started_at.insert(key.clone(), now);
                    st.processing.insert(key.clone());
                    st.dirty.remove(&key);
                    gauge!("workqueue_depth", st.queue.len() as f64, "name" => self.shared.name.clone());
                    let more = !st.queue.is_empty();
                    drop(st);
                    if more {
                        // Pass the baton in case several keys arrived under one permit.
                        self.shared.ready.notify_one();
                    }
                    return Some(key);
                }
                if st.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark `key` finished. If it was re-added meanwhile it is queued again now.
    pub fn done(&self, key: &K) {
        let mut st = self.shared.lock();
        if !st.processing.remove(key) {
            return;
        }
        if let Some(t0) = st.started_at.remove(key) {
            histogram!("workqueue_work_ms", t0.elapsed().as_secs_f64() * 1000.0, "name" => self.shared.name.clone());
        }
        let requeued = st.dirty.contains(key);
        if requeued {
            st.queued_at.insert(key.clone(), Instant::now());
            st.queue.push_back(key.clone());
        }
        let idle = st.processing.is_empty();
        drop(st);
        if requeued {
            self.shared.ready.notify_one();
        }
        if idle {
            self.shared.idle.notify_waiters();
        }
    }

    /// Number of keys queued and waiting for a worker.
    pub fn len(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys scheduled for later.
    pub fn delayed_len(&self) -> usize {
        self.shared.lock().delayed.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.lock().shutting_down
    }

    /// Stop accepting keys. Queued keys are still handed out; once they are gone
    /// `get` returns `None`. Delayed keys are dropped.
    pub fn shut_down(&self) {
        let mut st = self.shared.lock();
        if st.shutting_down {
            return;
        }
        st.shutting_down = true;
        let dropped = st.delayed.len();
        st.delayed.clear();
        drop(st);
        debug!(queue = %self.shared.name, dropped_delayed = dropped, "queue shutting down");
        self.shared.ready.notify_waiters();
        self.shared.timer.notify_one();
    }

    /// [`WorkQueue::shut_down`], then wait until no key is processing.
    pub async fn shut_down_with_drain(&self) {
        self.shut_down();
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.shared.lock().processing.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

impl<K: QueueKey> Drop for WorkQueue<K> {
    fn drop(&mut self) {
        self.shut_down();
    }
}

/// Promotes delayed keys into the queue when their deadline passes.
async fn run_delay_loop<K: QueueKey>(shared: Arc<Shared<K>>) {
    loop {
        let wake = shared.timer.notified();
        tokio::pin!(wake);
        wake.as_mut().enable();
        let next = {
            let mut st = shared.lock();
            if st.shutting_down {
                break;
            }
            let ready = st.delayed.pop_ready(Instant::now());
            let next = st.delayed.next_deadline();
            drop(st);
            for key in ready {
                shared.add(key);
            }
            next
        };
        match next {
            Some(deadline) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = &mut wake => {}
                }
            }
            None => wake.await,
        }
    }
    debug!(queue = %shared.name, "delay loop stopped");
}
