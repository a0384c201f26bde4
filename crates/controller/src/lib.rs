//! autolabel controller: wires the watch bridge, the work queue and a supervised
//! worker pool around a pluggable [`Reconciler`].

#![forbid(unsafe_code)]

pub mod bridge;
pub mod rules;
pub mod sync;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use autolabel_core::ResourceKey;
use autolabel_queue::{RateLimiter, WorkQueue};
use metrics::{counter, histogram};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use bridge::EventBridge;
pub use rules::AnnotationToLabel;
pub use sync::{ErrorSink, LogSink, Reconciler, RuleReconciler, SyncError, SyncRule};

pub const DEFAULT_NAME: &str = "autolabel";
pub const DEFAULT_WORKERS: usize = 5;
pub const DEFAULT_MAX_RETRIES: u32 = 10;
pub const DEFAULT_MIN_RESTART_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Queue name, used in logs and metric labels.
    pub name: String,
    pub workers: usize,
    /// A failed key is requeued while its requeue count is at most this; the failure
    /// after that gives it up.
    pub max_retries: u32,
    /// A crashed worker is restarted no sooner than this after its previous start.
    pub min_restart_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            workers: DEFAULT_WORKERS,
            max_retries: DEFAULT_MAX_RETRIES,
            min_restart_interval: DEFAULT_MIN_RESTART_INTERVAL,
        }
    }
}

struct Engine<R> {
    queue: Arc<WorkQueue<ResourceKey>>,
    reconciler: R,
    sink: Arc<dyn ErrorSink>,
    max_retries: u32,
}

/// Calls `done` when dropped, including when the sync panics.
struct InFlight<'a> {
    queue: &'a WorkQueue<ResourceKey>,
    key: &'a ResourceKey,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.queue.done(self.key);
    }
}

impl<R: Reconciler> Engine<R> {
    /// One dequeue → sync → ack/retry cycle. `false` once the queue is drained and shut down.
    async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };
        let _in_flight = InFlight { queue: &self.queue, key: &key };
        let t0 = Instant::now();
        let res = self.reconciler.reconcile(&key).await;
        histogram!("reconcile_ms", t0.elapsed().as_secs_f64() * 1000.0);
        self.handle_result(&key, res);
        true
    }

    fn handle_result(&self, key: &ResourceKey, res: Result<(), SyncError>) {
        let err = match res {
            Ok(()) => {
                self.queue.forget(key);
                counter!("reconcile_total", 1u64, "result" => "ok");
                return;
            }
            Err(err) => err,
        };
        if err.is_permanent() {
            counter!("reconcile_total", 1u64, "result" => "permanent");
            self.sink.report(Some(key), &err);
            self.queue.forget(key);
            return;
        }
        let attempts = self.queue.num_requeues(key);
        if attempts <= self.max_retries {
            counter!("reconcile_total", 1u64, "result" => "requeue");
            debug!(key = %key, attempts, error = %err, "sync failed; retrying");
            self.queue.add_rate_limited(key.clone());
            return;
        }
        counter!("reconcile_total", 1u64, "result" => "giveup");
        warn!(key = %key, attempts, "retries exhausted; dropping key");
        self.sink.report(Some(key), &err);
        self.queue.forget(key);
    }
}

async fn run_worker<R: Reconciler>(engine: Arc<Engine<R>>, id: usize) {
    debug!(worker = id, "worker started");
    while engine.process_next_item().await {}
    debug!(worker = id, "worker exiting; queue drained");
}

/// Keeps one worker loop alive until it exits normally.
async fn supervise<R: Reconciler>(engine: Arc<Engine<R>>, id: usize, min_interval: Duration, stop: CancellationToken) {
    loop {
        let started = Instant::now();
        match tokio::spawn(run_worker(Arc::clone(&engine), id)).await {
            Ok(()) => return,
            Err(e) if e.is_panic() => {
                counter!("controller_worker_restarts_total", 1u64);
                error!(worker = id, "worker panicked; restarting");
            }
            Err(e) => {
                warn!(worker = id, error = %e, "worker cancelled");
                return;
            }
        }
        let wait = min_interval.saturating_sub(started.elapsed());
        // After stop, restart right away so the replacement can help drain.
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = stop.cancelled() => {}
        }
    }
}

async fn wait_synced(synced: &mut watch::Receiver<bool>) -> bool {
    synced.wait_for(|s| *s).await.is_ok()
}

pub struct Controller<R> {
    config: ControllerConfig,
    engine: Arc<Engine<R>>,
}

impl<R: Reconciler> Controller<R> {
    /// Must be called inside a tokio runtime (the queue spawns its delay loop).
    pub fn new(config: ControllerConfig, reconciler: R, limiter: impl RateLimiter<ResourceKey> + 'static) -> Self {
        Self::with_sink(config, reconciler, limiter, Arc::new(LogSink))
    }

    pub fn with_sink(
        config: ControllerConfig,
        reconciler: R,
        limiter: impl RateLimiter<ResourceKey> + 'static,
        sink: Arc<dyn ErrorSink>,
    ) -> Self {
        let queue = Arc::new(WorkQueue::new(config.name.clone(), limiter));
        let engine = Arc::new(Engine { queue, reconciler, sink, max_retries: config.max_retries });
        Self { config, engine }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn reconciler(&self) -> &R {
        &self.engine.reconciler
    }

    pub fn queue(&self) -> Arc<WorkQueue<ResourceKey>> {
        Arc::clone(&self.engine.queue)
    }

    /// Handler to register with the informer.
    pub fn event_handler(&self) -> Arc<EventBridge> {
        Arc::new(EventBridge::new(self.queue(), Arc::clone(&self.engine.sink)))
    }

    /// Waits for `synced`, runs the workers until `stop` fires, then shuts the queue
    /// down and returns once every worker has drained.
    pub async fn run(&self, mut synced: watch::Receiver<bool>, stop: CancellationToken) -> Result<()> {
        let queue = &self.engine.queue;
        info!(controller = %self.config.name, "waiting for cache sync");
        tokio::select! {
            ok = wait_synced(&mut synced) => {
                if !ok {
                    queue.shut_down();
                    bail!("cache sync signal closed before the cache synced");
                }
            }
            _ = stop.cancelled() => {
                info!(controller = %self.config.name, "stopped before cache sync");
                queue.shut_down();
                return Ok(());
            }
        }

        let workers = self.config.workers.max(1);
        info!(controller = %self.config.name, workers, "cache synced; starting workers");
        let mut set = JoinSet::new();
        for id in 0..workers {
            set.spawn(supervise(Arc::clone(&self.engine), id, self.config.min_restart_interval, stop.clone()));
        }

        stop.cancelled().await;
        info!(controller = %self.config.name, pending = queue.len(), "stop requested; draining");
        queue.shut_down();
        while let Some(res) = set.join_next().await {
            if let Err(e) = res {
                warn!(error = %e, "worker supervisor ended abnormally");
            }
        }
        info!(controller = %self.config.name, "controller stopped");
        Ok(())
    }
}
