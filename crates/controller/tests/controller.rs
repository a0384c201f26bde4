#![forbid(unsafe_code)]

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use autolabel_controller::{
    AnnotationToLabel, Controller, ControllerConfig, Reconciler, RuleReconciler, SyncError,
};
use autolabel_core::{ResourceEventHandler, ResourceKey, UpdateError};
use autolabel_queue::ItemExponentialLimiter;
use common::{annotated_pod, wait_until, Counting, FakeCluster, Reports};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

fn config(workers: usize, max_retries: u32) -> ControllerConfig {
    ControllerConfig {
        workers,
        max_retries,
        min_restart_interval: Duration::from_millis(10),
        ..ControllerConfig::default()
    }
}

fn fast_limiter() -> ItemExponentialLimiter<ResourceKey> {
    ItemExponentialLimiter::new(Duration::from_millis(1), Duration::from_millis(4))
}

struct Running<R> {
    ctl: Arc<Controller<R>>,
    stop: CancellationToken,
    task: JoinHandle<anyhow::Result<()>>,
    _synced: watch::Sender<bool>,
}

impl<R: Reconciler> Running<R> {
    fn start(ctl: Controller<R>) -> Self {
        let ctl = Arc::new(ctl);
        let (synced_tx, synced_rx) = watch::channel(true);
        let stop = CancellationToken::new();
        let task = tokio::spawn({
            let ctl = Arc::clone(&ctl);
            let stop = stop.clone();
            async move { ctl.run(synced_rx, stop).await }
        });
        Self { ctl, stop, task, _synced: synced_tx }
    }

    async fn stop(self) {
        self.stop.cancel();
        tokio::time::timeout(Duration::from_secs(5), self.task).await.unwrap().unwrap().unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn converges_from_notifications_and_ignores_its_own_echo() {
    let cluster = Arc::new(FakeCluster::with(vec![
        annotated_pod("pod-a", "blue"),
        autolabel_core::ResourceSnapshot::new(Some("default"), "pod-b"),
    ]));
    let reports = Arc::new(Reports::default());
    let reconciler = Counting::new(RuleReconciler::new(cluster.clone(), cluster.clone(), AnnotationToLabel::default()));
    let ctl = Controller::with_sink(config(5, 10), reconciler, fast_limiter(), reports.clone());
    let handler = ctl.event_handler();
    let run = Running::start(ctl);

    let before = cluster.object("default/pod-a").unwrap();
    handler.on_add(&before);
    handler.on_add(&cluster.object("default/pod-b").unwrap());
    wait_until("pod-a labelled", || {
        cluster.object("default/pod-a").and_then(|p| p.label("autolabel").map(str::to_string)) == Some("blue".into())
    })
    .await;

    // The watch feed echoes our own write back as an update.
    let after = cluster.object("default/pod-a").unwrap();
    handler.on_update(&before, &after);
    wait_until("echo processed", || run.ctl.queue().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(cluster.updates(), 1);
    assert_eq!(reports.len(), 0);
    run.stop().await;
}

struct AlwaysFails(AtomicUsize);

#[async_trait::async_trait]
impl Reconciler for AlwaysFails {
    async fn reconcile(&self, _key: &ResourceKey) -> Result<(), SyncError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Err(anyhow::anyhow!("boom").into())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn gives_up_after_max_retries_and_reports_once() {
    let reports = Arc::new(Reports::default());
    let ctl = Controller::with_sink(config(2, 3), AlwaysFails(AtomicUsize::new(0)), fast_limiter(), reports.clone());
    let queue = ctl.queue();
    let run = Running::start(ctl);

    let key = ResourceKey::from_raw("default/pod-a");
    queue.add(key.clone());
    wait_until("give-up reported", || reports.len() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // First attempt, then requeued at counts 0..=3.
    assert_eq!(run.ctl_reconciler_attempts(), 5);
    assert_eq!(reports.len(), 1);
    assert_eq!(reports.0.lock().unwrap()[0].0.as_ref(), Some(&key));
    assert_eq!(queue.num_requeues(&key), 0);
    assert_eq!(queue.delayed_len(), 0);

    // A fresh notification starts over with a fresh budget.
    queue.add(key.clone());
    wait_until("second give-up", || reports.len() == 2).await;
    assert_eq!(run.ctl_reconciler_attempts(), 10);
    run.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn zero_max_retries_still_requeues_once() {
    let reports = Arc::new(Reports::default());
    let ctl = Controller::with_sink(config(1, 0), AlwaysFails(AtomicUsize::new(0)), fast_limiter(), reports.clone());
    let queue = ctl.queue();
    let run = Running::start(ctl);

    queue.add(ResourceKey::from_raw("default/pod-a"));
    wait_until("give-up reported", || reports.len() == 1).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(run.ctl_reconciler_attempts(), 2);
    assert_eq!(reports.len(), 1);
    run.stop().await;
}

impl Running<AlwaysFails> {
    fn ctl_reconciler_attempts(&self) -> usize {
        self.ctl.reconciler().0.load(Ordering::SeqCst)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_key_is_reported_without_retry() {
    let cluster = Arc::new(FakeCluster::default());
    let reports = Arc::new(Reports::default());
    let reconciler = Counting::new(RuleReconciler::new(cluster.clone(), cluster.clone(), AnnotationToLabel::default()));
    let ctl = Controller::with_sink(config(2, 10), reconciler, fast_limiter(), reports.clone());
    let queue = ctl.queue();
    let run = Running::start(ctl);

    queue.add(ResourceKey::from_raw("a/b/c"));
    wait_until("malformed key reported", || reports.len() == 1).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(run.ctl.reconciler().calls("a/b/c"), 1);
    assert_eq!(reports.len(), 1);
    run.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transient_failures_are_retried_until_success() {
    let cluster = Arc::new(FakeCluster::with(vec![annotated_pod("pod-a", "blue")]));
    cluster.fail_next(UpdateError::Conflict("stale".into()));
    cluster.fail_next(UpdateError::Api { code: 500, message: "etcd timeout".into() });
    let reports = Arc::new(Reports::default());
    let reconciler = Counting::new(RuleReconciler::new(cluster.clone(), cluster.clone(), AnnotationToLabel::default()));
    let ctl = Controller::with_sink(config(3, 10), reconciler, fast_limiter(), reports.clone());
    let queue = ctl.queue();
    let run = Running::start(ctl);

    let key = ResourceKey::from_raw("default/pod-a");
    queue.add(key.clone());
    wait_until("label applied", || {
        cluster.object("default/pod-a").map(|p| p.label("autolabel") == Some("blue")).unwrap_or(false)
    })
    .await;
    wait_until("key settled", || queue.is_empty() && queue.delayed_len() == 0).await;

    assert_eq!(cluster.updates(), 3);
    assert_eq!(run.ctl.reconciler().calls("default/pod-a"), 3);
    assert_eq!(queue.num_requeues(&key), 0);
    assert_eq!(reports.len(), 0);
    run.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deleted_resource_is_a_quiet_success() {
    let cluster = Arc::new(FakeCluster::default());
    let reports = Arc::new(Reports::default());
    let reconciler = Counting::new(RuleReconciler::new(cluster.clone(), cluster.clone(), AnnotationToLabel::default()));
    let ctl = Controller::with_sink(config(2, 10), reconciler, fast_limiter(), reports.clone());
    let queue = ctl.queue();
    let run = Running::start(ctl);

    queue.add(ResourceKey::from_raw("default/gone"));
    wait_until("processed", || run.ctl.reconciler().calls("default/gone") == 1).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(run.ctl.reconciler().calls("default/gone"), 1);
    assert_eq!(cluster.updates(), 0);
    assert_eq!(queue.delayed_len(), 0);
    assert_eq!(reports.len(), 0);
    run.stop().await;
}

struct Slow {
    started: AtomicBool,
    finished: AtomicBool,
}

#[async_trait::async_trait]
impl Reconciler for Slow {
    async fn reconcile(&self, _key: &ResourceKey) -> Result<(), SyncError> {
        self.started.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.finished.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_lets_in_flight_sync_finish() {
    let ctl = Controller::new(
        config(1, 10),
        Slow { started: AtomicBool::new(false), finished: AtomicBool::new(false) },
        fast_limiter(),
    );
    let queue = ctl.queue();
    let run = Running::start(ctl);
    queue.add(ResourceKey::from_raw("default/pod-a"));
    wait_until("sync started", || run.ctl.reconciler().started.load(Ordering::SeqCst)).await;

    let ctl = Arc::clone(&run.ctl);
    run.stop().await;
    assert!(ctl.reconciler().finished.load(Ordering::SeqCst));
    assert!(queue.is_shutting_down());
    assert_eq!(queue.get().await, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_before_cache_sync_returns_without_starting_workers() {
    let ctl = Controller::new(config(2, 10), AlwaysFails(AtomicUsize::new(0)), fast_limiter());
    let queue = ctl.queue();
    queue.add(ResourceKey::from_raw("default/pod-a"));
    let (_tx, rx) = watch::channel(false);
    let stop = CancellationToken::new();
    stop.cancel();
    ctl.run(rx, stop).await.unwrap();
    assert!(queue.is_shutting_down());
    assert_eq!(ctl.reconciler().0.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropped_sync_signal_is_an_error() {
    let ctl = Controller::new(config(2, 10), AlwaysFails(AtomicUsize::new(0)), fast_limiter());
    let (tx, rx) = watch::channel(false);
    drop(tx);
    assert!(ctl.run(rx, CancellationToken::new()).await.is_err());
}

struct PanicsOnFirstBoom {
    panicked: AtomicBool,
    handled: std::sync::Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl Reconciler for PanicsOnFirstBoom {
    async fn reconcile(&self, key: &ResourceKey) -> Result<(), SyncError> {
        if key.as_str() == "default/boom" && !self.panicked.swap(true, Ordering::SeqCst) {
            panic!("sync blew up");
        }
        self.handled.lock().unwrap().push(key.to_string());
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicked_worker_is_restarted_and_key_is_released() {
    let ctl = Controller::new(
        config(1, 10),
        PanicsOnFirstBoom { panicked: AtomicBool::new(false), handled: Default::default() },
        fast_limiter(),
    );
    let queue = ctl.queue();
    let run = Running::start(ctl);

    queue.add(ResourceKey::from_raw("default/boom"));
    wait_until("panic happened", || run.ctl.reconciler().panicked.load(Ordering::SeqCst)).await;
    queue.add(ResourceKey::from_raw("default/ok"));
    // Would stay parked forever if the panicking run had not released the key.
    queue.add(ResourceKey::from_raw("default/boom"));
    wait_until("restarted worker drained both keys", || run.ctl.reconciler().handled.lock().unwrap().len() == 2).await;

    let mut handled = run.ctl.reconciler().handled.lock().unwrap().clone();
    handled.sort();
    assert_eq!(handled, vec!["default/boom".to_string(), "default/ok".to_string()]);
    run.stop().await;
}
