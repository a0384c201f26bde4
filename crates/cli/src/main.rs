use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use autolabel_controller::rules::{DEFAULT_ANNOTATION_PREFIX, DEFAULT_LABEL_KEY};
use autolabel_controller::{
    AnnotationToLabel, Controller, ControllerConfig, RuleReconciler, DEFAULT_MAX_RETRIES, DEFAULT_MIN_RESTART_INTERVAL,
    DEFAULT_NAME, DEFAULT_WORKERS,
};
use autolabel_kubehub::{InformerCache, KubeUpdater};
use autolabel_queue::controller_limiter;
use autolabel_queue::limiter::{DEFAULT_BASE_DELAY, DEFAULT_BURST, DEFAULT_MAX_DELAY, DEFAULT_QPS};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "autolabel", version, about = "Copies autolabel/<name> annotations onto the autolabel label")]
struct Cli {
    /// GVK key to reconcile, e.g. "v1/Pod" or "apps/v1/Deployment"
    #[arg(long, env = "AUTOLABEL_GVK", default_value = "v1/Pod")]
    gvk: String,

    /// Only watch this namespace (default: all namespaces)
    #[arg(long, env = "AUTOLABEL_NAMESPACE")]
    namespace: Option<String>,

    /// Concurrent sync workers
    #[arg(long, env = "AUTOLABEL_WORKERS", default_value_t = DEFAULT_WORKERS)]
    workers: usize,

    /// Requeue limit; a key is dropped on the failure after this many requeues
    #[arg(long, env = "AUTOLABEL_MAX_RETRIES", default_value_t = DEFAULT_MAX_RETRIES)]
    max_retries: u32,

    /// Minimum seconds between restarts of a crashed worker
    #[arg(long, env = "AUTOLABEL_RESTART_INTERVAL_SECS", default_value_t = DEFAULT_MIN_RESTART_INTERVAL.as_secs())]
    restart_interval_secs: u64,

    /// First retry delay in milliseconds (doubles per failure)
    #[arg(long, env = "AUTOLABEL_BASE_DELAY_MS", default_value_t = DEFAULT_BASE_DELAY.as_millis() as u64)]
    base_delay_ms: u64,

    /// Retry delay cap in seconds
    #[arg(long, env = "AUTOLABEL_MAX_DELAY_SECS", default_value_t = DEFAULT_MAX_DELAY.as_secs())]
    max_delay_secs: u64,

    /// Overall retry rate across all keys
    #[arg(long, env = "AUTOLABEL_QPS", default_value_t = DEFAULT_QPS)]
    qps: f64,

    /// Retry burst across all keys
    #[arg(long, env = "AUTOLABEL_BURST", default_value_t = DEFAULT_BURST)]
    burst: u32,

    /// Annotation prefix; the object name is appended
    #[arg(long, env = "AUTOLABEL_ANNOTATION_PREFIX", default_value = DEFAULT_ANNOTATION_PREFIX)]
    annotation_prefix: String,

    /// Label that receives the annotation value
    #[arg(long, env = "AUTOLABEL_LABEL_KEY", default_value = DEFAULT_LABEL_KEY)]
    label_key: String,

    /// Queue name used in logs and metrics
    #[arg(long, env = "AUTOLABEL_QUEUE_NAME", default_value = DEFAULT_NAME)]
    queue_name: String,

    /// Log filter directives, e.g. "info" or "autolabel_controller=debug,kube=warn"
    #[arg(long, env = "AUTOLABEL_LOG", default_value = "info")]
    log: String,

    /// Serve Prometheus metrics on this host:port
    #[arg(long, env = "AUTOLABEL_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,
}

impl Cli {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            name: self.queue_name.clone(),
            workers: self.workers,
            max_retries: self.max_retries,
            min_restart_interval: Duration::from_secs(self.restart_interval_secs),
        }
    }
}

/// A bad filter is a startup error rather than a silent fallback.
fn init_tracing(directives: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_new(directives)
        .with_context(|| format!("parsing log filter {directives:?}"))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow!(e))
        .context("installing tracing subscriber")
}

/// Needs a running tokio runtime for the HTTP listener.
fn init_metrics(addr: Option<SocketAddr>) -> Result<()> {
    let Some(addr) = addr else {
        return Ok(());
    };
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .with_context(|| format!("serving metrics on {addr}"))?;
    info!(%addr, "Prometheus metrics exporter listening");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!(error = %e, "SIGTERM handler unavailable; waiting for Ctrl-C only"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Ctrl-C handler failed; stopping");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log)?;
    init_metrics(cli.metrics_addr)?;
    info!(gvk = %cli.gvk, ns = ?cli.namespace, workers = cli.workers, max_retries = cli.max_retries, "autolabel starting");

    let client = autolabel_kubehub::get_kube_client().await?;
    let (ar, namespaced) = autolabel_kubehub::resolve(client.clone(), &cli.gvk).await?;
    let stop = CancellationToken::new();

    // The reconciler reads through the informer's store, and the informer feeds the
    // controller's queue, so the store is created first and the watch started last.
    let cache = InformerCache::new(ar.clone());
    let reconciler = RuleReconciler::new(
        Arc::new(cache.lister()),
        Arc::new(KubeUpdater::new(client.clone(), ar, namespaced)),
        AnnotationToLabel::new(cli.annotation_prefix.clone(), cli.label_key.clone()),
    );
    let limiter = controller_limiter(
        Duration::from_millis(cli.base_delay_ms),
        Duration::from_secs(cli.max_delay_secs),
        cli.qps,
        cli.burst,
    );
    let controller = Controller::new(cli.controller_config(), reconciler, limiter);
    let informer = cache.start(client, namespaced, cli.namespace.as_deref(), controller.event_handler(), stop.clone());

    tokio::spawn({
        let stop = stop.clone();
        async move {
            shutdown_signal().await;
            info!("shutdown signal received");
            stop.cancel();
        }
    });

    controller.run(informer.synced.clone(), stop.clone()).await?;
    stop.cancel();
    if let Err(e) = informer.task.await {
        warn!(error = %e, "informer task ended abnormally");
    }
    info!("autolabel stopped");
    Ok(())
}
