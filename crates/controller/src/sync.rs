//! Sync contract: the engine hands a key to a [`Reconciler`]; [`RuleReconciler`] is the
//! cache-read / rule / remote-update implementation.

#![forbid(unsafe_code)]

use std::sync::Arc;

use autolabel_core::{MalformedKeyError, ResourceKey, ResourceSnapshot, ResourceUpdater, SnapshotLister, UpdateError};
use metrics::counter;
use tracing::{debug, error, info, trace};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    MalformedKey(#[from] MalformedKeyError),
    #[error("updating {key}: {source}")]
    Update {
        key: ResourceKey,
        #[source]
        source: UpdateError,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SyncError {
    /// Retrying cannot fix these.
    pub fn is_permanent(&self) -> bool {
        matches!(self, SyncError::MalformedKey(_))
    }
}

/// Level-triggered sync for one key. Must be idempotent; never retries internally.
#[async_trait::async_trait]
pub trait Reconciler: Send + Sync + 'static {
    async fn reconcile(&self, key: &ResourceKey) -> Result<(), SyncError>;
}

/// Fire-and-forget sink for errors nobody else will see.
pub trait ErrorSink: Send + Sync {
    /// `key` is `None` when the failure happened before a key existed.
    fn report(&self, key: Option<&ResourceKey>, err: &SyncError);
}

/// Logs through `tracing` and counts.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ErrorSink for LogSink {
    fn report(&self, key: Option<&ResourceKey>, err: &SyncError) {
        counter!("controller_errors_total", 1u64);
        match key {
            Some(key) => error!(key = %key, error = %err, "sync failed permanently"),
            None => error!(error = %err, "dropping notification"),
        }
    }
}

/// Computes desired state from current state.
pub trait SyncRule: Send + Sync {
    /// `None` when `current` already matches; otherwise the full object to write back.
    fn desired(&self, current: &ResourceSnapshot) -> Option<ResourceSnapshot>;
}

pub struct RuleReconciler<S> {
    lister: Arc<dyn SnapshotLister>,
    updater: Arc<dyn ResourceUpdater>,
    rule: S,
}

impl<S: SyncRule> RuleReconciler<S> {
    pub fn new(lister: Arc<dyn SnapshotLister>, updater: Arc<dyn ResourceUpdater>, rule: S) -> Self {
        Self { lister, updater, rule }
    }
}

#[async_trait::async_trait]
impl<S: SyncRule + 'static> Reconciler for RuleReconciler<S> {
    async fn reconcile(&self, key: &ResourceKey) -> Result<(), SyncError> {
        let (namespace, name) = key.split()?;
        let Some(current) = self.lister.get(namespace, name) else {
            debug!(key = %key, "not in cache; deleted since enqueue");
            return Ok(());
        };
        let Some(desired) = self.rule.desired(&current) else {
            trace!(key = %key, "already in desired state");
            return Ok(());
        };
        match self.updater.update(&desired).await {
            Ok(_) => {
                counter!("sync_updates_total", 1u64);
                info!(key = %key, "updated");
                Ok(())
            }
            Err(UpdateError::NotFound(_)) => {
                debug!(key = %key, "deleted before update landed");
                Ok(())
            }
            Err(source) => Err(SyncError::Update { key: key.clone(), source }),
        }
    }
}
