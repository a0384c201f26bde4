//! autolabel core types: resource keys, snapshots, and the collaborator seams
//! the reconciliation engine talks through.

#![forbid(unsafe_code)]

pub mod key;
pub mod snapshot;

pub use key::{MalformedKeyError, ResourceKey};
pub use snapshot::{ResourceSnapshot, SnapshotMeta};

/// Push-style notifications from a watch feed.
pub trait ResourceEventHandler: Send + Sync {
    fn on_add(&self, obj: &ResourceSnapshot);
    fn on_update(&self, old: &ResourceSnapshot, new: &ResourceSnapshot);
    fn on_delete(&self, _obj: &ResourceSnapshot) {}
}

/// Read-through access to the last observed state of resources.
pub trait SnapshotLister: Send + Sync {
    /// `namespace` is `None` for cluster-scoped resources.
    fn get(&self, namespace: Option<&str>, name: &str) -> Option<ResourceSnapshot>;
}

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("api error ({code}): {message}")]
    Api { code: u16, message: String },
    #[error("transport: {0}")]
    Transport(#[from] anyhow::Error),
}

/// Remote write path. Implementations send the whole object (replace semantics).
#[async_trait::async_trait]
pub trait ResourceUpdater: Send + Sync {
    async fn update(&self, obj: &ResourceSnapshot) -> Result<ResourceSnapshot, UpdateError>;
}
