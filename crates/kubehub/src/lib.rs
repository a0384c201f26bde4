//! autolabel kubehub: kube-rs implementations of the collaborators the controller
//! talks to (client, discovery, cached reads, remote updates, informer).

#![forbid(unsafe_code)]

pub mod informer;

use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use autolabel_core::{ResourceSnapshot, ResourceUpdater, SnapshotLister, UpdateError};
use kube::{
    api::{Api, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::reflector::{ObjectRef, Store},
    Client,
};
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

pub use informer::{Informer, InformerCache};

/// Build a client from the local kubeconfig, falling back to in-cluster config.
pub async fn get_kube_client() -> Result<Client> {
    Client::try_default()
        .await
        .context("building kube client (kubeconfig, then in-cluster service account)")
}

/// Parse `v1/Pod` or `apps/v1/Deployment`.
pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() })
        }
        [group, version, kind] if !group.is_empty() && !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind {
            group: (*group).to_string(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

/// Served resource for `gvk` and whether it is namespaced.
pub async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await.context("running api discovery")?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

pub(crate) fn dynamic_api(client: Client, ar: &ApiResource, namespaced: bool, namespace: Option<&str>) -> Api<DynamicObject> {
    match (namespaced, namespace) {
        (true, Some(ns)) => Api::namespaced_with(client, ns, ar),
        _ => Api::all_with(client, ar),
    }
}

pub fn snapshot_from(obj: &DynamicObject) -> Result<ResourceSnapshot> {
    let raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
    ResourceSnapshot::from_json(raw).context("reading object into snapshot")
}

pub fn object_from(snap: &ResourceSnapshot) -> Result<DynamicObject> {
    let raw = snap.to_json().context("serializing snapshot")?;
    serde_json::from_value(raw).context("building DynamicObject from snapshot")
}

/// Reads from the informer's reflector store.
#[derive(Clone)]
pub struct KubeLister {
    store: Store<DynamicObject>,
    ar: ApiResource,
}

impl KubeLister {
    pub fn new(store: Store<DynamicObject>, ar: ApiResource) -> Self {
        Self { store, ar }
    }

    pub fn len(&self) -> usize {
        self.store.state().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SnapshotLister for KubeLister {
    fn get(&self, namespace: Option<&str>, name: &str) -> Option<ResourceSnapshot> {
        let mut oref = ObjectRef::new_with(name, self.ar.clone());
        if let Some(ns) = namespace {
            oref = oref.within(ns);
        }
        let obj = self.store.get(&oref)?;
        match snapshot_from(&obj) {
            Ok(s) => Some(s),
            Err(e) => {
                warn!(name, ns = ?namespace, error = %e, "cached object unreadable");
                None
            }
        }
    }
}

/// Writes whole objects back with `replace`, so the API server's resourceVersion
/// check rejects writes based on stale reads.
pub struct KubeUpdater {
    client: Client,
    ar: ApiResource,
    namespaced: bool,
}

impl KubeUpdater {
    pub fn new(client: Client, ar: ApiResource, namespaced: bool) -> Self {
        Self { client, ar, namespaced }
    }
}

#[async_trait::async_trait]
impl ResourceUpdater for KubeUpdater {
    async fn update(&self, snap: &ResourceSnapshot) -> Result<ResourceSnapshot, UpdateError> {
        let ns = snap.namespace();
        if self.namespaced && ns.is_none() {
            return Err(UpdateError::Transport(anyhow!("namespace required for namespaced kind {}", self.ar.kind)));
        }
        let obj = object_from(snap)?;
        let api = dynamic_api(self.client.clone(), &self.ar, self.namespaced, ns);
        let t0 = Instant::now();
        let res = api.replace(snap.name(), &PostParams::default(), &obj).await;
        histogram!("kube_update_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match res {
            Ok(updated) => {
                counter!("kube_update_total", 1u64, "result" => "ok");
                debug!(name = %snap.name(), ns = ?ns, rv = ?updated.metadata.resource_version, "replaced");
                Ok(snapshot_from(&updated)?)
            }
            Err(e) => {
                let mapped = map_kube_error(e);
                counter!("kube_update_total", 1u64, "result" => update_error_label(&mapped));
                Err(mapped)
            }
        }
    }
}

pub fn map_kube_error(e: kube::Error) -> UpdateError {
    match e {
        kube::Error::Api(resp) if resp.code == 404 => UpdateError::NotFound(resp.message),
        kube::Error::Api(resp) if resp.code == 409 => UpdateError::Conflict(resp.message),
        kube::Error::Api(resp) => UpdateError::Api { code: resp.code, message: resp.message },
        other => UpdateError::Transport(anyhow::Error::new(other)),
    }
}

fn update_error_label(e: &UpdateError) -> &'static str {
    match e {
        UpdateError::NotFound(_) => "not_found",
        UpdateError::Conflict(_) => "conflict",
        UpdateError::Api { .. } => "api",
        UpdateError::Transport(_) => "transport",
    }
}

/// Resolve a GVK key against discovery.
pub async fn resolve(client: Client, gvk_key: &str) -> Result<(ApiResource, bool)> {
    let gvk = parse_gvk_key(gvk_key)?;
    let (ar, namespaced) = find_api_resource(client, &gvk).await?;
    info!(gvk = %gvk_key, namespaced, plural = %ar.plural, "resolved resource");
    Ok((ar, namespaced))
}
