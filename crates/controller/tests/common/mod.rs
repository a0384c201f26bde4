#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use autolabel_controller::{ErrorSink, Reconciler, SyncError};
use autolabel_core::{ResourceKey, ResourceSnapshot, ResourceUpdater, SnapshotLister, UpdateError};
use rustc_hash::FxHashMap;

/// In-memory stand-in for the cache and the API server.
#[derive(Default)]
pub struct FakeCluster {
    pub objects: Mutex<FxHashMap<ResourceKey, ResourceSnapshot>>,
    pub updates: AtomicUsize,
    pub fail_with: Mutex<VecDeque<UpdateError>>,
}

impl FakeCluster {
    pub fn with(objs: Vec<ResourceSnapshot>) -> Self {
        let me = Self::default();
        for o in objs {
            me.put(o);
        }
        me
    }

    pub fn put(&self, obj: ResourceSnapshot) {
        let key = obj.key().unwrap();
        self.objects.lock().unwrap().insert(key, obj);
    }

    pub fn remove(&self, key: &str) {
        self.objects.lock().unwrap().remove(&ResourceKey::from_raw(key));
    }

    pub fn object(&self, key: &str) -> Option<ResourceSnapshot> {
        self.objects.lock().unwrap().get(&ResourceKey::from_raw(key)).cloned()
    }

    pub fn fail_next(&self, err: UpdateError) {
        self.fail_with.lock().unwrap().push_back(err);
    }

    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }
}

impl SnapshotLister for FakeCluster {
    fn get(&self, namespace: Option<&str>, name: &str) -> Option<ResourceSnapshot> {
        let key = ResourceKey::new(namespace, name).ok()?;
        self.objects.lock().unwrap().get(&key).cloned()
    }
}

#[async_trait::async_trait]
impl ResourceUpdater for FakeCluster {
    async fn update(&self, obj: &ResourceSnapshot) -> Result<ResourceSnapshot, UpdateError> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.fail_with.lock().unwrap().pop_front() {
            return Err(err);
        }
        let key = obj.key().map_err(|e| UpdateError::Transport(e.into()))?;
        let mut objects = self.objects.lock().unwrap();
        if !objects.contains_key(&key) {
            return Err(UpdateError::NotFound(key.to_string()));
        }
        objects.insert(key, obj.clone());
        Ok(obj.clone())
    }
}

#[derive(Default)]
pub struct Reports(pub Mutex<Vec<(Option<ResourceKey>, String)>>);

impl Reports {
    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

impl ErrorSink for Reports {
    fn report(&self, key: Option<&ResourceKey>, err: &SyncError) {
        self.0.lock().unwrap().push((key.cloned(), err.to_string()));
    }
}

/// Counts calls per key before delegating.
pub struct Counting<R> {
    pub inner: R,
    pub calls: Mutex<FxHashMap<String, usize>>,
}

impl<R> Counting<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, calls: Mutex::new(FxHashMap::default()) }
    }

    pub fn calls(&self, key: &str) -> usize {
        self.calls.lock().unwrap().get(key).copied().unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl<R: Reconciler> Reconciler for Counting<R> {
    async fn reconcile(&self, key: &ResourceKey) -> Result<(), SyncError> {
        *self.calls.lock().unwrap().entry(key.to_string()).or_insert(0) += 1;
        self.inner.reconcile(key).await
    }
}

pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn annotated_pod(name: &str, value: &str) -> ResourceSnapshot {
    ResourceSnapshot::new(Some("default"), name).with_annotation(&format!("autolabel/{name}"), value)
}
