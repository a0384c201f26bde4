//! List+watch one resource type into a reflector store and fan the changes out
//! to a [`ResourceEventHandler`] as add/update/delete callbacks.

#![forbid(unsafe_code)]

use std::sync::Arc;

use autolabel_core::{ResourceEventHandler, ResourceKey, ResourceSnapshot};
use futures::StreamExt;
use kube::{
    core::{ApiResource, DynamicObject},
    runtime::{
        reflector::{store::Writer, ObjectRef, Store},
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client,
};
use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{dynamic_api, snapshot_from, KubeLister};

/// Running informer. `synced` flips to `true` once the first full list is in the store.
pub struct Informer {
    pub lister: KubeLister,
    pub synced: watch::Receiver<bool>,
    pub task: JoinHandle<()>,
}

/// Keeps the store current and derives callbacks from what the store held before each event.
pub(crate) struct Fanout {
    writer: Writer<DynamicObject>,
    reader: Store<DynamicObject>,
    ar: ApiResource,
    handler: Arc<dyn ResourceEventHandler>,
}

impl Fanout {
    pub(crate) fn new(writer: Writer<DynamicObject>, ar: ApiResource, handler: Arc<dyn ResourceEventHandler>) -> Self {
        let reader = writer.as_reader();
        Self { writer, reader, ar, handler }
    }

    pub(crate) fn store(&self) -> Store<DynamicObject> {
        self.reader.clone()
    }

    pub(crate) fn apply(&mut self, ev: &Event<DynamicObject>) {
        match ev {
            Event::Applied(obj) => {
                let old = self.reader.get(&ObjectRef::from_obj_with(obj, self.ar.clone()));
                self.writer.apply_watcher_event(ev);
                self.notify(old.as_deref(), obj);
            }
            Event::Deleted(obj) => {
                self.writer.apply_watcher_event(ev);
                if let Some(snap) = convert(obj) {
                    self.handler.on_delete(&snap);
                }
            }
            Event::Restarted(list) => {
                let previous: FxHashMap<ResourceKey, Arc<DynamicObject>> =
                    self.reader.state().into_iter().filter_map(|o| Some((key_of(&o)?, o))).collect();
                self.writer.apply_watcher_event(ev);
                debug!(count = list.len(), previous = previous.len(), "relist");
                let mut seen = FxHashSet::default();
                for obj in list {
                    let Some(key) = key_of(obj) else { continue };
                    self.notify(previous.get(&key).map(|o| o.as_ref()), obj);
                    seen.insert(key);
                }
                for (key, gone) in previous.iter().filter(|(k, _)| !seen.contains(*k)) {
                    debug!(key = %key, "vanished during relist");
                    if let Some(snap) = convert(gone) {
                        self.handler.on_delete(&snap);
                    }
                }
            }
        }
    }

    fn notify(&self, old: Option<&DynamicObject>, new: &DynamicObject) {
        let Some(new) = convert(new) else { return };
        match old.and_then(convert) {
            Some(old) => self.handler.on_update(&old, &new),
            None => self.handler.on_add(&new),
        }
    }
}

fn key_of(obj: &DynamicObject) -> Option<ResourceKey> {
    ResourceKey::new(obj.metadata.namespace.as_deref(), obj.metadata.name.as_deref()?).ok()
}

fn convert(obj: &DynamicObject) -> Option<ResourceSnapshot> {
    match snapshot_from(obj) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!(name = ?obj.metadata.name, error = %e, "skipping unreadable object");
            None
        }
    }
}

/// Store an informer will fill. Listers can be handed out before the watch starts,
/// which lets the reconciler exist before the event handler it feeds.
pub struct InformerCache {
    writer: Writer<DynamicObject>,
    ar: ApiResource,
}

impl InformerCache {
    pub fn new(ar: ApiResource) -> Self {
        Self { writer: Writer::new(ar.clone()), ar }
    }

    pub fn lister(&self) -> KubeLister {
        KubeLister::new(self.writer.as_reader(), self.ar.clone())
    }

    /// Start list+watch (optionally one namespace) and call `handler` for every change.
    pub fn start(
        self,
        client: Client,
        namespaced: bool,
        namespace: Option<&str>,
        handler: Arc<dyn ResourceEventHandler>,
        stop: CancellationToken,
    ) -> Informer {
        let lister = self.lister();
        let api = dynamic_api(client, &self.ar, namespaced, namespace);
        let kind = self.ar.kind.clone();
        let mut fanout = Fanout::new(self.writer, self.ar, handler);
        let (synced_tx, synced) = watch::channel(false);
        let ns = namespace.map(|s| s.to_string());

        let task = tokio::spawn(async move {
            let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
            futures::pin_mut!(stream);
            info!(kind = %kind, ns = ?ns, "informer started");
            loop {
                tokio::select! {
                    _ = stop.cancelled() => {
                        debug!(kind = %kind, "informer stopping");
                        break;
                    }
                    next = stream.next() => {
                        match next {
                            Some(Ok(ev)) => {
                                let relisted = matches!(ev, Event::Restarted(_));
                                fanout.apply(&ev);
                                if relisted && !*synced_tx.borrow() {
                                    info!(kind = %kind, "initial list synced");
                                    synced_tx.send_replace(true);
                                }
                            }
                            Some(Err(e)) => {
                                counter!("informer_watch_errors_total", 1u64);
                                warn!(kind = %kind, error = %e, "watch error; backing off");
                            }
                            None => {
                                warn!(kind = %kind, "watch stream ended");
                                break;
                            }
                        }
                    }
                }
            }
            info!(kind = %kind, "informer stopped");
        });

        Informer { lister, synced, task }
    }
}
