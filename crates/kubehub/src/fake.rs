//! In-memory cluster used by tests.
//!
//! Collections are keyed by gvk and namespace. Mutations made through the
//! helpers or the [`ResourceClient`] methods are broadcast to live watchers.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use converge_core::{gvk_key, ServerVersion, WatchEvent};
use futures::StreamExt;
use kube::core::{DynamicObject, GroupVersionKind};
use kube::ResourceExt;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{ClientError, ClientSet, EventStream, ResourceClient, RestMapping};

type WatchTx = mpsc::UnboundedSender<Result<WatchEvent, ClientError>>;

const CLUSTER_SCOPED: &[&str] = &[
    "v1/Namespace",
    "v1/PersistentVolume",
    "v1/Node",
    "storage.k8s.io/v1/StorageClass",
    "rbac.authorization.k8s.io/v1/ClusterRole",
    "rbac.authorization.k8s.io/v1/ClusterRoleBinding",
    "apiextensions.k8s.io/v1/CustomResourceDefinition",
];

pub struct FakeResourceClient {
    gvk: GroupVersionKind,
    objects: Mutex<BTreeMap<String, DynamicObject>>,
    watchers: Mutex<Vec<WatchTx>>,
    /// `None` lets one `get` through untouched.
    get_errors: Mutex<VecDeque<Option<ClientError>>>,
}

impl FakeResourceClient {
    fn new(gvk: GroupVersionKind) -> Self {
        Self {
            gvk,
            objects: Mutex::new(BTreeMap::new()),
            watchers: Mutex::new(Vec::new()),
            get_errors: Mutex::new(VecDeque::new()),
        }
    }

    fn not_found(&self, name: &str) -> ClientError {
        ClientError::NotFound(format!("{} \"{}\" not found", self.gvk.kind.to_lowercase(), name))
    }

    fn broadcast(&self, ev: WatchEvent) {
        if let Ok(mut watchers) = self.watchers.lock() {
            watchers.retain(|tx| tx.send(Ok(ev.clone())).is_ok());
        }
    }

    /// Insert or replace an object, notifying watchers.
    pub fn apply(&self, obj: DynamicObject) {
        let name = obj.name_any();
        let existed = match self.objects.lock() {
            Ok(mut objects) => objects.insert(name, obj.clone()).is_some(),
            Err(_) => return,
        };
        self.broadcast(if existed { WatchEvent::modified(obj) } else { WatchEvent::added(obj) });
    }

    /// Remove an object, notifying watchers. Returns whether it existed.
    pub fn remove(&self, name: &str) -> bool {
        let removed = self.objects.lock().ok().and_then(|mut o| o.remove(name));
        match removed {
            Some(obj) => {
                self.broadcast(WatchEvent::deleted(obj));
                true
            }
            None => false,
        }
    }

    /// Make the next `get` fail with `err`.
    pub fn fail_next_get(&self, err: ClientError) {
        if let Ok(mut q) = self.get_errors.lock() {
            q.push_back(Some(err));
        }
    }

    /// Let the next queued `get` succeed; later `fail_next_get` calls apply after it.
    pub fn pass_next_get(&self) {
        if let Ok(mut q) = self.get_errors.lock() {
            q.push_back(None);
        }
    }

    /// Push a raw error into every live watch stream.
    pub fn inject_watch_error(&self, err: ClientError) {
        if let Ok(mut watchers) = self.watchers.lock() {
            watchers.retain(|tx| tx.send(Err(err.clone())).is_ok());
        }
    }

    pub fn object(&self, name: &str) -> Option<DynamicObject> {
        self.objects.lock().ok().and_then(|o| o.get(name).cloned())
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.lock().map(|mut w| {
            w.retain(|tx| !tx.is_closed());
            w.len()
        }).unwrap_or(0)
    }
}

#[async_trait]
impl ResourceClient for FakeResourceClient {
    async fn get(&self, name: &str) -> Result<DynamicObject, ClientError> {
        if let Some(err) = self.get_errors.lock().ok().and_then(|mut q| q.pop_front()).flatten() {
            return Err(err);
        }
        self.object(name).ok_or_else(|| self.not_found(name))
    }

    async fn list(&self) -> Result<Vec<DynamicObject>, ClientError> {
        Ok(self.objects.lock().map(|o| o.values().cloned().collect()).unwrap_or_default())
    }

    async fn watch(&self) -> Result<EventStream, ClientError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let objects = self.objects.lock().map_err(|_| ClientError::Transport("fake store poisoned".into()))?;
        for obj in objects.values() {
            let _ = tx.send(Ok(WatchEvent::added(obj.clone())));
        }
        if let Ok(mut watchers) = self.watchers.lock() {
            watchers.push(tx);
        }
        drop(objects);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, ClientError> {
        let name = obj.name_any();
        if self.object(&name).is_some() {
            return Err(ClientError::Api {
                code: 409,
                reason: "AlreadyExists".into(),
                message: format!("{} \"{}\" already exists", self.gvk.kind.to_lowercase(), name),
            });
        }
        self.apply(obj.clone());
        Ok(obj.clone())
    }

    async fn patch(&self, name: &str, patch: &serde_json::Value) -> Result<DynamicObject, ClientError> {
        let current = self.object(name).ok_or_else(|| self.not_found(name))?;
        let mut doc = serde_json::to_value(&current).map_err(|e| ClientError::Transport(e.to_string()))?;
        merge(&mut doc, patch);
        let next: DynamicObject = serde_json::from_value(doc).map_err(|e| ClientError::Transport(e.to_string()))?;
        self.apply(next.clone());
        Ok(next)
    }

    async fn delete(&self, name: &str) -> Result<(), ClientError> {
        if self.remove(name) {
            Ok(())
        } else {
            Err(self.not_found(name))
        }
    }
}

/// RFC 7386 merge.
fn merge(target: &mut serde_json::Value, patch: &serde_json::Value) {
    use serde_json::Value;
    match (target, patch) {
        (Value::Object(t), Value::Object(p)) => {
            for (k, v) in p {
                if v.is_null() {
                    t.remove(k);
                } else {
                    merge(t.entry(k.clone()).or_insert(Value::Null), v);
                }
            }
        }
        (t, p) => *t = p.clone(),
    }
}

/// In-memory [`ClientSet`].
pub struct FakeClientSet {
    collections: Mutex<FxHashMap<(String, String), Arc<FakeResourceClient>>>,
    removed: Mutex<FxHashSet<String>>,
    pending_no_match: Mutex<FxHashMap<String, usize>>,
    acquisitions: Mutex<usize>,
    invalidations: Mutex<usize>,
    version: ServerVersion,
}

impl Default for FakeClientSet {
    fn default() -> Self {
        Self::with_version(ServerVersion::new(1, 29))
    }
}

impl FakeClientSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_version(version: ServerVersion) -> Self {
        Self {
            collections: Mutex::new(FxHashMap::default()),
            removed: Mutex::new(FxHashSet::default()),
            pending_no_match: Mutex::new(FxHashMap::default()),
            acquisitions: Mutex::new(0),
            invalidations: Mutex::new(0),
            version,
        }
    }

    fn is_cluster_scoped(gvk: &GroupVersionKind) -> bool {
        CLUSTER_SCOPED.contains(&gvk_key(gvk).as_str())
    }

    /// Collection for `gvk` in `namespace`; created on first use.
    pub fn collection(&self, gvk: &GroupVersionKind, namespace: &str) -> Arc<FakeResourceClient> {
        let ns = if Self::is_cluster_scoped(gvk) { "" } else { namespace };
        let key = (gvk_key(gvk), ns.to_string());
        match self.collections.lock() {
            Ok(mut c) => Arc::clone(c.entry(key).or_insert_with(|| Arc::new(FakeResourceClient::new(gvk.clone())))),
            Err(_) => Arc::new(FakeResourceClient::new(gvk.clone())),
        }
    }

    /// Report the kind as unknown for the next `times` acquisitions.
    pub fn fail_acquire(&self, gvk: &GroupVersionKind, times: usize) {
        if let Ok(mut m) = self.pending_no_match.lock() {
            m.insert(gvk_key(gvk), times);
        }
    }

    /// Report the kind as unknown from now on, as if its CRD was deleted.
    pub fn remove_kind(&self, gvk: &GroupVersionKind) {
        if let Ok(mut r) = self.removed.lock() {
            r.insert(gvk_key(gvk));
        }
    }

    pub fn acquisitions(&self) -> usize {
        self.acquisitions.lock().map(|n| *n).unwrap_or(0)
    }

    pub fn invalidations(&self) -> usize {
        self.invalidations.lock().map(|n| *n).unwrap_or(0)
    }

    fn check_served(&self, gvk: &GroupVersionKind) -> Result<(), ClientError> {
        let key = gvk_key(gvk);
        if self.removed.lock().map(|r| r.contains(&key)).unwrap_or(false) {
            return Err(ClientError::NoMatch(key));
        }
        if let Ok(mut pending) = self.pending_no_match.lock() {
            if let Some(n) = pending.get_mut(&key) {
                if *n > 0 {
                    *n -= 1;
                    return Err(ClientError::NoMatch(key));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ClientSet for FakeClientSet {
    async fn resource_client(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
    ) -> Result<Arc<dyn ResourceClient>, ClientError> {
        if let Ok(mut n) = self.acquisitions.lock() {
            *n += 1;
        }
        self.check_served(gvk)?;
        Ok(self.collection(gvk, namespace.unwrap_or("")))
    }

    async fn server_version(&self) -> Result<ServerVersion, ClientError> {
        Ok(self.version)
    }

    async fn rest_mapping(&self, gvk: &GroupVersionKind) -> Result<RestMapping, ClientError> {
        self.check_served(gvk)?;
        Ok(RestMapping { plural: format!("{}s", gvk.kind.to_lowercase()), namespaced: !Self::is_cluster_scoped(gvk) })
    }

    async fn invalidate(&self) {
        if let Ok(mut n) = self.invalidations.lock() {
            *n += 1;
        }
    }
}
