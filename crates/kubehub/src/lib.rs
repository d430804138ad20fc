//! Converge kubehub: resource clients, discovery and watch wiring.
//!
//! The await engine only talks to the cluster through [`ClientSet`] and
//! [`ResourceClient`]. [`KubeClientSet`] backs them with kube-rs; [`fake`]
//! provides an in-memory cluster for tests.

#![forbid(unsafe_code)]

use std::sync::Arc;

use async_trait::async_trait;
use converge_core::{gvk_key, ServerVersion, WatchEvent};
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client, ResourceExt,
};
use metrics::counter;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

mod error;
pub mod fake;

pub use error::ClientError;

/// Stream of notifications for one resource collection.
pub type EventStream = BoxStream<'static, Result<WatchEvent, ClientError>>;

/// Operations on one (gvk, namespace) collection.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    async fn get(&self, name: &str) -> Result<DynamicObject, ClientError>;
    async fn list(&self) -> Result<Vec<DynamicObject>, ClientError>;
    /// Current objects are delivered as `Added` before live changes.
    async fn watch(&self) -> Result<EventStream, ClientError>;
    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, ClientError>;
    /// JSON merge patch.
    async fn patch(&self, name: &str, patch: &serde_json::Value) -> Result<DynamicObject, ClientError>;
    async fn delete(&self, name: &str) -> Result<(), ClientError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestMapping {
    pub plural: String,
    pub namespaced: bool,
}

/// Client factory plus discovery.
#[async_trait]
pub trait ClientSet: Send + Sync {
    /// `namespace` is ignored for cluster-scoped kinds. `None` on a namespaced
    /// kind addresses all namespaces.
    async fn resource_client(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
    ) -> Result<Arc<dyn ResourceClient>, ClientError>;
    async fn server_version(&self) -> Result<ServerVersion, ClientError>;
    async fn rest_mapping(&self, gvk: &GroupVersionKind) -> Result<RestMapping, ClientError>;
    /// Drop cached discovery so newly registered kinds become visible.
    async fn invalidate(&self);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespaced: bool,
}

impl DiscoveredResource {
    pub fn gvk_key(&self) -> String {
        gvk_key(&GroupVersionKind::gvk(&self.group, &self.version, &self.kind))
    }
}

/// kube-rs backed client set with cached discovery.
pub struct KubeClientSet {
    client: Client,
    discovery: RwLock<Option<Arc<Discovery>>>,
}

impl KubeClientSet {
    pub fn new(client: Client) -> Self {
        Self { client, discovery: RwLock::new(None) }
    }

    pub async fn try_default() -> Result<Self, ClientError> {
        let client = Client::try_default().await?;
        Ok(Self::new(client))
    }

    async fn discovery(&self) -> Result<Arc<Discovery>, ClientError> {
        if let Some(d) = self.discovery.read().await.as_ref() {
            return Ok(Arc::clone(d));
        }
        let mut slot = self.discovery.write().await;
        if let Some(d) = slot.as_ref() {
            return Ok(Arc::clone(d));
        }
        let d = Arc::new(Discovery::new(self.client.clone()).run().await?);
        counter!("kubehub_discovery_runs", 1u64);
        debug!(groups = d.groups().count(), "discovery cached");
        *slot = Some(Arc::clone(&d));
        Ok(d)
    }

    async fn find_api_resource(&self, gvk: &GroupVersionKind) -> Result<(ApiResource, bool), ClientError> {
        let discovery = self.discovery().await?;
        match discovery.resolve_gvk(gvk) {
            Some((ar, caps)) => Ok((ar, matches!(caps.scope, Scope::Namespaced))),
            None => Err(ClientError::NoMatch(gvk_key(gvk))),
        }
    }

    /// Served resources (incl. CRDs), preferred versions only.
    pub async fn discover(&self) -> Result<Vec<DiscoveredResource>, ClientError> {
        let discovery = self.discovery().await?;
        let mut out = Vec::new();
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                out.push(DiscoveredResource {
                    group: ar.group.clone(),
                    version: ar.version.clone(),
                    kind: ar.kind.clone(),
                    namespaced: matches!(caps.scope, Scope::Namespaced),
                });
            }
        }
        out.sort_by(|a, b| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind)));
        Ok(out)
    }
}

#[async_trait]
impl ClientSet for KubeClientSet {
    async fn resource_client(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
    ) -> Result<Arc<dyn ResourceClient>, ClientError> {
        let (ar, namespaced) = self.find_api_resource(gvk).await?;
        let api: Api<DynamicObject> = if namespaced {
            match namespace {
                Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
                None => Api::all_with(self.client.clone(), &ar),
            }
        } else {
            Api::all_with(self.client.clone(), &ar)
        };
        Ok(Arc::new(KubeResourceClient { api, key: gvk_key(gvk), namespace: namespace.map(str::to_string) }))
    }

    async fn server_version(&self) -> Result<ServerVersion, ClientError> {
        let info = self.client.apiserver_version().await?;
        ServerVersion::parse(&info.major, &info.minor).map_err(|e| ClientError::Transport(e.to_string()))
    }

    async fn rest_mapping(&self, gvk: &GroupVersionKind) -> Result<RestMapping, ClientError> {
        let (ar, namespaced) = self.find_api_resource(gvk).await?;
        Ok(RestMapping { plural: ar.plural, namespaced })
    }

    async fn invalidate(&self) {
        *self.discovery.write().await = None;
        debug!("discovery cache invalidated");
    }
}

struct KubeResourceClient {
    api: Api<DynamicObject>,
    key: String,
    namespace: Option<String>,
}

fn strip_managed_fields(mut obj: DynamicObject) -> DynamicObject {
    obj.metadata.managed_fields = None;
    obj
}

fn seen_key(obj: &DynamicObject) -> String {
    obj.uid().unwrap_or_else(|| obj.name_any())
}

/// First sighting of an object is `Added`, later ones `Modified`.
fn classify(seen: &mut FxHashSet<String>, obj: DynamicObject) -> WatchEvent {
    let obj = strip_managed_fields(obj);
    if seen.insert(seen_key(&obj)) {
        WatchEvent::added(obj)
    } else {
        WatchEvent::modified(obj)
    }
}

#[async_trait]
impl ResourceClient for KubeResourceClient {
    async fn get(&self, name: &str) -> Result<DynamicObject, ClientError> {
        Ok(strip_managed_fields(self.api.get(name).await?))
    }

    async fn list(&self) -> Result<Vec<DynamicObject>, ClientError> {
        let list = self.api.list(&ListParams::default()).await?;
        Ok(list.items.into_iter().map(strip_managed_fields).collect())
    }

    async fn watch(&self) -> Result<EventStream, ClientError> {
        let stream = watcher::watcher(self.api.clone(), watcher::Config::default()).default_backoff();
        info!(gvk = %self.key, ns = ?self.namespace, "watcher started");
        let mut seen: FxHashSet<String> = FxHashSet::default();
        let events = stream.flat_map(move |res| {
            let out: Vec<Result<WatchEvent, ClientError>> = match res {
                Ok(Event::Applied(o)) => vec![Ok(classify(&mut seen, o))],
                Ok(Event::Deleted(o)) => {
                    seen.remove(&seen_key(&o));
                    vec![Ok(WatchEvent::deleted(strip_managed_fields(o)))]
                }
                Ok(Event::Restarted(list)) => {
                    debug!(count = list.len(), "watch restart");
                    counter!("kubehub_watch_restarts", 1u64);
                    list.into_iter().map(|o| Ok(classify(&mut seen, o))).collect()
                }
                Err(e) => vec![Err(ClientError::Transport(e.to_string()))],
            };
            futures::stream::iter(out)
        });
        Ok(events.boxed())
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, ClientError> {
        Ok(self.api.create(&PostParams::default(), obj).await?)
    }

    async fn patch(&self, name: &str, patch: &serde_json::Value) -> Result<DynamicObject, ClientError> {
        Ok(self.api.patch(name, &PatchParams::default(), &Patch::Merge(patch)).await?)
    }

    async fn delete(&self, name: &str) -> Result<(), ClientError> {
        self.api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }
}
