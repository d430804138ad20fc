//! Pods related to an owner resource and the warnings they produce.

use std::sync::Arc;

use converge_core::{EventType, Message, Messages, ResourceId, DEFAULT_NAMESPACE};
use converge_kubehub::ResourceClient;
use k8s_openapi::api::core::v1::Pod;
use kube::core::DynamicObject;
use kube::ResourceExt;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::events::EventSource;
use crate::states::{pod_checker, problems, typed};

/// Collapse the historical API groups of workload kinds onto `apps/v1`.
pub fn canonical_api_version<'a>(kind: &str, api_version: &'a str) -> &'a str {
    match (kind, api_version) {
        ("Deployment" | "DaemonSet" | "ReplicaSet", "extensions/v1beta1" | "apps/v1beta1" | "apps/v1beta2") => "apps/v1",
        ("StatefulSet", "apps/v1beta1" | "apps/v1beta2") => "apps/v1",
        (_, v) => v,
    }
}

fn namespace_of(obj: &DynamicObject) -> String {
    obj.namespace().filter(|ns| !ns.is_empty()).unwrap_or_else(|| DEFAULT_NAMESPACE.to_string())
}

/// Some owner reference of `obj` names `owner`, comparing canonical apiVersions.
pub fn is_owned_by(obj: &DynamicObject, owner: &ResourceId) -> bool {
    let kind = owner.gvk.kind.as_str();
    let owner_version = owner.api_version();
    let want = canonical_api_version(kind, &owner_version);
    obj.owner_references()
        .iter()
        .any(|r| r.kind == kind && r.name == owner.name && canonical_api_version(&r.kind, &r.api_version) == want)
}

/// Same namespace, same generation and owned by `owner`.
pub fn related_resource(owner: &ResourceId, obj: &DynamicObject) -> bool {
    namespace_of(obj) == owner.namespace
        && obj.metadata.generation.unwrap_or(0) == owner.generation
        && is_owned_by(obj, owner)
}

/// Namespace match plus ownership; Pod generations are not tied to their owner's.
pub fn owned_pod(owner: &ResourceId, obj: &DynamicObject) -> bool {
    namespace_of(obj) == owner.namespace && is_owned_by(obj, owner)
}

pub type PodFilter = fn(&ResourceId, &DynamicObject) -> bool;

/// Warning and error messages from one Pod.
pub fn pod_problems(obj: &DynamicObject) -> Vec<Message> {
    match typed::<Pod>(obj) {
        Some(pod) => problems(&pod_checker().ready_details(&pod).1),
        None => {
            debug!(name = %obj.name_any(), "skipping undecodable pod");
            Vec::new()
        }
    }
}

/// Watches Pods and reports problems of those belonging to one owner.
///
/// `start` runs the filter on a background task feeding [`result_chan`];
/// [`read`] is a one-shot pass over the current listing.
///
/// [`result_chan`]: PodAggregator::result_chan
/// [`read`]: PodAggregator::read
pub struct PodAggregator {
    owner: ResourceId,
    lister: Arc<dyn ResourceClient>,
    filter: PodFilter,
    stop: CancellationToken,
    tx: Option<mpsc::Sender<Messages>>,
    rx: mpsc::Receiver<Messages>,
}

impl PodAggregator {
    pub fn new(owner: ResourceId, lister: Arc<dyn ResourceClient>) -> Self {
        let (tx, rx) = mpsc::channel(16);
        Self { owner, lister, filter: owned_pod, stop: CancellationToken::new(), tx: Some(tx), rx }
    }

    pub fn with_filter(mut self, filter: PodFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Start filtering `events`. A second call is ignored.
    pub fn start(&mut self, mut events: EventSource) {
        let Some(tx) = self.tx.take() else {
            return;
        };
        let owner = self.owner.clone();
        let filter = self.filter;
        let stop = self.stop.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    ev = events.recv() => match ev {
                        Some(ev) => ev,
                        None => break,
                    },
                };
                if event.kind == EventType::Deleted || !filter(&owner, &event.object) {
                    continue;
                }
                let msgs: Messages = pod_problems(&event.object).into_iter().collect();
                if msgs.is_empty() {
                    continue;
                }
                tokio::select! {
                    _ = stop.cancelled() => break,
                    sent = tx.send(msgs) => if sent.is_err() { break },
                }
            }
            debug!(owner = %owner, "pod aggregator stopped");
        });
    }

    /// Messages from the running aggregation. Closed once stopped.
    pub fn result_chan(&mut self) -> &mut mpsc::Receiver<Messages> {
        &mut self.rx
    }

    /// Problems of the current related Pods. Listing failures yield nothing.
    pub async fn read(&self) -> Messages {
        let pods = match self.lister.list().await {
            Ok(pods) => pods,
            Err(e) => {
                debug!(owner = %self.owner, error = %e, "failed to list pods");
                return Messages::default();
            }
        };
        pods.iter()
            .filter(|p| (self.filter)(&self.owner, p))
            .flat_map(pod_problems)
            .collect()
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }
}

impl Drop for PodAggregator {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Latest state of owned Pods, checked on demand.
///
/// Workload awaiters keep this up to date from pod events and flush the
/// problems on the aggregation ticker.
#[derive(Default)]
pub struct OwnedPods {
    pods: FxHashMap<String, DynamicObject>,
}

impl OwnedPods {
    pub fn observe(&mut self, owner: &ResourceId, kind: EventType, pod: DynamicObject) {
        if !owned_pod(owner, &pod) {
            return;
        }
        let name = pod.name_any();
        if kind == EventType::Deleted {
            self.pods.remove(&name);
        } else {
            self.pods.insert(name, pod);
        }
    }

    pub fn problems(&self) -> Vec<Message> {
        let mut names: Vec<&String> = self.pods.keys().collect();
        names.sort();
        names.into_iter().filter_map(|n| self.pods.get(n)).flat_map(pod_problems).collect()
    }

    pub fn len(&self) -> usize {
        self.pods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pods.is_empty()
    }
}
