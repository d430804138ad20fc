//! Ingress readiness.
//!
//! Every rule path must point at a Service whose Endpoints object exists, and
//! the controller must publish an address in `.status.loadBalancer.ingress`.
//! Backends that will never produce Endpoints (`ExternalName` Services,
//! resource backends, missing Services) are tolerated once the Endpoints
//! stream settled, either after a quiet period or when the grace period
//! passed without any Endpoints event at all.

use converge_core::{field_array, field_str, pluck_array, pluck_str, EventType, Severity, WatchEvent};
use kube::core::{DynamicObject, GroupVersionKind};
use kube::ResourceExt;
use rustc_hash::FxHashSet;
use tokio::time::sleep;
use tracing::debug;

use crate::config::{CreateAwaitConfig, UpdateAwaitConfig};
use crate::error::AwaitError;
use crate::events::{EventSource, SettleTimer};
use crate::service::endpoints_gvk;

pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

pub const UNAVAILABLE_ENDPOINT: &str = "Ingress has at least one rule with an unavailable target endpoint.";
pub const NO_ADDRESS: &str = "Ingress .status.loadBalancer field was not updated with a hostname/IP address.";

pub fn service_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk("", "v1", "Service")
}

/// One rule path and the Service it routes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    pub host: String,
    pub path: String,
    pub service: String,
}

impl Backend {
    /// `"host/path" -> "service"`, with `"" (default path)` when both are empty.
    pub fn describe(&self) -> String {
        let rule = format!("{}{}", self.host, self.path);
        let rule = if rule.is_empty() { "\"\" (default path)".to_string() } else { format!("{:?}", rule) };
        format!("{} -> {:?}", rule, self.service)
    }
}

/// Service backends of `ingress`. Resource backends are left out.
pub fn backends(ingress: &DynamicObject) -> Vec<Backend> {
    let legacy = matches!(
        ingress.types.as_ref().map(|t| t.api_version.as_str()),
        Some("extensions/v1beta1") | Some("networking.k8s.io/v1beta1")
    );
    let mut out = Vec::new();
    for rule in field_array(ingress, &["spec", "rules"]) {
        let host = pluck_str(rule, &["host"]).unwrap_or("");
        for path in pluck_array(rule, &["http", "paths"]) {
            let service = if legacy {
                pluck_str(path, &["backend", "serviceName"])
            } else {
                pluck_str(path, &["backend", "service", "name"])
            };
            let Some(service) = service.filter(|s| !s.is_empty()) else {
                continue;
            };
            out.push(Backend {
                host: host.to_string(),
                path: pluck_str(path, &["path"]).unwrap_or("").to_string(),
                service: service.to_string(),
            });
        }
    }
    out
}

#[derive(Debug, Clone)]
pub struct IngressState {
    name: String,
    pub ingress: DynamicObject,
    pub ingress_ready: bool,
    pub endpoints_settled: bool,
    pub endpoint_events: u64,
    known_endpoints: FxHashSet<String>,
    external_names: FxHashSet<String>,
}

impl IngressState {
    pub fn new(ingress: DynamicObject) -> Self {
        Self {
            name: ingress.name_any(),
            ingress,
            ingress_ready: false,
            endpoints_settled: false,
            endpoint_events: 0,
            known_endpoints: FxHashSet::default(),
            external_names: FxHashSet::default(),
        }
    }

    pub fn process_ingress(&mut self, ev: WatchEvent) {
        if ev.object.name_any() != self.name {
            return;
        }
        self.ingress_ready = false;
        if ev.kind == EventType::Deleted {
            return;
        }
        self.ingress = ev.object;
        self.ingress_ready = !field_array(&self.ingress, &["status", "loadBalancer", "ingress"]).is_empty();
        debug!(name = %self.name, ready = self.ingress_ready, "ingress observed");
    }

    pub fn process_service(&mut self, ev: &WatchEvent) {
        let name = ev.object.name_any();
        if ev.kind == EventType::Deleted {
            self.external_names.remove(&name);
            return;
        }
        if field_str(&ev.object, &["spec", "type"]) == Some("ExternalName") {
            self.external_names.insert(name);
        }
    }

    /// Any Endpoints event restarts settlement.
    pub fn process_endpoints(&mut self, ev: &WatchEvent) {
        self.endpoint_events += 1;
        let name = ev.object.name_any();
        match ev.kind {
            EventType::Added | EventType::Modified => {
                self.known_endpoints.insert(name);
            }
            EventType::Deleted => {
                self.known_endpoints.remove(&name);
            }
        }
        self.endpoints_settled = false;
    }

    /// Grace period over: with no Endpoints event so far, none is expected.
    pub fn grace_expired(&mut self) {
        if self.endpoint_events == 0 {
            self.endpoints_settled = true;
        }
    }

    /// Backends still lacking Endpoints, ignoring `ExternalName` Services.
    pub fn unmatched(&self) -> Vec<Backend> {
        backends(&self.ingress)
            .into_iter()
            .filter(|b| !self.external_names.contains(&b.service) && !self.known_endpoints.contains(&b.service))
            .collect()
    }

    /// Unmatched backends block readiness until settlement.
    pub fn endpoints_ready(&self) -> bool {
        self.endpoints_settled || self.unmatched().is_empty()
    }

    pub fn is_ready(&self) -> bool {
        self.ingress_ready && self.endpoints_ready()
    }

    pub fn error_messages(&self) -> Vec<String> {
        let mut out = Vec::new();
        if !self.endpoints_ready() {
            out.push(UNAVAILABLE_ENDPOINT.to_string());
        }
        if !self.ingress_ready {
            out.push(NO_ADDRESS.to_string());
        }
        out
    }
}

fn check_and_log(cfg: &CreateAwaitConfig, state: &IngressState) -> bool {
    if !state.endpoints_ready() {
        return false;
    }
    for b in state.unmatched() {
        cfg.log_status(Severity::Warning, &format!("No matching service found for ingress rule: {}", b.describe()));
    }
    if state.ingress_ready {
        cfg.log_status(Severity::Info, "✅ Ingress initialization complete");
        return true;
    }
    cfg.log_status(Severity::Info, "[2/3] Waiting for update of .status.loadBalancer with hostname/IP");
    false
}

pub async fn await_creation(cfg: CreateAwaitConfig) -> Result<(), AwaitError> {
    let timeout = cfg.timeout_or(DEFAULT_TIMEOUT_SECS);
    let client = cfg.client().await?;
    let current = client.get(cfg.name()).await?;
    let mut state = IngressState::new(current.clone());
    state.process_ingress(WatchEvent::added(current));

    let mut ingresses = EventSource::subscribe(client, cfg.id.gvk_key(), cfg.settings.watch_queue_cap).await?;
    let mut endpoints = cfg.subscribe(&endpoints_gvk()).await?;
    let mut services = cfg.subscribe(&service_gvk()).await?;
    let mut settle = SettleTimer::new(cfg.settings.settle_period);
    let grace = sleep(cfg.settings.ingress_grace);
    tokio::pin!(grace);
    let mut grace_done = false;
    let deadline = sleep(timeout);
    tokio::pin!(deadline);

    cfg.log_status(Severity::Info, "[1/3] Finding a matching service for each Ingress path");
    loop {
        if check_and_log(&cfg, &state) {
            return Ok(());
        }
        tokio::select! {
            biased;
            _ = cfg.cancel.cancelled() => {
                while let Some(ev) = ingresses.try_recv() {
                    state.process_ingress(ev);
                }
                if state.is_ready() {
                    return Ok(());
                }
                return Err(AwaitError::cancelled(state.ingress.clone(), state.error_messages()));
            }
            _ = &mut deadline => {
                if state.is_ready() {
                    return Ok(());
                }
                return Err(AwaitError::timeout(state.ingress.clone(), state.error_messages()));
            }
            _ = &mut grace, if !grace_done => {
                grace_done = true;
                state.grace_expired();
            }
            _ = settle.fired() => {
                state.endpoints_settled = true;
            }
            Some(ev) = ingresses.recv() => {
                state.process_ingress(ev);
            }
            Some(ev) = endpoints.recv() => {
                state.process_endpoints(&ev);
                settle.reset();
            }
            Some(ev) = services.recv() => {
                state.process_service(&ev);
            }
        }
    }
}

pub async fn await_update(cfg: UpdateAwaitConfig) -> Result<(), AwaitError> {
    await_creation(cfg.config).await
}

async fn list_or_empty(cfg: &CreateAwaitConfig, gvk: &GroupVersionKind) -> Result<Vec<DynamicObject>, AwaitError> {
    match cfg.client_for(gvk).await?.list().await {
        Ok(list) => Ok(list),
        Err(e) => {
            debug!(name = %cfg.name(), kind = %gvk.kind, error = %e, "listing for ingress read failed");
            Ok(Vec::new())
        }
    }
}

pub async fn await_read(cfg: CreateAwaitConfig) -> Result<(), AwaitError> {
    let client = cfg.client().await?;
    let ingress = client.get(cfg.name()).await?;
    let mut state = IngressState::new(ingress.clone());
    state.process_ingress(WatchEvent::added(ingress));
    for svc in list_or_empty(&cfg, &service_gvk()).await? {
        state.process_service(&WatchEvent::added(svc));
    }
    for ep in list_or_empty(&cfg, &endpoints_gvk()).await? {
        state.process_endpoints(&WatchEvent::added(ep));
    }
    state.endpoints_settled = true;
    if check_and_log(&cfg, &state) {
        return Ok(());
    }
    Err(AwaitError::initialization(state.ingress.clone(), state.error_messages()))
}
