//! Service readiness.
//!
//! A Service is ready once it targets Pods and, for `LoadBalancer`, got an
//! address. Endpoint changes only count after a quiet period without further
//! endpoint events. Headless and `ExternalName` Services do not wait for Pods.

use converge_core::{field_array, field_str, EventType, Severity, WatchEvent};
use kube::core::{DynamicObject, GroupVersionKind};
use kube::ResourceExt;
use tokio::time::sleep;
use tracing::debug;

use crate::config::{CreateAwaitConfig, UpdateAwaitConfig};
use crate::error::AwaitError;
use crate::events::{EventSource, SettleTimer};

pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

pub const NO_PODS_TARGETED: &str = "Service does not target any Pods. Selected Pods may not be ready, or field \
                                    '.spec.selector' may not match labels on any Pods";
pub const NO_ADDRESS: &str = "Service was not allocated an IP address; does your cloud provider support this?";

pub fn endpoints_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk("", "v1", "Endpoints")
}

/// Readiness flags of one Service and its Endpoints.
#[derive(Debug, Clone)]
pub struct ServiceState {
    name: String,
    pub service: DynamicObject,
    pub service_ready: bool,
    pub endpoints_ready: bool,
    pub endpoints_settled: bool,
}

impl ServiceState {
    pub fn new(service: DynamicObject) -> Self {
        Self {
            name: service.name_any(),
            service,
            service_ready: false,
            endpoints_ready: false,
            endpoints_settled: false,
        }
    }

    fn service_type(&self) -> &str {
        field_str(&self.service, &["spec", "type"]).unwrap_or("ClusterIP")
    }

    pub fn is_headless(&self) -> bool {
        field_str(&self.service, &["spec", "clusterIP"]) == Some("None")
    }

    pub fn is_external_name(&self) -> bool {
        self.service_type() == "ExternalName"
    }

    fn waits_for_pods(&self) -> bool {
        !(self.is_headless() || self.is_external_name())
    }

    pub fn process_service(&mut self, ev: WatchEvent) {
        if ev.object.name_any() != self.name {
            return;
        }
        self.service_ready = false;
        if ev.kind == EventType::Deleted {
            return;
        }
        self.service = ev.object;
        self.service_ready = if self.service_type() == "LoadBalancer" {
            !field_array(&self.service, &["status", "loadBalancer", "ingress"]).is_empty()
        } else {
            true
        };
    }

    /// Returns whether the event concerned this Service's Endpoints, in which
    /// case settlement starts over.
    pub fn process_endpoints(&mut self, ev: &WatchEvent) -> bool {
        if ev.object.name_any() != self.name {
            return false;
        }
        self.endpoints_ready =
            ev.kind != EventType::Deleted && !field_array(&ev.object, &["subsets"]).is_empty();
        self.endpoints_settled = false;
        true
    }

    /// Ready check plus the status line worth logging, if any.
    pub fn check(&self) -> (bool, Option<&'static str>) {
        if !self.waits_for_pods() {
            return (self.service_ready, None);
        }
        if self.service_ready && self.endpoints_settled && self.endpoints_ready {
            return (true, Some("✅ Service initialization complete"));
        }
        if self.endpoints_settled && self.endpoints_ready {
            return (false, Some("[2/3] Attempting to allocate IP address to Service"));
        }
        (false, None)
    }

    /// Ready on timeout or cancellation, settled or not.
    fn ready_at_deadline(&self) -> bool {
        self.service_ready && (self.endpoints_ready || !self.waits_for_pods())
    }

    pub fn error_messages(&self) -> Vec<String> {
        let mut out = Vec::new();
        if !self.waits_for_pods() {
            return out;
        }
        if !self.endpoints_ready {
            out.push(NO_PODS_TARGETED.to_string());
        }
        if self.service_type() == "LoadBalancer" && !self.service_ready {
            out.push(NO_ADDRESS.to_string());
        }
        out
    }
}

fn check_and_log(cfg: &CreateAwaitConfig, state: &ServiceState) -> bool {
    let (ready, line) = state.check();
    if let Some(line) = line {
        cfg.log_status(Severity::Info, line);
    }
    ready
}

pub async fn await_creation(cfg: CreateAwaitConfig) -> Result<(), AwaitError> {
    let timeout = cfg.timeout_or(DEFAULT_TIMEOUT_SECS);
    let client = cfg.client().await?;
    let current = client.get(cfg.name()).await?;
    let mut state = ServiceState::new(current.clone());
    state.process_service(WatchEvent::added(current));

    let mut services = EventSource::subscribe(client, cfg.id.gvk_key(), cfg.settings.watch_queue_cap).await?;
    let mut endpoints = cfg.subscribe(&endpoints_gvk()).await?;
    let mut settle = SettleTimer::new(cfg.settings.settle_period);
    let deadline = sleep(timeout);
    tokio::pin!(deadline);

    cfg.log_status(Severity::Info, "[1/3] Finding Pods to direct traffic to");
    loop {
        if check_and_log(&cfg, &state) {
            return Ok(());
        }
        tokio::select! {
            biased;
            _ = cfg.cancel.cancelled() => {
                while let Some(ev) = services.try_recv() {
                    state.process_service(ev);
                }
                while let Some(ev) = endpoints.try_recv() {
                    state.process_endpoints(&ev);
                }
                if state.ready_at_deadline() {
                    return Ok(());
                }
                return Err(AwaitError::cancelled(state.service.clone(), state.error_messages()));
            }
            _ = &mut deadline => {
                if state.ready_at_deadline() {
                    return Ok(());
                }
                return Err(AwaitError::timeout(state.service.clone(), state.error_messages()));
            }
            _ = settle.fired() => {
                state.endpoints_settled = true;
            }
            Some(ev) = services.recv() => {
                state.process_service(ev);
            }
            Some(ev) = endpoints.recv() => {
                if state.process_endpoints(&ev) {
                    settle.reset();
                }
            }
        }
    }
}

pub async fn await_update(cfg: UpdateAwaitConfig) -> Result<(), AwaitError> {
    await_creation(cfg.config).await
}

pub async fn await_read(cfg: CreateAwaitConfig) -> Result<(), AwaitError> {
    let client = cfg.client().await?;
    let service = client.get(cfg.name()).await?;
    let mut state = ServiceState::new(service.clone());
    state.process_service(WatchEvent::added(service));

    match cfg.client_for(&endpoints_gvk()).await?.list().await {
        Ok(list) => {
            for ep in list {
                state.process_endpoints(&WatchEvent::added(ep));
            }
        }
        Err(e) => debug!(name = %cfg.name(), error = %e, "failed to list endpoints"),
    }
    state.endpoints_settled = true;
    if check_and_log(&cfg, &state) {
        return Ok(());
    }
    Err(AwaitError::initialization(state.service.clone(), state.error_messages()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn svc(spec: serde_json::Value, status: serde_json::Value) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "v1", "kind": "Service",
            "metadata": {"name": "web", "namespace": "prod"},
            "spec": spec, "status": status
        }))
        .expect("valid object")
    }

    fn endpoints(subsets: serde_json::Value) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "v1", "kind": "Endpoints",
            "metadata": {"name": "web", "namespace": "prod"},
            "subsets": subsets
        }))
        .expect("valid object")
    }

    #[test]
    fn cluster_ip_waits_for_settled_endpoints() {
        let s = svc(json!({"type": "ClusterIP", "clusterIP": "10.0.0.1"}), json!({}));
        let mut state = ServiceState::new(s.clone());
        state.process_service(WatchEvent::added(s));
        assert!(state.service_ready);
        assert!(state.process_endpoints(&WatchEvent::added(endpoints(json!([{"addresses": [{"ip": "10.1.0.4"}]}])))));
        assert!(!state.check().0);
        state.endpoints_settled = true;
        assert_eq!(state.check(), (true, Some("✅ Service initialization complete")));
    }

    #[test]
    fn load_balancer_needs_ingress() {
        let s = svc(json!({"type": "LoadBalancer"}), json!({"loadBalancer": {}}));
        let mut state = ServiceState::new(s.clone());
        state.process_service(WatchEvent::added(s));
        state.process_endpoints(&WatchEvent::added(endpoints(json!([{"addresses": [{"ip": "10.1.0.4"}]}]))));
        state.endpoints_settled = true;
        assert_eq!(state.check(), (false, Some("[2/3] Attempting to allocate IP address to Service")));
        assert_eq!(state.error_messages(), vec![NO_ADDRESS.to_string()]);
        let s = svc(json!({"type": "LoadBalancer"}), json!({"loadBalancer": {"ingress": [{"ip": "1.2.3.4"}]}}));
        state.process_service(WatchEvent::modified(s));
        assert!(state.check().0);
    }

    #[test]
    fn headless_and_external_name_skip_endpoints() {
        for spec in [json!({"clusterIP": "None"}), json!({"type": "ExternalName", "externalName": "example.com"})] {
            let s = svc(spec, json!({}));
            let mut state = ServiceState::new(s.clone());
            state.process_service(WatchEvent::added(s));
            assert!(state.check().0);
            assert!(state.error_messages().is_empty());
        }
    }

    #[test]
    fn deleted_endpoints_are_not_ready() {
        let s = svc(json!({}), json!({}));
        let mut state = ServiceState::new(s);
        state.process_endpoints(&WatchEvent::added(endpoints(json!([{"addresses": [{"ip": "10.1.0.4"}]}]))));
        assert!(state.endpoints_ready);
        state.process_endpoints(&WatchEvent::deleted(endpoints(json!([{"addresses": [{"ip": "10.1.0.4"}]}]))));
        assert!(!state.endpoints_ready);
        assert_eq!(state.error_messages(), vec![NO_PODS_TARGETED.to_string()]);
    }
}
