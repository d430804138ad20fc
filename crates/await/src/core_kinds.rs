//! Awaiters for the core kinds whose readiness is a single status check:
//! Namespace, PersistentVolume(Claim), ReplicationController, ResourceQuota,
//! Secret and ServiceAccount.

use std::time::Duration;

use converge_core::{field, field_array, field_i64, field_str, Severity};
use kube::core::{DynamicObject, GroupVersionKind};
use kube::ResourceExt;
use tracing::debug;

use crate::config::{CreateAwaitConfig, DeleteAwaitConfig, UpdateAwaitConfig};
use crate::deployment::replicas_still_exist;
use crate::driver::await_deleted;
use crate::error::AwaitError;

pub const NAMESPACE_DELETE_TIMEOUT_SECS: u64 = 300;
pub const VOLUME_TIMEOUT_SECS: u64 = 300;
pub const RC_TIMEOUT_SECS: u64 = 600;
pub const QUOTA_TIMEOUT_SECS: u64 = 60;
pub const SECRET_TIMEOUT_SECS: u64 = 5;
pub const SERVICE_ACCOUNT_TIMEOUT_SECS: u64 = 300;

pub const SERVICE_ACCOUNT_TOKEN: &str = "kubernetes.io/service-account-token";

/// Poll the target until `ready` holds, reporting the last seen object on
/// timeout or cancellation.
async fn poll_ready<F>(cfg: &CreateAwaitConfig, timeout: Duration, mut ready: F) -> Result<(), AwaitError>
where
    F: FnMut(&DynamicObject) -> bool,
{
    let client = cfg.client().await?;
    let mut last = cfg.outputs.clone();
    let res = cfg
        .poller(client)
        .watch_until(timeout, |obj| {
            last = obj.clone();
            ready(obj)
        })
        .await;
    match res {
        Ok(_) => Ok(()),
        Err(AwaitError::PollTimeout { sub_errors, .. }) => Err(AwaitError::timeout(last, sub_errors)),
        Err(AwaitError::PollCancelled { .. }) => Err(AwaitError::cancelled(last, Vec::new())),
        Err(e) => Err(e),
    }
}

// Namespace

pub async fn namespace_deletion(cfg: DeleteAwaitConfig) -> Result<(), AwaitError> {
    let timeout = cfg.timeout_or(NAMESPACE_DELETE_TIMEOUT_SECS);
    await_deleted(&cfg, timeout, namespace_still_exists).await
}

/// A Namespace without a phase is as good as gone.
pub fn namespace_still_exists(obj: &DynamicObject) -> Option<String> {
    let phase = field_str(obj, &["status", "phase"]).unwrap_or("");
    (!phase.is_empty()).then(|| format!("namespace '{}' still exists ({})", obj.name_any(), phase))
}

// PersistentVolume

pub fn volume_ready(obj: &DynamicObject) -> Option<&'static str> {
    match field_str(obj, &["status", "phase"]) {
        Some("Available") => Some("✅ PV marked available"),
        Some("Bound") => Some("✅ PV has been bound"),
        _ => None,
    }
}

pub async fn volume_creation(cfg: CreateAwaitConfig) -> Result<(), AwaitError> {
    let timeout = cfg.timeout_or(VOLUME_TIMEOUT_SECS);
    poll_ready(&cfg, timeout, |obj| match volume_ready(obj) {
        Some(line) => {
            cfg.log_status(Severity::Info, line);
            true
        }
        None => false,
    })
    .await
}

// PersistentVolumeClaim

pub fn storage_class_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk("storage.k8s.io", "v1", "StorageClass")
}

/// `volumeBindingMode` of the claim's StorageClass.
async fn bind_mode(cfg: &CreateAwaitConfig) -> Result<String, String> {
    let name = field_str(&cfg.outputs, &["spec", "storageClassName"]).unwrap_or("");
    if name.is_empty() {
        return Err(format!("no storage class found for {:?}", cfg.name()));
    }
    let client = cfg.client_for(&storage_class_gvk()).await.map_err(|e| format!("getting storageclass client: {}", e))?;
    let sc = client.get(name).await.map_err(|e| format!("getting storageclass {:?}: {}", name, e))?;
    Ok(field_str(&sc, &["volumeBindingMode"]).unwrap_or("").to_string())
}

/// Bound, or still Pending when binding waits for the first consumer.
pub fn claim_ready(obj: &DynamicObject, bind_mode: &str) -> bool {
    let phase = field_str(obj, &["status", "phase"]).unwrap_or("");
    if bind_mode == "WaitForFirstConsumer" {
        phase == "Pending"
    } else {
        phase == "Bound"
    }
}

pub async fn claim_creation(cfg: CreateAwaitConfig) -> Result<(), AwaitError> {
    let timeout = cfg.timeout_or(VOLUME_TIMEOUT_SECS);
    let mode = match bind_mode(&cfg).await {
        Ok(mode) => mode,
        Err(reason) => {
            cfg.log_status(Severity::Warning, &reason);
            String::new()
        }
    };
    poll_ready(&cfg, timeout, |obj| claim_ready(obj, &mode)).await
}

// ReplicationController

pub fn controller_ready(obj: &DynamicObject) -> bool {
    let desired = field_i64(obj, &["spec", "replicas"]);
    let available = field_i64(obj, &["status", "availableReplicas"]);
    debug!(name = %obj.name_any(), ?desired, ?available, "replication controller replicas");
    matches!((desired, available), (Some(d), Some(a)) if d == a)
}

pub async fn controller_creation(cfg: CreateAwaitConfig) -> Result<(), AwaitError> {
    let timeout = cfg.timeout_or(RC_TIMEOUT_SECS);
    poll_ready(&cfg, timeout, controller_ready).await
}

pub async fn controller_update(cfg: UpdateAwaitConfig) -> Result<(), AwaitError> {
    controller_creation(cfg.config).await
}

pub async fn controller_deletion(cfg: DeleteAwaitConfig) -> Result<(), AwaitError> {
    let timeout = cfg.timeout_or(RC_TIMEOUT_SECS);
    await_deleted(&cfg, timeout, |obj| Some(replicas_still_exist(obj))).await
}

// ResourceQuota

pub fn quota_ready(obj: &DynamicObject) -> bool {
    match (field(obj, &["spec", "hard"]), field(obj, &["status", "hard"])) {
        (Some(spec), Some(status)) if spec.is_object() && status.is_object() => spec == status,
        _ => false,
    }
}

pub async fn quota_creation(cfg: CreateAwaitConfig) -> Result<(), AwaitError> {
    let timeout = cfg.timeout_or(QUOTA_TIMEOUT_SECS);
    poll_ready(&cfg, timeout, quota_ready).await
}

pub fn quota_limits_changed(last: &DynamicObject, current: &DynamicObject) -> bool {
    field(last, &["spec", "hard"]) != field(current, &["spec", "hard"])
}

/// Only changed hard limits need the quota controller to catch up.
pub async fn quota_update(cfg: UpdateAwaitConfig) -> Result<(), AwaitError> {
    if !quota_limits_changed(&cfg.last_outputs, &cfg.outputs) {
        return Ok(());
    }
    quota_creation(cfg.config).await
}

// Secret

pub fn secret_populated(obj: &DynamicObject) -> bool {
    field(obj, &["data"]).and_then(|d| d.as_object()).map(|d| !d.is_empty()).unwrap_or(false)
}

/// Only token Secrets are filled in by a controller.
pub async fn secret_creation(cfg: CreateAwaitConfig) -> Result<(), AwaitError> {
    if field_str(&cfg.outputs, &["type"]) != Some(SERVICE_ACCOUNT_TOKEN) {
        return Ok(());
    }
    let timeout = cfg.timeout_or(SECRET_TIMEOUT_SECS);
    poll_ready(&cfg, timeout, secret_populated).await
}

// ServiceAccount

/// Since 1.24 no token Secret is generated for a ServiceAccount.
pub async fn service_account_creation(cfg: CreateAwaitConfig) -> Result<(), AwaitError> {
    if cfg.cluster_version.at_least(1, 24) {
        return Ok(());
    }
    let declared = field_array(&cfg.outputs, &["secrets"]).len();
    let timeout = cfg.timeout_or(SERVICE_ACCOUNT_TIMEOUT_SECS);
    poll_ready(&cfg, timeout, |sa| {
        let have = field_array(sa, &["secrets"]).len();
        debug!(name = %sa.name_any(), have, want = declared + 1, "service account secrets");
        have > declared
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn obj(kind: &str, body: Value) -> DynamicObject {
        let mut v = json!({"apiVersion": "v1", "kind": kind, "metadata": {"name": "x", "namespace": "prod"}});
        if let (Some(target), Some(extra)) = (v.as_object_mut(), body.as_object()) {
            for (k, val) in extra {
                target.insert(k.clone(), val.clone());
            }
        }
        serde_json::from_value(v).expect("valid object")
    }

    #[test]
    fn namespace_without_phase_is_gone() {
        assert_eq!(namespace_still_exists(&obj("Namespace", json!({"status": {}}))), None);
        assert_eq!(
            namespace_still_exists(&obj("Namespace", json!({"status": {"phase": "Terminating"}}))).as_deref(),
            Some("namespace 'x' still exists (Terminating)")
        );
    }

    #[test]
    fn volume_phases() {
        assert!(volume_ready(&obj("PersistentVolume", json!({"status": {"phase": "Bound"}}))).is_some());
        assert!(volume_ready(&obj("PersistentVolume", json!({"status": {"phase": "Available"}}))).is_some());
        assert!(volume_ready(&obj("PersistentVolume", json!({"status": {"phase": "Released"}}))).is_none());
    }

    #[test]
    fn claim_respects_binding_mode() {
        let pending = obj("PersistentVolumeClaim", json!({"status": {"phase": "Pending"}}));
        assert!(claim_ready(&pending, "WaitForFirstConsumer"));
        assert!(!claim_ready(&pending, "Immediate"));
        assert!(claim_ready(&obj("PersistentVolumeClaim", json!({"status": {"phase": "Bound"}})), ""));
    }

    #[test]
    fn controller_needs_reported_replicas() {
        assert!(controller_ready(&obj("ReplicationController", json!({"spec": {"replicas": 2}, "status": {"availableReplicas": 2}}))));
        assert!(!controller_ready(&obj("ReplicationController", json!({"spec": {"replicas": 2}, "status": {}}))));
    }

    #[test]
    fn quota_compares_hard_limits() {
        let q = obj("ResourceQuota", json!({"spec": {"hard": {"pods": "10"}}, "status": {"hard": {"pods": "10"}}}));
        assert!(quota_ready(&q));
        let q = obj("ResourceQuota", json!({"spec": {"hard": {"pods": "10"}}, "status": {"hard": {"pods": "5"}}}));
        assert!(!quota_ready(&q));
        assert!(!quota_ready(&obj("ResourceQuota", json!({"spec": {"hard": {"pods": "10"}}}))));
    }

    #[test]
    fn quota_update_only_tracks_hard_limits() {
        let before = obj("ResourceQuota", json!({"spec": {"hard": {"pods": "10"}, "scopes": ["BestEffort"]}}));
        let rescoped = obj("ResourceQuota", json!({"spec": {"hard": {"pods": "10"}, "scopes": ["NotBestEffort"]}}));
        let raised = obj("ResourceQuota", json!({"spec": {"hard": {"pods": "20"}, "scopes": ["BestEffort"]}}));
        assert!(!quota_limits_changed(&before, &rescoped));
        assert!(quota_limits_changed(&before, &raised));
    }

    #[test]
    fn secret_data_presence() {
        assert!(!secret_populated(&obj("Secret", json!({"data": {}}))));
        assert!(secret_populated(&obj("Secret", json!({"data": {"token": "dG9r"}}))));
    }
}
