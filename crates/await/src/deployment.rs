//! Deployment readiness.
//!
//! A Deployment is ready once its controller observed the latest generation,
//! every desired replica runs the new template, no old replica is still
//! terminating and all updated replicas are available.

use converge_core::{field_array, field_i64, Message};
use kube::core::DynamicObject;
use kube::ResourceExt;

use crate::config::{CreateAwaitConfig, DeleteAwaitConfig, UpdateAwaitConfig};
use crate::driver::{await_deleted, await_object, read_object, Evaluation};
use crate::error::AwaitError;

pub const DEFAULT_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_DELETE_TIMEOUT_SECS: u64 = 600;

/// Readiness of one Deployment version plus the status lines it produced.
pub fn evaluate(obj: &DynamicObject) -> (Evaluation, Vec<Message>) {
    let mut log = Vec::new();
    let mut subs = Vec::new();

    for c in field_array(obj, &["status", "conditions"]) {
        if c["type"] == "Progressing" && c["reason"] == "ProgressDeadlineExceeded" {
            let msg = c["message"].as_str().unwrap_or("");
            log.push(Message::warning(format!("[ProgressDeadlineExceeded] {}", msg)));
        }
    }

    let generation = obj.metadata.generation.unwrap_or(0);
    let observed = field_i64(obj, &["status", "observedGeneration"]).unwrap_or(0);
    let desired = field_i64(obj, &["spec", "replicas"]).unwrap_or(1);
    let replicas = field_i64(obj, &["status", "replicas"]).unwrap_or(0);
    let updated = field_i64(obj, &["status", "updatedReplicas"]).unwrap_or(0);
    let available = field_i64(obj, &["status", "availableReplicas"]).unwrap_or(0);

    if generation > observed {
        subs.push(format!("Deployment controller has not observed generation {} yet", generation));
        log.push(Message::info(format!("[1/2] Waiting for Deployment controller to observe generation {}", generation)));
        return (Evaluation::pending(subs), log);
    }
    if updated != desired {
        subs.push(format!("{} of {} replicas are updated", updated, desired));
    }
    if replicas != updated {
        subs.push(format!("{} old replicas are pending termination", replicas - updated));
    }
    if available < updated {
        subs.push(format!("{} of {} updated replicas are available", available, updated));
    }
    if subs.is_empty() {
        if desired == 0 {
            log.push(Message::warning(format!("Replicas scaled to 0 for Deployment {:?}", obj.name_any())));
        }
        log.push(Message::info("✅ Deployment initialization complete"));
        return (Evaluation::ready(), log);
    }
    log.push(Message::info(format!(
        "[2/2] Waiting for app ReplicaSet to be available ({}/{} Pods available)",
        available, desired
    )));
    (Evaluation::pending(subs), log)
}

fn logged(cfg: &CreateAwaitConfig) -> impl FnMut(&DynamicObject) -> Evaluation + '_ {
    move |obj| {
        let (state, log) = evaluate(obj);
        for m in &log {
            cfg.logger.log_message(m);
        }
        state
    }
}

pub async fn await_creation(cfg: CreateAwaitConfig) -> Result<(), AwaitError> {
    let timeout = cfg.timeout_or(DEFAULT_TIMEOUT_SECS);
    await_object(&cfg, timeout, false, logged(&cfg)).await.map(drop)
}

pub async fn await_update(cfg: UpdateAwaitConfig) -> Result<(), AwaitError> {
    let timeout = cfg.timeout_or(DEFAULT_TIMEOUT_SECS);
    await_object(&cfg, timeout, false, logged(&cfg)).await.map(drop)
}

pub async fn await_read(cfg: CreateAwaitConfig) -> Result<(), AwaitError> {
    read_object(&cfg, logged(&cfg)).await.map(drop)
}

/// Gone once it 404s or reports no replicas.
pub async fn await_deletion(cfg: DeleteAwaitConfig) -> Result<(), AwaitError> {
    let timeout = cfg.timeout_or(DEFAULT_DELETE_TIMEOUT_SECS);
    await_deleted(&cfg, timeout, |obj| {
        let replicas = field_i64(obj, &["status", "replicas"]).unwrap_or(0);
        (replicas != 0).then(|| replicas_still_exist(obj))
    })
    .await
}

/// `"<kind> '<name>' still exists (<status> / <spec> replicas exist)"`.
pub fn replicas_still_exist(obj: &DynamicObject) -> String {
    let kind = obj.types.as_ref().map(|t| t.kind.as_str()).unwrap_or("object");
    let current = field_i64(obj, &["status", "replicas"]).unwrap_or(0);
    let desired = field_i64(obj, &["spec", "replicas"]).unwrap_or(1);
    format!("{} '{}' still exists ({} / {} replicas exist)", kind.to_lowercase(), obj.name_any(), current, desired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use converge_core::Severity;
    use serde_json::json;

    fn deployment(generation: i64, status: serde_json::Value) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "apps/v1", "kind": "Deployment",
            "metadata": {"name": "web", "namespace": "prod", "generation": generation},
            "spec": {"replicas": 3},
            "status": status
        }))
        .expect("valid object")
    }

    #[test]
    fn fully_rolled_out_is_ready() {
        let (state, log) = evaluate(&deployment(
            1,
            json!({"observedGeneration": 1, "replicas": 3, "updatedReplicas": 3, "availableReplicas": 3}),
        ));
        assert!(state.ready);
        assert_eq!(log.last().map(|m| m.text.as_str()), Some("✅ Deployment initialization complete"));
    }

    #[test]
    fn unavailable_replica_is_reported() {
        let (state, _) = evaluate(&deployment(
            1,
            json!({"observedGeneration": 1, "replicas": 3, "updatedReplicas": 3, "availableReplicas": 2}),
        ));
        assert!(!state.ready);
        assert_eq!(state.sub_errors, vec!["2 of 3 updated replicas are available"]);
    }

    #[test]
    fn unobserved_generation_and_stale_replicas_block() {
        let (state, _) = evaluate(&deployment(
            2,
            json!({"observedGeneration": 1, "replicas": 3, "updatedReplicas": 3, "availableReplicas": 3}),
        ));
        assert!(!state.ready);
        let (state, _) = evaluate(&deployment(
            2,
            json!({"observedGeneration": 2, "replicas": 4, "updatedReplicas": 3, "availableReplicas": 3}),
        ));
        assert_eq!(state.sub_errors, vec!["1 old replicas are pending termination"]);
    }

    #[test]
    fn progress_deadline_only_warns() {
        let (state, log) = evaluate(&deployment(
            1,
            json!({"observedGeneration": 1, "replicas": 3, "updatedReplicas": 3, "availableReplicas": 3,
                   "conditions": [{"type": "Progressing", "status": "False", "reason": "ProgressDeadlineExceeded",
                                   "message": "ReplicaSet \"web-1\" has timed out progressing."}]}),
        ));
        assert!(state.ready);
        assert_eq!(log[0].severity, Severity::Warning);
        assert!(log[0].text.starts_with("[ProgressDeadlineExceeded]"));
    }

    #[test]
    fn deletion_message() {
        let obj = deployment(1, json!({"replicas": 2}));
        assert_eq!(replicas_still_exist(&obj), "deployment 'web' still exists (2 / 3 replicas exist)");
    }
}
