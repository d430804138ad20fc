//! DaemonSet readiness, evaluated by the generic rollout rules.
//!
//! `RollingUpdate` and `OnDelete` converge to the same status shape; with
//! `OnDelete` the Pods only move once something else deletes them, which this
//! awaiter merely observes.

use converge_core::{field_i64, field_str, Message};
use kube::core::DynamicObject;
use kube::ResourceExt;

use crate::config::{CreateAwaitConfig, DeleteAwaitConfig, UpdateAwaitConfig};
use crate::driver::{await_deleted, await_object, read_object, Evaluation};
use crate::error::AwaitError;
use crate::rollout::{daemonset_rollout, RolloutEvaluator};

pub const DEFAULT_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_DELETE_TIMEOUT_SECS: u64 = 600;

pub fn evaluate(rules: &RolloutEvaluator, obj: &DynamicObject) -> (Evaluation, Message) {
    let verdict = rules.evaluate(obj);
    if verdict.ready {
        return (Evaluation::ready(), Message::info("✅ DaemonSet initialization complete"));
    }
    let desired = field_i64(obj, &["status", "desiredNumberScheduled"]).unwrap_or(0);
    let ready = field_i64(obj, &["status", "numberReady"]).unwrap_or(0);
    let line = if field_str(obj, &["spec", "updateStrategy", "type"]) == Some("OnDelete") {
        format!("Waiting for DaemonSet Pods to be replaced ({}/{} Pods ready)", ready, desired)
    } else {
        format!("Waiting for DaemonSet to roll out ({}/{} Pods ready)", ready, desired)
    };
    (Evaluation::pending(verdict.unmet), Message::info(line))
}

fn logged(cfg: &CreateAwaitConfig) -> impl FnMut(&DynamicObject) -> Evaluation + '_ {
    let rules = daemonset_rollout();
    move |obj| {
        let (state, line) = evaluate(&rules, obj);
        cfg.logger.log_message(&line);
        state
    }
}

pub async fn await_creation(cfg: CreateAwaitConfig) -> Result<(), AwaitError> {
    let timeout = cfg.timeout_or(DEFAULT_TIMEOUT_SECS);
    await_object(&cfg, timeout, true, logged(&cfg)).await.map(drop)
}

pub async fn await_update(cfg: UpdateAwaitConfig) -> Result<(), AwaitError> {
    let timeout = cfg.timeout_or(DEFAULT_TIMEOUT_SECS);
    await_object(&cfg, timeout, true, logged(&cfg)).await.map(drop)
}

pub async fn await_read(cfg: CreateAwaitConfig) -> Result<(), AwaitError> {
    read_object(&cfg, logged(&cfg)).await.map(drop)
}

pub async fn await_deletion(cfg: DeleteAwaitConfig) -> Result<(), AwaitError> {
    let timeout = cfg.timeout_or(DEFAULT_DELETE_TIMEOUT_SECS);
    await_deleted(&cfg, timeout, |obj| Some(format!("daemonset '{}' still exists", obj.name_any()))).await
}
