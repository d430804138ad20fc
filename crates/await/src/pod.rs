//! Pod readiness: scheduled, initialized, then ready (or succeeded).

use converge_core::{field_str, Severity};
use k8s_openapi::api::core::v1::Pod;
use kube::core::DynamicObject;
use kube::ResourceExt;

use crate::config::{CreateAwaitConfig, DeleteAwaitConfig, UpdateAwaitConfig};
use crate::driver::{await_deleted, await_object, read_object, Evaluation};
use crate::error::AwaitError;
use crate::states::{pod_checker, problems, typed, StateChecker};

pub const DEFAULT_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_DELETE_TIMEOUT_SECS: u64 = 300;

fn logged(cfg: &CreateAwaitConfig) -> impl FnMut(&DynamicObject) -> Evaluation + '_ {
    let checker: StateChecker<Pod> = pod_checker();
    move |obj| {
        let Some(pod) = typed::<Pod>(obj) else {
            return Evaluation::pending(vec![format!("object {:?} is not a valid Pod", obj.name_any())]);
        };
        let (ready, results) = checker.ready_details(&pod);
        for r in &results {
            cfg.log_status(Severity::Info, &r.description);
        }
        let subs = problems(&results).into_iter().map(|m| m.text).collect();
        Evaluation { ready, sub_errors: subs }
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

pub async fn await_deletion(cfg: DeleteAwaitConfig) -> Result<(), AwaitError> {
    let timeout = cfg.timeout_or(DEFAULT_DELETE_TIMEOUT_SECS);
    await_deleted(&cfg, timeout, |obj| Some(still_exists(obj))).await
}

/// `"pod '<name>' still exists (<phase> phase)"`.
pub fn still_exists(obj: &DynamicObject) -> String {
    let phase = field_str(obj, &["status", "phase"]).unwrap_or("");
    format!("pod '{}' still exists ({} phase)", obj.name_any(), phase)
}
