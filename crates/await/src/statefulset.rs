//! StatefulSet readiness: every replica ready on the update revision.

use converge_core::{field_i64, field_str, Message};
use kube::core::DynamicObject;

use crate::config::{CreateAwaitConfig, DeleteAwaitConfig, UpdateAwaitConfig};
use crate::deployment::replicas_still_exist;
use crate::driver::{await_deleted, await_object, read_object, Evaluation};
use crate::error::AwaitError;

pub const DEFAULT_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_DELETE_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolloutState {
    pub replicas_ready: bool,
    pub revision_ready: bool,
    pub current_replicas: i64,
    pub target_replicas: i64,
    pub current_revision: String,
    pub update_revision: String,
    pub generation: i64,
}

impl RolloutState {
    pub fn of(obj: &DynamicObject) -> Self {
        let generation = obj.metadata.generation.unwrap_or(0);
        let on_delete = field_str(obj, &["spec", "updateStrategy", "type"]) == Some("OnDelete");
        let current_revision = field_str(obj, &["status", "currentRevision"]).unwrap_or("").to_string();
        let update_revision = field_str(obj, &["status", "updateRevision"]).unwrap_or("").to_string();
        let count = |path: &[&str]| field_i64(obj, path).unwrap_or(0);
        let target = field_i64(obj, &["spec", "replicas"]).unwrap_or(1);
        let replicas = count(&["status", "replicas"]);
        let ready = count(&["status", "readyReplicas"]);
        let current = count(&["status", "currentReplicas"]);
        let updated = count(&["status", "updatedReplicas"]);

        let (revision_ready, replicas_ready) = if generation > 1 && on_delete {
            (true, target == replicas && target == ready)
        } else {
            (
                !current_revision.is_empty() && current_revision == update_revision,
                target == replicas && target == ready && target == current,
            )
        };
        // Ready replicas of the previous revision do not count during a rollout.
        let current_replicas = if revision_ready { ready } else { ready.min(updated) };

        Self {
            replicas_ready,
            revision_ready,
            current_replicas,
            target_replicas: target,
            current_revision,
            update_revision,
            generation,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.replicas_ready && self.revision_ready
    }

    pub fn status_line(&self) -> String {
        if self.is_ready() {
            return "✅ StatefulSet initialization complete".into();
        }
        if self.generation <= 1 {
            return format!(
                "[1/2] Waiting for StatefulSet to create Pods ({}/{} Pods ready)",
                self.current_replicas, self.target_replicas
            );
        }
        if !self.replicas_ready {
            return format!(
                "[1/3] Waiting for StatefulSet update to roll out ({}/{} Pods ready)",
                self.current_replicas, self.target_replicas
            );
        }
        "[2/3] Waiting for StatefulSet to update .status.currentRevision".into()
    }

    pub fn sub_errors(&self) -> Vec<String> {
        let mut out = Vec::new();
        if !self.replicas_ready {
            out.push(format!(
                "{} out of {} replicas succeeded readiness checks",
                self.current_replicas, self.target_replicas
            ));
        }
        if !self.revision_ready {
            out.push(format!(
                "StatefulSet controller failed to advance from revision {:?} to revision {:?}",
                self.current_revision, self.update_revision
            ));
        }
        out
    }
}

fn logged(cfg: &CreateAwaitConfig) -> impl FnMut(&DynamicObject) -> Evaluation + '_ {
    move |obj| {
        let state = RolloutState::of(obj);
        cfg.logger.log_message(&Message::info(state.status_line()));
        if state.is_ready() {
            Evaluation::ready()
        } else {
            Evaluation::pending(state.sub_errors())
        }
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
    await_deleted(&cfg, timeout, |obj| Some(replicas_still_exist(obj))).await
}
