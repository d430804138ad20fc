//! Entry points: resolve the kind's operations, build the config, run the
//! await and refresh the object afterwards.

use std::sync::Arc;
use std::time::{Duration, Instant};

use converge_core::{gvk_key, gvk_of, meta, ServerVersion, StatusSink};
use converge_kubehub::{ClientError, ClientSet};
use kube::core::{DynamicObject, GroupVersionKind};
use kube::ResourceExt;
use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{acquire_client, CreateAwaitConfig, DeleteAwaitConfig, EngineSettings, UpdateAwaitConfig};
use crate::driver::{await_deleted, still_exists};
use crate::error::AwaitError;
use crate::registry::Registry;

pub const GENERIC_DELETE_TIMEOUT_SECS: u64 = 300;

/// One await call: the object before and after the mutation, plus how long
/// and under which cancellation to wait.
#[derive(Clone)]
pub struct AwaitRequest {
    pub inputs: DynamicObject,
    pub outputs: DynamicObject,
    pub timeout: Option<Duration>,
    pub cancel: CancellationToken,
    pub sink: Option<Arc<dyn StatusSink>>,
}

impl AwaitRequest {
    /// Request for an object that was submitted as-is.
    pub fn new(object: DynamicObject) -> Self {
        Self { inputs: object.clone(), outputs: object, timeout: None, cancel: CancellationToken::new(), sink: None }
    }

    pub fn with_inputs(mut self, inputs: DynamicObject) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.sink = Some(sink);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Op {
    Create,
    Update,
    Read,
    Delete,
}

impl Op {
    fn as_str(self) -> &'static str {
        match self {
            Op::Create => "create",
            Op::Update => "update",
            Op::Read => "read",
            Op::Delete => "delete",
        }
    }
}

fn record(op: Op, started: Instant, res: &Result<(), AwaitError>) {
    let op = op.as_str();
    histogram!("await_latency_ms", started.elapsed().as_secs_f64() * 1000.0, "op" => op);
    match res {
        Ok(()) => counter!("await_ok", 1u64, "op" => op),
        Err(AwaitError::Timeout { .. }) | Err(AwaitError::PollTimeout { .. }) => {
            counter!("await_timeout", 1u64, "op" => op)
        }
        Err(AwaitError::Cancelled { .. }) | Err(AwaitError::PollCancelled { .. }) => {
            counter!("await_cancelled", 1u64, "op" => op)
        }
        Err(_) => counter!("await_failed", 1u64, "op" => op),
    }
}

/// The await engine: a registry plus the shared cluster collaborators.
#[derive(Clone)]
pub struct Engine {
    registry: Arc<Registry>,
    client_set: Arc<dyn ClientSet>,
    settings: EngineSettings,
}

impl Engine {
    pub fn new(registry: Registry, client_set: Arc<dyn ClientSet>) -> Self {
        Self { registry: Arc::new(registry), client_set, settings: EngineSettings::default() }
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn gvk(obj: &DynamicObject) -> Result<GroupVersionKind, AwaitError> {
        gvk_of(obj).map_err(|e| AwaitError::Failed(e.to_string()))
    }

    async fn cluster_version(&self) -> ServerVersion {
        match self.client_set.server_version().await {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "server version unavailable; assuming a current cluster");
                ServerVersion::new(1, 29)
            }
        }
    }

    async fn config(&self, gvk: GroupVersionKind, req: &AwaitRequest) -> CreateAwaitConfig {
        let mut cfg = CreateAwaitConfig::new(self.client_set.clone(), gvk, req.outputs.clone())
            .with_inputs(req.inputs.clone())
            .with_cancel(req.cancel.clone())
            .with_timeout(req.timeout)
            .with_cluster_version(self.cluster_version().await)
            .with_settings(self.settings.clone());
        if let Some(sink) = &req.sink {
            cfg = cfg.with_sink(sink.clone());
        }
        cfg
    }

    fn skipped(op: Op, gvk: &GroupVersionKind, obj: &DynamicObject) -> bool {
        if !meta::skip_await(obj) {
            return false;
        }
        counter!("await_skipped", 1u64, "op" => op.as_str());
        info!(gvk = %gvk_key(gvk), name = %obj.name_any(), op = op.as_str(), "skipping await");
        true
    }

    /// Latest version of the target; falls back to `last` on any error.
    async fn refresh(cfg: &CreateAwaitConfig, last: &DynamicObject) -> DynamicObject {
        let fetched = match cfg.client().await {
            Ok(client) => client.get(cfg.name()).await.map_err(AwaitError::from),
            Err(e) => Err(e),
        };
        fetched.unwrap_or_else(|e| {
            debug!(name = %cfg.name(), error = %e, "refresh failed; keeping last known object");
            last.clone()
        })
    }

    fn log_missing(op: Op, gvk: &GroupVersionKind, name: &str, known: bool) {
        if known {
            debug!(gvk = %gvk_key(gvk), name = %name, op = op.as_str(), "no await logic for kind");
        } else {
            info!(gvk = %gvk_key(gvk), name = %name, op = op.as_str(), "unknown kind; not waiting for readiness");
        }
    }

    /// Wait for a freshly created object to become ready.
    pub async fn creation(&self, req: AwaitRequest) -> Result<DynamicObject, AwaitError> {
        let gvk = Self::gvk(&req.outputs)?;
        if Self::skipped(Op::Create, &gvk, &req.inputs) {
            return Ok(req.outputs);
        }
        counter!("await_started", 1u64, "op" => Op::Create.as_str());
        let started = Instant::now();
        let cfg = self.config(gvk.clone(), &req).await;
        let spec = self.registry.lookup(&gvk);
        let res = match spec.and_then(|s| s.create.clone()) {
            Some(f) => f(cfg.clone()).await,
            None => {
                Self::log_missing(Op::Create, &gvk, cfg.name(), spec.is_some());
                Ok(())
            }
        };
        record(Op::Create, started, &res);
        res?;
        Ok(Self::refresh(&cfg, &req.outputs).await)
    }

    /// Wait for an updated object to converge again.
    pub async fn update(
        &self,
        req: AwaitRequest,
        last_inputs: DynamicObject,
        last_outputs: DynamicObject,
    ) -> Result<DynamicObject, AwaitError> {
        let gvk = Self::gvk(&req.outputs)?;
        if Self::skipped(Op::Update, &gvk, &req.inputs) {
            return Ok(req.outputs);
        }
        counter!("await_started", 1u64, "op" => Op::Update.as_str());
        let started = Instant::now();
        let cfg = self.config(gvk.clone(), &req).await;
        let spec = self.registry.lookup(&gvk);
        let res = match spec.and_then(|s| s.update.clone()) {
            Some(f) => f(UpdateAwaitConfig { config: cfg.clone(), last_inputs, last_outputs }).await,
            None => {
                Self::log_missing(Op::Update, &gvk, cfg.name(), spec.is_some());
                Ok(())
            }
        };
        record(Op::Update, started, &res);
        res?;
        Ok(Self::refresh(&cfg, &req.outputs).await)
    }

    /// Check readiness of an existing object once, without waiting.
    ///
    /// A missing object surfaces as an unwrapped not-found client error.
    pub async fn read(&self, req: AwaitRequest) -> Result<DynamicObject, AwaitError> {
        let gvk = Self::gvk(&req.outputs)?;
        let cfg = self.config(gvk.clone(), &req).await;
        let live = cfg.client().await?.get(cfg.name()).await?;
        if Self::skipped(Op::Read, &gvk, &req.inputs) {
            return Ok(live);
        }
        counter!("await_started", 1u64, "op" => Op::Read.as_str());
        let started = Instant::now();
        let res = match self.registry.lookup(&gvk).and_then(|s| s.read.clone()) {
            Some(f) => f(cfg.clone()).await,
            None => Ok(()),
        };
        record(Op::Read, started, &res);
        res?;
        Ok(Self::refresh(&cfg, &live).await)
    }

    /// Wait for a deleted object to disappear.
    ///
    /// A kind that is no longer served counts as deleted.
    pub async fn deletion(&self, req: AwaitRequest) -> Result<(), AwaitError> {
        let gvk = Self::gvk(&req.outputs)?;
        if Self::skipped(Op::Delete, &gvk, &req.inputs) {
            return Ok(());
        }
        counter!("await_started", 1u64, "op" => Op::Delete.as_str());
        let started = Instant::now();
        let cfg = self.config(gvk.clone(), &req).await;
        let client = match acquire_client(
            &cfg.client_set,
            &gvk,
            &cfg.id.namespace,
            cfg.cluster_version,
            cfg.settings.acquire_retry,
            &cfg.cancel,
        )
        .await
        {
            Ok(c) => c,
            Err(AwaitError::Client(e)) if e.is_no_match() || e.is_not_found() => {
                debug!(gvk = %gvk_key(&gvk), name = %cfg.name(), "kind no longer served; treating as deleted");
                record(Op::Delete, started, &Ok(()));
                return Ok(());
            }
            Err(e) => {
                let res = Err(e);
                record(Op::Delete, started, &res);
                return res;
            }
        };
        let dcfg = DeleteAwaitConfig { config: cfg, client_for_resource: client };
        let res = match self.registry.lookup(&gvk).and_then(|s| s.delete.clone()) {
            Some(f) => f(dcfg).await,
            None => {
                let timeout = dcfg.timeout_or(GENERIC_DELETE_TIMEOUT_SECS);
                await_deleted(&dcfg, timeout, still_exists).await
            }
        };
        let res = match res {
            Err(AwaitError::Client(e)) if e.is_no_match() => Ok(()),
            other => other,
        };
        record(Op::Delete, started, &res);
        res
    }
}

/// Preview-time classification: a missing namespace means "not yet
/// resolvable" rather than a failure.
pub fn preview_error(obj: &DynamicObject, err: ClientError) -> AwaitError {
    if err.is_namespace_not_found() {
        AwaitError::namespace(obj.clone())
    } else {
        AwaitError::Client(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn preview_defers_on_missing_namespace() {
        let obj: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "cm", "namespace": "team-a"}
        }))
        .expect("valid object");
        let e = preview_error(&obj, ClientError::NamespaceNotFound("team-a".into()));
        assert!(matches!(e, AwaitError::Namespace { .. }));
        let e = preview_error(&obj, ClientError::Transport("boom".into()));
        assert!(matches!(e, AwaitError::Client(_)));
    }
}
