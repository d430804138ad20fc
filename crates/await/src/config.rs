//! Per-call await configuration and engine-wide settings.

use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use converge_core::{gvk_key, meta, DedupLogger, ResourceId, ServerVersion, Severity, StatusSink, TracingSink};
use converge_kubehub::{ClientSet, ResourceClient};
use kube::core::{DynamicObject, GroupVersionKind};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::AwaitError;
use crate::events::EventSource;
use crate::poll::{ObjectPoller, RetryError, SleepingRetry};
use crate::removed::removed_at;

fn env_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key).ok().and_then(|s| s.parse::<u64>().ok()).map(Duration::from_millis).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key).ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(default)
}

/// Engine-wide tunables. Defaults match production behaviour.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Quiet period after the last Endpoints event.
    pub settle_period: Duration,
    /// Ingress: force settlement when no Endpoints event arrived by then.
    pub ingress_grace: Duration,
    /// Pod error batching period.
    pub aggregate_period: Duration,
    pub poll_base: Duration,
    pub poll_ceiling: Duration,
    pub watch_queue_cap: usize,
    pub acquire_retry: SleepingRetry,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            settle_period: Duration::from_secs(10),
            ingress_grace: Duration::from_secs(60),
            aggregate_period: Duration::from_secs(10),
            poll_base: Duration::from_millis(500),
            poll_ceiling: Duration::from_secs(30),
            watch_queue_cap: 256,
            acquire_retry: SleepingRetry::default(),
        }
    }
}

impl EngineSettings {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            settle_period: env_millis("CONVERGE_SETTLE_MS", d.settle_period),
            ingress_grace: env_millis("CONVERGE_INGRESS_GRACE_MS", d.ingress_grace),
            aggregate_period: env_millis("CONVERGE_AGGREGATE_MS", d.aggregate_period),
            poll_base: env_millis("CONVERGE_POLL_BASE_MS", d.poll_base),
            poll_ceiling: env_millis("CONVERGE_POLL_MAX_MS", d.poll_ceiling),
            watch_queue_cap: env_usize("CONVERGE_WATCH_QUEUE_CAP", d.watch_queue_cap).max(1),
            acquire_retry: d.acquire_retry,
        }
    }
}

/// Acquire a client for `gvk`, retrying while the kind is not yet served.
///
/// A kind known to be removed at the cluster's version fails immediately.
pub async fn acquire_client(
    client_set: &Arc<dyn ClientSet>,
    gvk: &GroupVersionKind,
    namespace: &str,
    cluster: ServerVersion,
    retry: SleepingRetry,
    cancel: &CancellationToken,
) -> Result<Arc<dyn ResourceClient>, AwaitError> {
    retry
        .run(cancel, move |attempt| async move {
            match client_set.resource_client(gvk, Some(namespace)).await {
                Ok(c) => Ok(c),
                Err(e) if e.is_no_match() && removed_at(gvk, cluster) => Err(RetryError::Fatal(e.into())),
                Err(e) if e.is_no_match() => {
                    debug!(gvk = %gvk_key(gvk), attempt, "kind not served yet; refreshing discovery");
                    client_set.invalidate().await;
                    Err(RetryError::Retryable(e.into()))
                }
                Err(e) => Err(RetryError::Fatal(e.into())),
            }
        })
        .await
}

/// Everything a create (and read) awaiter needs.
#[derive(Clone)]
pub struct CreateAwaitConfig {
    pub cancel: CancellationToken,
    pub id: ResourceId,
    pub initial_api_version: String,
    pub logger: Arc<dyn StatusSink>,
    pub client_set: Arc<dyn ClientSet>,
    /// Object as submitted.
    pub inputs: DynamicObject,
    /// Object as returned by the mutation.
    pub outputs: DynamicObject,
    pub timeout: Option<Duration>,
    pub cluster_version: ServerVersion,
    pub settings: EngineSettings,
}

impl CreateAwaitConfig {
    /// Config with default collaborators for `outputs`.
    pub fn new(client_set: Arc<dyn ClientSet>, gvk: GroupVersionKind, outputs: DynamicObject) -> Self {
        let id = ResourceId::from_object(&outputs, gvk);
        let initial_api_version = id.api_version();
        Self {
            cancel: CancellationToken::new(),
            logger: Arc::new(DedupLogger::new(Arc::new(TracingSink::new(id.to_string())))),
            id,
            initial_api_version,
            client_set,
            inputs: outputs.clone(),
            outputs,
            timeout: None,
            cluster_version: ServerVersion::new(1, 29),
            settings: EngineSettings::default(),
        }
    }

    pub fn with_inputs(mut self, inputs: DynamicObject) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Route status output through `sink`, deduplicated.
    pub fn with_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.logger = Arc::new(DedupLogger::new(sink));
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cluster_version(mut self, v: ServerVersion) -> Self {
        self.cluster_version = v;
        self
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn name(&self) -> &str {
        &self.id.name
    }

    /// Caller timeout, then the object's timeout annotation, then `default_secs`.
    pub fn timeout_or(&self, default_secs: u64) -> Duration {
        self.timeout
            .filter(|t| !t.is_zero())
            .or_else(|| meta::timeout_seconds(&self.inputs).filter(|s| *s > 0).map(Duration::from_secs))
            .unwrap_or(Duration::from_secs(default_secs))
    }

    pub fn log_status(&self, severity: Severity, message: &str) {
        self.logger.log_status(severity, message);
    }

    pub async fn client_for(&self, gvk: &GroupVersionKind) -> Result<Arc<dyn ResourceClient>, AwaitError> {
        acquire_client(
            &self.client_set,
            gvk,
            &self.id.namespace,
            self.cluster_version,
            self.settings.acquire_retry,
            &self.cancel,
        )
        .await
    }

    /// Client for the target's own kind.
    pub async fn client(&self) -> Result<Arc<dyn ResourceClient>, AwaitError> {
        self.client_for(&self.id.gvk).await
    }

    /// Subscribe to `gvk` in the target's namespace.
    pub async fn subscribe(&self, gvk: &GroupVersionKind) -> Result<EventSource, AwaitError> {
        let client = self.client_for(gvk).await?;
        Ok(EventSource::subscribe(client, gvk_key(gvk), self.settings.watch_queue_cap).await?)
    }

    pub fn poller(&self, client: Arc<dyn ResourceClient>) -> ObjectPoller {
        ObjectPoller::new(client, self.name(), self.cancel.clone())
            .with_backoff(self.settings.poll_base, self.settings.poll_ceiling)
    }
}

#[derive(Clone)]
pub struct UpdateAwaitConfig {
    pub config: CreateAwaitConfig,
    pub last_inputs: DynamicObject,
    pub last_outputs: DynamicObject,
}

impl Deref for UpdateAwaitConfig {
    type Target = CreateAwaitConfig;
    fn deref(&self) -> &Self::Target {
        &self.config
    }
}

#[derive(Clone)]
pub struct DeleteAwaitConfig {
    pub config: CreateAwaitConfig,
    pub client_for_resource: Arc<dyn ResourceClient>,
}

impl Deref for DeleteAwaitConfig {
    type Target = CreateAwaitConfig;
    fn deref(&self) -> &Self::Target {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use converge_kubehub::fake::FakeClientSet;
    use serde_json::json;

    fn deployment(annotations: serde_json::Value) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "apps/v1", "kind": "Deployment",
            "metadata": {"name": "web", "annotations": annotations}
        }))
        .expect("valid object")
    }

    #[test]
    fn timeout_precedence() {
        let set: Arc<dyn ClientSet> = Arc::new(FakeClientSet::new());
        let gvk = GroupVersionKind::gvk("apps", "v1", "Deployment");
        let cfg = CreateAwaitConfig::new(set, gvk, deployment(json!({(meta::ANNOTATION_TIMEOUT_SECONDS): "42"})));
        assert_eq!(cfg.id.namespace, "default");
        assert_eq!(cfg.timeout_or(600), Duration::from_secs(42));
        let cfg = cfg.with_timeout(Some(Duration::from_secs(7)));
        assert_eq!(cfg.timeout_or(600), Duration::from_secs(7));
        let cfg = cfg.with_timeout(Some(Duration::ZERO)).with_inputs(deployment(json!({})));
        assert_eq!(cfg.timeout_or(600), Duration::from_secs(600));
    }

    #[tokio::test(start_paused = true)]
    async fn acquisition_retries_unserved_kind() {
        let fake = Arc::new(FakeClientSet::new());
        let gvk = GroupVersionKind::gvk("example.com", "v1", "Widget");
        fake.fail_acquire(&gvk, 2);
        let set: Arc<dyn ClientSet> = fake.clone();
        let client = acquire_client(&set, &gvk, "default", ServerVersion::new(1, 29), SleepingRetry::default(), &CancellationToken::new()).await;
        assert!(client.is_ok());
        assert_eq!(fake.acquisitions(), 3);
        assert_eq!(fake.invalidations(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn acquisition_gives_up_after_bounded_retries() {
        let fake = Arc::new(FakeClientSet::new());
        let gvk = GroupVersionKind::gvk("example.com", "v1", "Widget");
        fake.remove_kind(&gvk);
        let set: Arc<dyn ClientSet> = fake.clone();
        let err = acquire_client(&set, &gvk, "default", ServerVersion::new(1, 29), SleepingRetry::default(), &CancellationToken::new())
            .await
            .err()
            .expect("no match");
        assert!(matches!(err, AwaitError::Client(ref e) if e.is_no_match()), "err={}", err);
        assert_eq!(fake.acquisitions(), 6);
    }

    #[tokio::test]
    async fn acquisition_fails_fast_for_removed_api() {
        let fake = Arc::new(FakeClientSet::new());
        let gvk = GroupVersionKind::gvk("extensions", "v1beta1", "Ingress");
        fake.remove_kind(&gvk);
        let set: Arc<dyn ClientSet> = fake.clone();
        let res = acquire_client(&set, &gvk, "default", ServerVersion::new(1, 22), SleepingRetry::default(), &CancellationToken::new()).await;
        assert!(res.is_err());
        assert_eq!(fake.acquisitions(), 1);
    }
}
