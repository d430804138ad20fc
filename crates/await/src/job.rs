//! Job completion.
//!
//! A Job is done once it started and reports `Complete`. A `Failed` condition
//! ends the await immediately. Problems of the Job's Pods are collected as
//! diagnostics but never fail it on their own.

use converge_core::{EventType, Messages, Severity};
use k8s_openapi::api::batch::v1::Job;
use kube::core::DynamicObject;
use kube::ResourceExt;
use tokio::time::sleep;

use crate::aggregator::PodAggregator;
use crate::config::{CreateAwaitConfig, DeleteAwaitConfig, UpdateAwaitConfig};
use crate::driver::{await_deleted, pod_gvk};
use crate::error::AwaitError;
use crate::events::EventSource;
use crate::states::{job_checker, problems, typed, DiagnosticSet, StateChecker};

pub const DEFAULT_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_DELETE_TIMEOUT_SECS: u64 = 300;

struct JobAwaiter<'a> {
    cfg: &'a CreateAwaitConfig,
    checker: StateChecker<Job>,
    errors: DiagnosticSet,
    job: DynamicObject,
}

impl<'a> JobAwaiter<'a> {
    fn new(cfg: &'a CreateAwaitConfig, job: DynamicObject) -> Self {
        Self { cfg, checker: job_checker(), errors: DiagnosticSet::default(), job }
    }

    /// Ready flag for `obj`; a failed Job is an initialization error.
    fn process(&mut self, obj: DynamicObject) -> Result<bool, AwaitError> {
        self.job = obj;
        let Some(job) = typed::<Job>(&self.job) else {
            return Ok(false);
        };
        let (ready, results) = self.checker.ready_details(&job);
        for r in &results {
            self.cfg.log_status(Severity::Info, &r.description);
        }
        let msgs = problems(&results);
        let failed = msgs.iter().any(|m| m.severity == Severity::Error);
        for m in msgs {
            self.errors.add(m);
        }
        if failed {
            return Err(AwaitError::initialization(self.job.clone(), self.errors.texts()));
        }
        Ok(ready)
    }

    fn process_pod_messages(&mut self, msgs: Messages) {
        for m in msgs.0 {
            // Unready containers are normal while a Job runs; they only surface as sub-errors.
            if !m.text.contains("containers with unready status") {
                self.cfg.logger.log_message(&m);
            }
            self.errors.add(m);
        }
    }
}

pub async fn await_creation(cfg: CreateAwaitConfig) -> Result<(), AwaitError> {
    let timeout = cfg.timeout_or(DEFAULT_TIMEOUT_SECS);
    let client = cfg.client().await?;
    let name = cfg.name().to_string();
    let current = client.get(&name).await?;
    let mut awaiter = JobAwaiter::new(&cfg, current.clone());
    if awaiter.process(current)? {
        return Ok(());
    }

    let mut events = EventSource::subscribe(client, cfg.id.gvk_key(), cfg.settings.watch_queue_cap).await?;
    let pod_client = cfg.client_for(&pod_gvk()).await?;
    let pod_events = cfg.subscribe(&pod_gvk()).await?;
    let mut aggregator = PodAggregator::new(cfg.id.clone(), pod_client);
    aggregator.start(pod_events);
    let deadline = sleep(timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            biased;
            _ = cfg.cancel.cancelled() => {
                while let Some(ev) = events.try_recv() {
                    if ev.object.name_any() == name {
                        awaiter.job = ev.object;
                    }
                }
                let last = awaiter.job.clone();
                if awaiter.process(last)? {
                    return Ok(());
                }
                return Err(AwaitError::cancelled(awaiter.job, awaiter.errors.texts()));
            }
            _ = &mut deadline => {
                return Err(AwaitError::timeout(awaiter.job, awaiter.errors.texts()));
            }
            Some(ev) = events.recv() => {
                if ev.object.name_any() != name || ev.kind == EventType::Deleted {
                    continue;
                }
                if awaiter.process(ev.object)? {
                    return Ok(());
                }
            }
            Some(msgs) = aggregator.result_chan().recv() => {
                awaiter.process_pod_messages(msgs);
            }
        }
    }
}

pub async fn await_update(cfg: UpdateAwaitConfig) -> Result<(), AwaitError> {
    await_creation(cfg.config).await
}

pub async fn await_read(cfg: CreateAwaitConfig) -> Result<(), AwaitError> {
    let client = cfg.client().await?;
    let job = client.get(cfg.name()).await?;
    let mut awaiter = JobAwaiter::new(&cfg, job.clone());
    if awaiter.process(job)? {
        return Ok(());
    }
    let pods = cfg.client_for(&pod_gvk()).await?;
    let aggregator = PodAggregator::new(cfg.id.clone(), pods);
    for m in aggregator.read().await.0 {
        cfg.logger.log_message(&m);
        awaiter.errors.add(m);
    }
    Err(AwaitError::initialization(awaiter.job, awaiter.errors.texts()))
}

pub async fn await_deletion(cfg: DeleteAwaitConfig) -> Result<(), AwaitError> {
    let timeout = cfg.timeout_or(DEFAULT_DELETE_TIMEOUT_SECS);
    await_deleted(&cfg, timeout, |obj| Some(format!("job '{}' still exists", obj.name_any()))).await
}
