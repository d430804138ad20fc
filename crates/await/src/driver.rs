//! Event loops shared by awaiters that follow a single object.
//!
//! [`await_object`] drives a readiness evaluation over the watch of one
//! object, optionally keeping track of the Pods it owns. [`await_deleted`]
//! polls until the object is gone.

use std::time::Duration;

use converge_core::{EventType, Messages, Severity, WatchEvent};
use kube::core::{DynamicObject, GroupVersionKind};
use kube::ResourceExt;
use tokio::time::sleep;
use tracing::debug;

use crate::aggregator::OwnedPods;
use crate::config::{CreateAwaitConfig, DeleteAwaitConfig};
use crate::error::AwaitError;
use crate::events::{ticker, EventSource};
use crate::poll::RetryError;

/// Result of checking one object version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Evaluation {
    pub ready: bool,
    pub sub_errors: Vec<String>,
}

impl Evaluation {
    pub fn ready() -> Self {
        Self { ready: true, sub_errors: Vec::new() }
    }

    pub fn pending(sub_errors: Vec<String>) -> Self {
        Self { ready: false, sub_errors }
    }
}

pub fn pod_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk("", "v1", "Pod")
}

/// Next event of an optional source; never completes when absent.
pub async fn next_event(src: &mut Option<EventSource>) -> Option<WatchEvent> {
    match src {
        Some(s) => s.recv().await,
        None => futures::future::pending().await,
    }
}

/// Next batch of an optional aggregation channel; never completes when absent.
pub async fn next_messages(rx: Option<&mut tokio::sync::mpsc::Receiver<Messages>>) -> Option<Messages> {
    match rx {
        Some(rx) => rx.recv().await,
        None => futures::future::pending().await,
    }
}

fn drain_own(events: &mut EventSource, name: &str, last: &mut DynamicObject) {
    while let Some(ev) = events.try_recv() {
        if ev.kind != EventType::Deleted && ev.object.name_any() == name {
            *last = ev.object;
        }
    }
}

/// Follow the target object until `eval` reports it ready.
///
/// The first evaluation uses a fresh `get`, whose errors are returned as is.
/// With `track_pods`, owned Pods are followed as well: their problems are
/// logged on every aggregation tick and appended to the sub-errors of a
/// timeout or cancellation.
pub async fn await_object<F>(
    cfg: &CreateAwaitConfig,
    timeout: Duration,
    track_pods: bool,
    mut eval: F,
) -> Result<DynamicObject, AwaitError>
where
    F: FnMut(&DynamicObject) -> Evaluation,
{
    let client = cfg.client().await?;
    let name = cfg.name().to_string();
    let mut last = client.get(&name).await?;
    let mut state = eval(&last);
    if state.ready {
        return Ok(last);
    }

    let mut events = EventSource::subscribe(client, cfg.id.gvk_key(), cfg.settings.watch_queue_cap).await?;
    let mut pod_events = if track_pods { Some(cfg.subscribe(&pod_gvk()).await?) } else { None };
    let mut pods = OwnedPods::default();
    let mut tick = ticker(cfg.settings.aggregate_period);
    let deadline = sleep(timeout);
    tokio::pin!(deadline);

    let with_pods = |state: &Evaluation, pods: &OwnedPods| {
        let mut subs = state.sub_errors.clone();
        subs.extend(pods.problems().into_iter().map(|m| m.text));
        subs
    };

    loop {
        tokio::select! {
            biased;
            _ = cfg.cancel.cancelled() => {
                drain_own(&mut events, &name, &mut last);
                let last_check = eval(&last);
                if last_check.ready {
                    return Ok(last);
                }
                return Err(AwaitError::cancelled(last, with_pods(&last_check, &pods)));
            }
            _ = &mut deadline => {
                return Err(AwaitError::timeout(last, with_pods(&state, &pods)));
            }
            Some(ev) = events.recv() => {
                if ev.object.name_any() != name {
                    continue;
                }
                if ev.kind == EventType::Deleted {
                    debug!(name = %name, "target deleted while awaiting");
                    continue;
                }
                last = ev.object;
                state = eval(&last);
                if state.ready {
                    return Ok(last);
                }
            }
            Some(ev) = next_event(&mut pod_events) => {
                pods.observe(&cfg.id, ev.kind, ev.object);
            }
            _ = tick.tick(), if track_pods => {
                for m in pods.problems() {
                    cfg.logger.log_message(&m);
                }
            }
        }
    }
}

/// One-shot readiness check of the live object.
pub async fn read_object<F>(cfg: &CreateAwaitConfig, mut eval: F) -> Result<DynamicObject, AwaitError>
where
    F: FnMut(&DynamicObject) -> Evaluation,
{
    let client = cfg.client().await?;
    let obj = client.get(cfg.name()).await?;
    let state = eval(&obj);
    if state.ready {
        Ok(obj)
    } else {
        Err(AwaitError::initialization(obj, state.sub_errors))
    }
}

/// Poll until the target is gone. `still_exists` renders the retry reason for
/// a live object, or `None` when that object already counts as deleted.
pub async fn await_deleted<F>(cfg: &DeleteAwaitConfig, timeout: Duration, mut still_exists: F) -> Result<(), AwaitError>
where
    F: FnMut(&DynamicObject) -> Option<String>,
{
    let mut last: Option<DynamicObject> = None;
    let poller = cfg.poller(cfg.client_for_resource.clone());
    let res = poller
        .retry_until(timeout, |res| match res {
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(RetryError::Fatal(e.clone().into())),
            Ok(obj) => {
                last = Some(obj.clone());
                match still_exists(obj) {
                    None => Ok(()),
                    Some(reason) => {
                        cfg.log_status(Severity::Info, &reason);
                        Err(RetryError::retryable(reason))
                    }
                }
            }
        })
        .await;
    match (res, last) {
        (Ok(()), _) => Ok(()),
        (Err(AwaitError::PollTimeout { sub_errors, .. }), Some(obj)) => Err(AwaitError::timeout(obj, sub_errors)),
        (Err(AwaitError::PollCancelled { .. }), Some(obj)) => Err(AwaitError::cancelled(obj, Vec::new())),
        (Err(e), _) => Err(e),
    }
}

/// Retry reason used when nothing more specific is known.
pub fn still_exists(obj: &DynamicObject) -> Option<String> {
    Some(format!("Object '{}' still exists", obj.name_any()))
}
