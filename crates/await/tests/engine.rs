#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use converge_await::{AwaitError, AwaitRequest, Engine, Registry};
use converge_core::{meta, MemorySink, Severity, StatusSink};
use converge_kubehub::fake::FakeClientSet;
use converge_kubehub::ClientError;
use kube::core::{DynamicObject, GroupVersionKind};
use kube::ResourceExt;
use serde_json::{json, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn deployment_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk("apps", "v1", "Deployment")
}

fn object(v: Value) -> DynamicObject {
    serde_json::from_value(v).expect("valid object")
}

fn deployment(available: i64) -> DynamicObject {
    object(json!({
        "apiVersion": "apps/v1", "kind": "Deployment",
        "metadata": {"name": "web", "namespace": "prod", "generation": 1},
        "spec": {"replicas": 3},
        "status": {"observedGeneration": 1, "replicas": 3, "updatedReplicas": 3, "availableReplicas": available}
    }))
}

fn engine(fake: &Arc<FakeClientSet>) -> Engine {
    Engine::new(Registry::builtin(), fake.clone())
}

#[tokio::test(start_paused = true)]
async fn ready_deployment_completes_and_refreshes() {
    let fake = Arc::new(FakeClientSet::new());
    fake.collection(&deployment_gvk(), "prod").apply(deployment(3));
    let sink = Arc::new(MemorySink::new());

    let submitted = deployment(0);
    let got = engine(&fake)
        .creation(AwaitRequest::new(submitted).with_sink(sink.clone()))
        .await
        .expect("ready");
    assert_eq!(got.data["status"]["availableReplicas"], 3);
    assert!(sink.contains("✅ Deployment initialization complete"));
}

#[tokio::test(start_paused = true)]
async fn unavailable_replica_times_out_with_last_object() {
    let fake = Arc::new(FakeClientSet::new());
    fake.collection(&deployment_gvk(), "prod").apply(deployment(2));

    let started = Instant::now();
    let err = engine(&fake)
        .creation(AwaitRequest::new(deployment(2)).with_timeout(Duration::from_secs(30)))
        .await
        .expect_err("never ready");
    assert!(matches!(err, AwaitError::Timeout { .. }), "err={}", err);
    assert_eq!(started.elapsed(), Duration::from_secs(30));
    assert_eq!(err.sub_errors(), ["2 of 3 updated replicas are available"]);
    let last = err.object().expect("last object");
    assert_eq!(last.data["status"]["availableReplicas"], 2);
}

#[tokio::test(start_paused = true)]
async fn late_rollout_is_observed_through_the_watch() {
    let fake = Arc::new(FakeClientSet::new());
    let deps = fake.collection(&deployment_gvk(), "prod");
    deps.apply(deployment(1));

    let eng = engine(&fake);
    let task = tokio::spawn(async move { eng.creation(AwaitRequest::new(deployment(1))).await });
    tokio::time::sleep(Duration::from_secs(5)).await;
    deps.apply(deployment(3));
    let got = task.await.expect("join").expect("ready");
    assert_eq!(got.data["status"]["availableReplicas"], 3);
}

#[tokio::test(start_paused = true)]
async fn cancellation_before_readiness_reports_cancelled() {
    let fake = Arc::new(FakeClientSet::new());
    fake.collection(&deployment_gvk(), "prod").apply(deployment(1));
    let cancel = CancellationToken::new();

    let eng = engine(&fake);
    let req = AwaitRequest::new(deployment(1)).with_cancel(cancel.clone());
    let task = tokio::spawn(async move { eng.creation(req).await });
    tokio::time::sleep(Duration::from_secs(2)).await;
    cancel.cancel();
    let err = task.await.expect("join").expect_err("cancelled");
    assert!(matches!(err, AwaitError::Cancelled { .. }), "err={}", err);
    assert!(err.is_partial());
    assert_eq!(err.sub_errors(), ["1 of 3 updated replicas are available"]);
}

#[tokio::test(start_paused = true)]
async fn cancellation_racing_success_reports_success() {
    let fake = Arc::new(FakeClientSet::new());
    let deps = fake.collection(&deployment_gvk(), "prod");
    deps.apply(deployment(1));
    let cancel = CancellationToken::new();

    let eng = engine(&fake);
    let req = AwaitRequest::new(deployment(1)).with_cancel(cancel.clone());
    let task = tokio::spawn(async move { eng.creation(req).await });
    tokio::time::sleep(Duration::from_secs(2)).await;
    deps.apply(deployment(3));
    cancel.cancel();
    task.await.expect("join").expect("last-moment success wins");
}

#[tokio::test(start_paused = true)]
async fn statefulset_on_delete_skips_revision_check() {
    let fake = Arc::new(FakeClientSet::new());
    let gvk = GroupVersionKind::gvk("apps", "v1", "StatefulSet");
    let sts = object(json!({
        "apiVersion": "apps/v1", "kind": "StatefulSet",
        "metadata": {"name": "db", "namespace": "prod", "generation": 2},
        "spec": {"replicas": 2, "updateStrategy": {"type": "OnDelete"}},
        "status": {"replicas": 2, "readyReplicas": 2, "currentReplicas": 0, "updatedReplicas": 0,
                   "currentRevision": "db-1", "updateRevision": "db-2"}
    }));
    fake.collection(&gvk, "prod").apply(sts.clone());
    engine(&fake).update(AwaitRequest::new(sts.clone()), sts.clone(), sts).await.expect("ready");
}

#[tokio::test(start_paused = true)]
async fn skip_await_returns_without_touching_the_cluster() {
    let fake = Arc::new(FakeClientSet::new());
    let mut dep = deployment(0);
    dep.annotations_mut().insert(meta::ANNOTATION_SKIP_AWAIT.to_string(), "true".to_string());
    let got = engine(&fake).creation(AwaitRequest::new(dep)).await.expect("skipped");
    assert_eq!(got.name_any(), "web");
    assert_eq!(fake.acquisitions(), 0);
}

#[tokio::test(start_paused = true)]
async fn unknown_kind_succeeds_immediately() {
    let fake = Arc::new(FakeClientSet::new());
    let widget = object(json!({
        "apiVersion": "example.com/v1", "kind": "Widget",
        "metadata": {"name": "w", "namespace": "prod"}
    }));
    let got = engine(&fake).creation(AwaitRequest::new(widget)).await.expect("no await");
    assert_eq!(got.name_any(), "w");
}

#[tokio::test(start_paused = true)]
async fn failed_job_is_an_initialization_error() {
    let fake = Arc::new(FakeClientSet::new());
    let job = object(json!({
        "apiVersion": "batch/v1", "kind": "Job",
        "metadata": {"name": "migrate", "namespace": "prod"},
        "status": {"startTime": "2024-01-01T00:00:00Z",
                   "conditions": [{"type": "Failed", "status": "True", "reason": "BackoffLimitExceeded",
                                   "message": "Job has reached the specified backoff limit"}]}
    }));
    fake.collection(&GroupVersionKind::gvk("batch", "v1", "Job"), "prod").apply(job.clone());
    let err = engine(&fake).creation(AwaitRequest::new(job)).await.expect_err("failed");
    assert!(matches!(err, AwaitError::Initialization { .. }), "err={}", err);
    assert_eq!(err.sub_errors(), ["[BackoffLimitExceeded] Job has reached the specified backoff limit"]);
}

#[tokio::test(start_paused = true)]
async fn deletion_of_missing_object_succeeds() {
    let fake = Arc::new(FakeClientSet::new());
    engine(&fake).deletion(AwaitRequest::new(deployment(3))).await.expect("gone");
}

#[tokio::test(start_paused = true)]
async fn deletion_waits_until_object_disappears() {
    let fake = Arc::new(FakeClientSet::new());
    let pods = fake.collection(&GroupVersionKind::gvk("", "v1", "Pod"), "prod");
    let pod = object(json!({
        "apiVersion": "v1", "kind": "Pod",
        "metadata": {"name": "web-0", "namespace": "prod"},
        "status": {"phase": "Running"}
    }));
    pods.apply(pod.clone());

    let eng = engine(&fake);
    let task = tokio::spawn(async move { eng.deletion(AwaitRequest::new(pod)).await });
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(!task.is_finished());
    pods.remove("web-0");
    task.await.expect("join").expect("deleted");
}

#[tokio::test(start_paused = true)]
async fn deletion_timeout_reports_still_existing_object() {
    let fake = Arc::new(FakeClientSet::new());
    let pod = object(json!({
        "apiVersion": "v1", "kind": "Pod",
        "metadata": {"name": "web-0", "namespace": "prod"},
        "status": {"phase": "Running"}
    }));
    fake.collection(&GroupVersionKind::gvk("", "v1", "Pod"), "prod").apply(pod.clone());
    let err = engine(&fake)
        .deletion(AwaitRequest::new(pod).with_timeout(Duration::from_secs(5)))
        .await
        .expect_err("still there");
    assert!(matches!(err, AwaitError::Timeout { .. }), "err={}", err);
    assert_eq!(err.sub_errors(), ["pod 'web-0' still exists (Running phase)"]);
}

#[tokio::test(start_paused = true)]
async fn deletion_of_removed_custom_kind_succeeds() {
    let fake = Arc::new(FakeClientSet::new());
    let gvk = GroupVersionKind::gvk("example.com", "v1", "Widget");
    fake.remove_kind(&gvk);
    let widget = object(json!({
        "apiVersion": "example.com/v1", "kind": "Widget",
        "metadata": {"name": "w", "namespace": "prod"}
    }));
    engine(&fake).deletion(AwaitRequest::new(widget)).await.expect("kind gone, object gone");
}

#[tokio::test(start_paused = true)]
async fn generic_deletion_for_kinds_without_delete_slot() {
    let fake = Arc::new(FakeClientSet::new());
    let cm = object(json!({
        "apiVersion": "v1", "kind": "ConfigMap",
        "metadata": {"name": "settings", "namespace": "prod"}
    }));
    fake.collection(&GroupVersionKind::gvk("", "v1", "ConfigMap"), "prod").apply(cm.clone());
    let sink: Arc<dyn StatusSink> = Arc::new(MemorySink::new());
    let err = engine(&fake)
        .deletion(AwaitRequest::new(cm).with_timeout(Duration::from_secs(3)).with_sink(sink))
        .await
        .expect_err("still there");
    assert_eq!(err.sub_errors(), ["Object 'settings' still exists"]);
}

#[tokio::test(start_paused = true)]
async fn read_of_missing_object_is_not_found() {
    let fake = Arc::new(FakeClientSet::new());
    let err = engine(&fake).read(AwaitRequest::new(deployment(3))).await.expect_err("missing");
    assert!(err.is_not_found(), "err={}", err);
}

#[tokio::test(start_paused = true)]
async fn forbidden_during_deletion_is_surfaced_immediately() {
    let fake = Arc::new(FakeClientSet::new());
    let pods = fake.collection(&GroupVersionKind::gvk("", "v1", "Pod"), "prod");
    let pod = object(json!({
        "apiVersion": "v1", "kind": "Pod",
        "metadata": {"name": "web-0", "namespace": "prod"},
        "status": {"phase": "Running"}
    }));
    pods.apply(pod.clone());
    pods.fail_next_get(ClientError::Api { code: 403, reason: "Forbidden".into(), message: "pods \"web-0\" is forbidden".into() });

    let started = Instant::now();
    let err = engine(&fake)
        .deletion(AwaitRequest::new(pod).with_timeout(Duration::from_secs(5)))
        .await
        .expect_err("forbidden");
    assert!(matches!(err, AwaitError::Client(ClientError::Api { code: 403, .. })), "err={}", err);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn read_honours_skip_await() {
    let fake = Arc::new(FakeClientSet::new());
    let mut dep = deployment(1);
    dep.annotations_mut().insert(meta::ANNOTATION_SKIP_AWAIT.to_string(), "true".to_string());
    fake.collection(&deployment_gvk(), "prod").apply(dep.clone());
    let got = engine(&fake).read(AwaitRequest::new(dep)).await.expect("skipped");
    assert_eq!(got.data["status"]["availableReplicas"], 1);
}

#[tokio::test(start_paused = true)]
async fn read_of_unready_object_is_an_initialization_error() {
    let fake = Arc::new(FakeClientSet::new());
    fake.collection(&deployment_gvk(), "prod").apply(deployment(1));
    let err = engine(&fake).read(AwaitRequest::new(deployment(1))).await.expect_err("unready");
    assert!(matches!(err, AwaitError::Initialization { .. }), "err={}", err);
}

fn pod(ready: bool) -> DynamicObject {
    let status = if ready { "True" } else { "False" };
    object(json!({
        "apiVersion": "v1", "kind": "Pod",
        "metadata": {"name": "web-0", "namespace": "prod"},
        "status": {"phase": "Running", "conditions": [
            {"type": "PodScheduled", "status": "True"},
            {"type": "Initialized", "status": "True"},
            {"type": "Ready", "status": status}
        ]}
    }))
}

#[tokio::test(start_paused = true)]
async fn read_keeps_live_object_when_refresh_fails() {
    let fake = Arc::new(FakeClientSet::new());
    let pods = fake.collection(&GroupVersionKind::gvk("", "v1", "Pod"), "prod");
    pods.apply(pod(true));
    // Initial fetch and readiness check succeed, the refresh does not.
    pods.pass_next_get();
    pods.pass_next_get();
    pods.fail_next_get(ClientError::Transport("connection reset".into()));
    let got = engine(&fake).read(AwaitRequest::new(pod(true))).await.expect("ready");
    assert_eq!(got.name_any(), "web-0");
    assert_eq!(got.data["status"]["phase"], "Running");
}

#[tokio::test(start_paused = true)]
async fn pod_creation_waits_for_readiness() {
    let fake = Arc::new(FakeClientSet::new());
    let pods = fake.collection(&GroupVersionKind::gvk("", "v1", "Pod"), "prod");
    pods.apply(pod(false));
    let sink = Arc::new(MemorySink::new());

    let eng = engine(&fake);
    let req = AwaitRequest::new(pod(false)).with_sink(sink.clone());
    let started = Instant::now();
    let task = tokio::spawn(async move { eng.creation(req).await });
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(!task.is_finished());
    pods.apply(pod(true));
    task.await.expect("join").expect("ready");
    assert!(started.elapsed() < Duration::from_secs(4));
    assert!(sink.contains("✅ Pod ready"));
}

fn daemonset(ready: i64) -> DynamicObject {
    object(json!({
        "apiVersion": "apps/v1", "kind": "DaemonSet",
        "metadata": {"name": "agent", "namespace": "prod", "generation": 2},
        "status": {"observedGeneration": 2, "desiredNumberScheduled": 3, "currentNumberScheduled": 3,
                   "updatedNumberScheduled": 3, "numberReady": ready, "numberAvailable": ready,
                   "numberMisscheduled": 0}
    }))
}

#[tokio::test(start_paused = true)]
async fn daemonset_rollout_is_followed_through_the_watch() {
    let fake = Arc::new(FakeClientSet::new());
    let sets = fake.collection(&GroupVersionKind::gvk("apps", "v1", "DaemonSet"), "prod");
    sets.apply(daemonset(1));
    let sink = Arc::new(MemorySink::new());

    let eng = engine(&fake);
    let req = AwaitRequest::new(daemonset(1)).with_sink(sink.clone());
    let task = tokio::spawn(async move { eng.update(req, daemonset(3), daemonset(3)).await });
    tokio::time::sleep(Duration::from_secs(4)).await;
    sets.apply(daemonset(2));
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(!task.is_finished());
    sets.apply(daemonset(3));
    task.await.expect("join").expect("rolled out");
    assert!(sink.contains("Waiting for DaemonSet to roll out (2/3 Pods ready)"));
    assert!(sink.contains("✅ DaemonSet initialization complete"));
}

#[tokio::test(start_paused = true)]
async fn statefulset_timeout_includes_problems_of_its_pods() {
    let fake = Arc::new(FakeClientSet::new());
    let sts = object(json!({
        "apiVersion": "apps/v1", "kind": "StatefulSet",
        "metadata": {"name": "db", "namespace": "prod", "generation": 1},
        "spec": {"replicas": 1},
        "status": {"replicas": 1, "readyReplicas": 0, "currentReplicas": 1, "updatedReplicas": 1,
                   "currentRevision": "db-1", "updateRevision": "db-1"}
    }));
    fake.collection(&GroupVersionKind::gvk("apps", "v1", "StatefulSet"), "prod").apply(sts.clone());
    fake.collection(&GroupVersionKind::gvk("", "v1", "Pod"), "prod").apply(object(json!({
        "apiVersion": "v1", "kind": "Pod",
        "metadata": {
            "name": "db-0", "namespace": "prod",
            "ownerReferences": [{"apiVersion": "apps/v1", "kind": "StatefulSet", "name": "db", "uid": "u1"}]
        },
        "status": {
            "phase": "Running",
            "conditions": [{"type": "PodScheduled", "status": "True"}, {"type": "Initialized", "status": "True"},
                           {"type": "Ready", "status": "False"}],
            "containerStatuses": [{"name": "db", "ready": false, "restartCount": 4, "image": "db", "imageID": "",
                                   "state": {"waiting": {"reason": "CrashLoopBackOff", "message": "back-off restarting"}}}]
        }
    })));
    let sink = Arc::new(MemorySink::new());

    let err = engine(&fake)
        .creation(AwaitRequest::new(sts).with_timeout(Duration::from_secs(25)).with_sink(sink.clone()))
        .await
        .expect_err("pod keeps crashing");
    assert!(matches!(err, AwaitError::Timeout { .. }), "err={}", err);
    let subs = err.sub_errors();
    assert_eq!(subs[0], "0 out of 1 replicas succeeded readiness checks");
    assert!(subs.iter().any(|s| s.contains("prod/db-0") && s.contains("[CrashLoopBackOff] back-off restarting")), "{:?}", subs);
    // Logged by the periodic aggregation tick, not only at the deadline.
    assert!(sink
        .messages()
        .iter()
        .any(|m| m.severity == Severity::Warning && m.text.contains("CrashLoopBackOff")));
}
