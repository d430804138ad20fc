//! Ordered readiness checks for Pods and Jobs.
//!
//! A checker evaluates its conditions in order and stops at the first one that
//! does not hold. Each condition reports a description (the status line) and,
//! when something looks wrong, a warning or error message.

use converge_core::{Message, Severity};
use k8s_openapi::api::batch::v1::{Job, JobCondition};
use k8s_openapi::api::core::v1::{ContainerStatus, Pod, PodCondition};
use kube::core::DynamicObject;
use serde::de::DeserializeOwned;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub description: String,
    pub ok: bool,
    pub message: Option<Message>,
}

impl CheckResult {
    fn pending(description: String) -> Self {
        Self { description, ok: false, message: None }
    }
}

pub type Condition<T> = fn(&T) -> CheckResult;

pub struct StateChecker<T> {
    conditions: Vec<Condition<T>>,
    ready_msg: &'static str,
}

impl<T> StateChecker<T> {
    pub fn ready_details(&self, obj: &T) -> (bool, Vec<CheckResult>) {
        let mut results = Vec::with_capacity(self.conditions.len() + 1);
        for condition in &self.conditions {
            let r = condition(obj);
            let ok = r.ok;
            results.push(r);
            if !ok {
                return (false, results);
            }
        }
        results.push(CheckResult { description: self.ready_msg.to_string(), ok: true, message: None });
        (true, results)
    }

    pub fn is_ready(&self, obj: &T) -> bool {
        self.ready_details(obj).0
    }
}

/// Messages at warning level or above from a set of results.
pub fn problems(results: &[CheckResult]) -> Vec<Message> {
    results
        .iter()
        .filter_map(|r| r.message.clone())
        .filter(|m| m.severity >= Severity::Warning)
        .collect()
}

/// Decode a dynamic object into its typed form.
pub fn typed<T: DeserializeOwned>(obj: &DynamicObject) -> Option<T> {
    serde_json::to_value(obj).ok().and_then(|v| serde_json::from_value(v).ok())
}

/// Ordered, de-duplicated diagnostics collected over an await run.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticSet {
    messages: Vec<Message>,
}

impl DiagnosticSet {
    pub fn add(&mut self, m: Message) {
        if !self.messages.contains(&m) {
            self.messages.push(m);
        }
    }

    pub fn texts(&self) -> Vec<String> {
        self.messages.iter().map(|m| m.text.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

fn fq_name(ns: Option<&str>, name: Option<&str>) -> String {
    let name = name.unwrap_or("");
    match ns {
        Some(ns) if !ns.is_empty() => format!("{}/{}", ns, name),
        _ => name.to_string(),
    }
}

// ---- Pod ----

pub fn pod_checker() -> StateChecker<Pod> {
    StateChecker { conditions: vec![pod_scheduled, pod_initialized, pod_ready], ready_msg: "✅ Pod ready" }
}

fn pod_name(pod: &Pod) -> String {
    fq_name(pod.metadata.namespace.as_deref(), pod.metadata.name.as_deref())
}

fn pod_condition<'a>(pod: &'a Pod, kind: &str) -> Option<&'a PodCondition> {
    pod.status.as_ref()?.conditions.as_ref()?.iter().find(|c| c.type_ == kind)
}

fn container_statuses(pod: &Pod) -> &[ContainerStatus] {
    pod.status.as_ref().and_then(|s| s.container_statuses.as_deref()).unwrap_or(&[])
}

fn pod_scheduled(pod: &Pod) -> CheckResult {
    let mut r = CheckResult::pending(format!("Waiting for Pod {:?} to be scheduled", pod_name(pod)));
    if let Some(c) = pod_condition(pod, "PodScheduled") {
        if c.status == "True" {
            r.ok = true;
        } else if let (Some(_), Some(msg)) = (non_empty(&c.reason), non_empty(&c.message)) {
            r.message = Some(Message::info(msg));
        }
    }
    r
}

fn pod_initialized(pod: &Pod) -> CheckResult {
    let mut r = CheckResult::pending(format!("Waiting for Pod {:?} to be initialized", pod_name(pod)));
    if let Some(c) = pod_condition(pod, "Initialized") {
        if c.status == "True" {
            r.ok = true;
        } else {
            let errs = container_errors(container_statuses(pod));
            r.message = Some(Message::warning(pod_error(c, &errs, &pod_name(pod))));
        }
    }
    r
}

fn pod_ready(pod: &Pod) -> CheckResult {
    let mut r = CheckResult::pending(format!("Waiting for Pod {:?} to be ready", pod_name(pod)));
    if let Some(c) = pod_condition(pod, "Ready") {
        let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
        if c.status == "True" || phase == Some("Succeeded") {
            r.ok = true;
        } else {
            let errs = container_errors(container_statuses(pod));
            r.message = Some(Message::warning(pod_error(c, &errs, &pod_name(pod))));
        }
    }
    r
}

fn non_empty(s: &Option<String>) -> Option<&str> {
    s.as_deref().filter(|s| !s.is_empty())
}

/// Errors of containers that are not ready.
pub fn container_errors(statuses: &[ContainerStatus]) -> Vec<String> {
    let mut errs = Vec::new();
    for status in statuses.iter().filter(|s| !s.ready) {
        let state = match status.state.as_ref() {
            Some(s) => s,
            None => continue,
        };
        if let Some(w) = state.waiting.as_ref() {
            let reason = w.reason.as_deref().unwrap_or("");
            if reason != "ContainerCreating" {
                errs.push(format!("[{}] {}", reason, trim_image_pull_msg(w.message.as_deref().unwrap_or(""))));
            }
        }
        if let Some(t) = state.terminated.as_ref() {
            match (non_empty(&t.reason), non_empty(&t.message)) {
                (None, _) => {}
                (Some(reason), Some(msg)) => errs.push(format!("[{}] {}", reason, trim_image_pull_msg(msg))),
                (Some(_), None) => {
                    errs.push(format!("Container {:?} completed with exit code {}", status.name, t.exit_code))
                }
            }
        }
    }
    errs
}

fn trim_image_pull_msg(msg: &str) -> &str {
    let msg = msg.strip_prefix("rpc error: code = Unknown desc = Error response from daemon: ").unwrap_or(msg);
    msg.strip_suffix(": manifest unknown").unwrap_or(msg)
}

fn pod_error(c: &PodCondition, errs: &[String], name: &str) -> String {
    let mut out = format!("[Pod {}]: ", name);
    if let (Some(_), Some(msg)) = (non_empty(&c.reason), non_empty(&c.message)) {
        out.push_str(msg);
    }
    for e in errs {
        out.push_str(" -- ");
        out.push_str(e);
    }
    out
}

// ---- Job ----

pub fn job_checker() -> StateChecker<Job> {
    StateChecker { conditions: vec![job_started, job_complete], ready_msg: "✅ Job succeeded" }
}

fn job_name(job: &Job) -> String {
    fq_name(job.metadata.namespace.as_deref(), job.metadata.name.as_deref())
}

fn job_conditions(job: &Job) -> &[JobCondition] {
    job.status.as_ref().and_then(|s| s.conditions.as_deref()).unwrap_or(&[])
}

fn job_started(job: &Job) -> CheckResult {
    let mut r = CheckResult::pending(format!("Waiting for Job {:?} to start", job_name(job)));
    r.ok = job.status.as_ref().and_then(|s| s.start_time.as_ref()).is_some();
    r
}

fn job_complete(job: &Job) -> CheckResult {
    let mut r = CheckResult::pending(format!("Waiting for Job {:?} to succeed", job_name(job)));
    let conditions = job_conditions(job);
    if let Some(failed) = conditions.iter().find(|c| c.type_ == "Failed" && c.status == "True") {
        let text = match (non_empty(&failed.reason), non_empty(&failed.message)) {
            (Some(reason), Some(msg)) => format!("[{}] {}", reason, msg),
            (Some(reason), None) => format!("[{}]", reason),
            _ => "Job failed".to_string(),
        };
        r.message = Some(Message::error(text));
        return r;
    }
    r.ok = conditions.iter().any(|c| c.type_ == "Complete" && c.status == "True");
    r
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pod(status: serde_json::Value) -> Pod {
        serde_json::from_value(json!({
            "apiVersion": "v1", "kind": "Pod",
            "metadata": {"name": "web-0", "namespace": "prod"},
            "status": status
        }))
        .expect("valid pod")
    }

    fn job(status: serde_json::Value) -> Job {
        serde_json::from_value(json!({
            "apiVersion": "batch/v1", "kind": "Job",
            "metadata": {"name": "migrate", "namespace": "prod"},
            "status": status
        }))
        .expect("valid job")
    }

    #[test]
    fn pod_short_circuits_at_first_unmet_condition() {
        let p = pod(json!({"conditions": [
            {"type": "PodScheduled", "status": "True"},
            {"type": "Initialized", "status": "False", "reason": "ContainersNotInitialized", "message": "init pending"},
            {"type": "Ready", "status": "True"}
        ]}));
        let (ready, results) = pod_checker().ready_details(&p);
        assert!(!ready);
        assert_eq!(results.len(), 2);
        assert_eq!(results[1].description, "Waiting for Pod \"prod/web-0\" to be initialized");
        assert_eq!(
            results[1].message.as_ref().map(|m| m.text.as_str()),
            Some("[Pod prod/web-0]: init pending")
        );
    }

    #[test]
    fn succeeded_pod_counts_as_ready() {
        let p = pod(json!({"phase": "Succeeded", "conditions": [
            {"type": "PodScheduled", "status": "True"},
            {"type": "Initialized", "status": "True"},
            {"type": "Ready", "status": "False", "reason": "PodCompleted"}
        ]}));
        let (ready, results) = pod_checker().ready_details(&p);
        assert!(ready);
        assert_eq!(results.last().map(|r| r.description.as_str()), Some("✅ Pod ready"));
    }

    #[test]
    fn container_errors_are_reported() {
        let p = pod(json!({"phase": "Pending", "conditions": [
            {"type": "PodScheduled", "status": "True"},
            {"type": "Initialized", "status": "True"},
            {"type": "Ready", "status": "False", "reason": "ContainersNotReady", "message": "containers with unready status: [app]"}
        ], "containerStatuses": [
            {"name": "app", "ready": false, "restartCount": 0, "image": "x", "imageID": "",
             "state": {"waiting": {"reason": "ErrImagePull",
               "message": "rpc error: code = Unknown desc = Error response from daemon: nginx:nope: manifest unknown"}}},
            {"name": "side", "ready": false, "restartCount": 1, "image": "y", "imageID": "",
             "state": {"terminated": {"reason": "Completed", "exitCode": 0}}},
            {"name": "boot", "ready": false, "restartCount": 0, "image": "z", "imageID": "",
             "state": {"waiting": {"reason": "ContainerCreating"}}}
        ]}));
        let (_, results) = pod_checker().ready_details(&p);
        let msgs = problems(&results);
        assert_eq!(msgs.len(), 1);
        assert_eq!(
            msgs[0].text,
            "[Pod prod/web-0]: containers with unready status: [app] -- [ErrImagePull] nginx:nope -- Container \"side\" completed with exit code 0"
        );
    }

    #[test]
    fn job_requires_start_and_completion() {
        let checker = job_checker();
        assert!(!checker.is_ready(&job(json!({}))));
        assert!(!checker.is_ready(&job(json!({"startTime": "2024-01-01T00:00:00Z"}))));
        assert!(checker.is_ready(&job(json!({
            "startTime": "2024-01-01T00:00:00Z",
            "conditions": [{"type": "Complete", "status": "True"}]
        }))));
    }

    #[test]
    fn failed_job_reports_error() {
        let (ready, results) = job_checker().ready_details(&job(json!({
            "startTime": "2024-01-01T00:00:00Z",
            "conditions": [{"type": "Failed", "status": "True", "reason": "BackoffLimitExceeded",
                            "message": "Job has reached the specified backoff limit"}]
        })));
        assert!(!ready);
        let msgs = problems(&results);
        assert_eq!(msgs[0].severity, Severity::Error);
        assert_eq!(msgs[0].text, "[BackoffLimitExceeded] Job has reached the specified backoff limit");
    }

    #[test]
    fn diagnostic_set_dedups_in_order() {
        let mut d = DiagnosticSet::default();
        d.add(Message::warning("a"));
        d.add(Message::warning("b"));
        d.add(Message::warning("a"));
        assert_eq!(d.texts(), vec!["a", "b"]);
    }
}
