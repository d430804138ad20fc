//! Declarative rollout status evaluation over numeric status fields.

use converge_core::pluck_i64;
use kube::core::DynamicObject;
use serde_json::Value;

/// Right-hand side of a rule.
#[derive(Debug, Clone, Copy)]
pub enum Target {
    /// Another field of the same object.
    Field(&'static [&'static str]),
    Const(i64),
}

#[derive(Debug, Clone, Copy)]
pub enum Cmp {
    Eq,
    AtLeast,
}

#[derive(Debug, Clone, Copy)]
pub struct Rule {
    pub label: &'static str,
    pub field: &'static [&'static str],
    pub cmp: Cmp,
    pub target: Target,
}

/// Outcome of evaluating every rule against one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub ready: bool,
    /// One line per unmet rule.
    pub unmet: Vec<String>,
}

/// A set of rules that must all hold. Absent fields count as zero; the
/// object must carry a `status` at all.
#[derive(Debug, Clone)]
pub struct RolloutEvaluator {
    rules: Vec<Rule>,
}

impl RolloutEvaluator {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    pub fn evaluate(&self, obj: &DynamicObject) -> Verdict {
        let doc = document(obj);
        if doc.get("status").map(Value::is_null).unwrap_or(true) {
            return Verdict { ready: false, unmet: vec!["status not reported yet".into()] };
        }
        let unmet: Vec<String> = self
            .rules
            .iter()
            .filter_map(|rule| {
                let have = pluck_i64(&doc, rule.field).unwrap_or(0);
                let want = match rule.target {
                    Target::Field(path) => pluck_i64(&doc, path).unwrap_or(0),
                    Target::Const(n) => n,
                };
                let ok = match rule.cmp {
                    Cmp::Eq => have == want,
                    Cmp::AtLeast => have >= want,
                };
                (!ok).then(|| format!("{}: {} (want {})", rule.label, have, want))
            })
            .collect();
        Verdict { ready: unmet.is_empty(), unmet }
    }
}

fn document(obj: &DynamicObject) -> Value {
    let mut doc = obj.data.clone();
    if let Value::Object(map) = &mut doc {
        map.insert("metadata".into(), serde_json::json!({"generation": obj.metadata.generation.unwrap_or(0)}));
    }
    doc
}

const DESIRED: Target = Target::Field(&["status", "desiredNumberScheduled"]);

/// DaemonSet rollout: the controller observed the latest generation and every
/// scheduled node runs a ready, updated Pod.
pub fn daemonset_rollout() -> RolloutEvaluator {
    RolloutEvaluator::new(vec![
        Rule {
            label: "observed generation",
            field: &["status", "observedGeneration"],
            cmp: Cmp::AtLeast,
            target: Target::Field(&["metadata", "generation"]),
        },
        Rule { label: "current pods", field: &["status", "currentNumberScheduled"], cmp: Cmp::Eq, target: DESIRED },
        Rule { label: "updated pods", field: &["status", "updatedNumberScheduled"], cmp: Cmp::Eq, target: DESIRED },
        Rule { label: "ready pods", field: &["status", "numberReady"], cmp: Cmp::Eq, target: DESIRED },
        Rule { label: "available pods", field: &["status", "numberAvailable"], cmp: Cmp::Eq, target: DESIRED },
        Rule {
            label: "misscheduled pods",
            field: &["status", "numberMisscheduled"],
            cmp: Cmp::Eq,
            target: Target::Const(0),
        },
    ])
}
