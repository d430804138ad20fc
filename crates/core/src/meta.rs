//! Annotation helpers understood by the engine.

use kube::core::DynamicObject;
use kube::ResourceExt;

pub const ANNOTATION_PREFIX: &str = "converge.io/";
pub const ANNOTATION_SKIP_AWAIT: &str = "converge.io/skip-await";
pub const ANNOTATION_TIMEOUT_SECONDS: &str = "converge.io/timeout-seconds";

pub fn annotation<'a>(obj: &'a DynamicObject, key: &str) -> Option<&'a str> {
    obj.annotations().get(key).map(String::as_str)
}

pub fn is_annotation_true(obj: &DynamicObject, key: &str) -> bool {
    annotation(obj, key).map(|v| v.eq_ignore_ascii_case("true")).unwrap_or(false)
}

/// True when the object opts out of readiness checks.
pub fn skip_await(obj: &DynamicObject) -> bool {
    is_annotation_true(obj, ANNOTATION_SKIP_AWAIT)
}

/// Per-object timeout override. Unparseable values are ignored.
pub fn timeout_seconds(obj: &DynamicObject) -> Option<u64> {
    annotation(obj, ANNOTATION_TIMEOUT_SECONDS).and_then(|s| s.trim().parse().ok())
}
