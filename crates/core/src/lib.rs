//! Converge core types: resource identity, watch events and status sinks.

#![forbid(unsafe_code)]

use std::fmt;

use kube::core::{DynamicObject, GroupVersionKind};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod meta;
pub mod status;
pub mod version;

pub use status::{DedupLogger, MemorySink, Message, Messages, Severity, StatusSink, TracingSink};
pub use version::ServerVersion;

/// Namespace assigned to objects that do not carry one.
pub const DEFAULT_NAMESPACE: &str = "default";

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid gvk key: {0} (expect v1/Kind or group/v1/Kind)")]
    InvalidGvkKey(String),
    #[error("object {0} is missing apiVersion/kind")]
    MissingTypeMeta(String),
    #[error("invalid server version: {0}")]
    InvalidVersion(String),
}

/// Identity of the resource an await run is about.
///
/// Used to correlate incidental objects (Pods, Endpoints) back to their owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceId {
    pub name: String,
    pub namespace: String,
    pub gvk: GroupVersionKind,
    pub generation: i64,
}

impl ResourceId {
    pub fn from_object(obj: &DynamicObject, gvk: GroupVersionKind) -> Self {
        let namespace = obj
            .namespace()
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
        Self {
            name: obj.name_any(),
            namespace,
            gvk,
            generation: obj.metadata.generation.unwrap_or(0),
        }
    }

    pub fn api_version(&self) -> String {
        api_version(&self.gvk)
    }

    pub fn gvk_key(&self) -> String {
        gvk_key(&self.gvk)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Render a GVK as "v1/Kind" or "group/v1/Kind".
pub fn gvk_key(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}/{}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    }
}

pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind, CoreError> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind::gvk("", version, kind))
        }
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind::gvk(group, version, kind))
        }
        _ => Err(CoreError::InvalidGvkKey(key.to_string())),
    }
}

/// `apiVersion` string for a GVK ("v1" or "group/version").
pub fn api_version(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        gvk.version.clone()
    } else {
        format!("{}/{}", gvk.group, gvk.version)
    }
}

/// Split an `apiVersion` string into `(group, version)`.
pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

/// GVK of a dynamic object, taken from its `apiVersion`/`kind`.
pub fn gvk_of(obj: &DynamicObject) -> Result<GroupVersionKind, CoreError> {
    let types = obj
        .types
        .as_ref()
        .ok_or_else(|| CoreError::MissingTypeMeta(obj.name_any()))?;
    let (group, version) = split_api_version(&types.api_version);
    Ok(GroupVersionKind::gvk(group, version, &types.kind))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventType {
    Added,
    Modified,
    Deleted,
}

/// One notification from a kind-scoped subscription.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub kind: EventType,
    pub object: DynamicObject,
}

impl WatchEvent {
    pub fn added(object: DynamicObject) -> Self {
        Self { kind: EventType::Added, object }
    }
    pub fn modified(object: DynamicObject) -> Self {
        Self { kind: EventType::Modified, object }
    }
    pub fn deleted(object: DynamicObject) -> Self {
        Self { kind: EventType::Deleted, object }
    }
}

/// Walk a JSON path of object keys.
pub fn pluck<'a>(v: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(v, |cur, key| cur.get(*key))
}

pub fn pluck_str<'a>(v: &'a Value, path: &[&str]) -> Option<&'a str> {
    pluck(v, path).and_then(Value::as_str)
}

pub fn pluck_i64(v: &Value, path: &[&str]) -> Option<i64> {
    pluck(v, path).and_then(Value::as_i64)
}

pub fn pluck_array<'a>(v: &'a Value, path: &[&str]) -> &'a [Value] {
    pluck(v, path)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// Field lookup on the body (`spec`, `status`, `data`...) of a dynamic object.
pub fn field<'a>(obj: &'a DynamicObject, path: &[&str]) -> Option<&'a Value> {
    pluck(&obj.data, path)
}

pub fn field_str<'a>(obj: &'a DynamicObject, path: &[&str]) -> Option<&'a str> {
    pluck_str(&obj.data, path)
}

pub fn field_i64(obj: &DynamicObject, path: &[&str]) -> Option<i64> {
    pluck_i64(&obj.data, path)
}

pub fn field_array<'a>(obj: &'a DynamicObject, path: &[&str]) -> &'a [Value] {
    pluck_array(&obj.data, path)
}

/// Build a dynamic object from a JSON manifest.
pub fn object_from_value(v: Value) -> Result<DynamicObject, serde_json::Error> {
    serde_json::from_value(v)
}

pub mod prelude {
    pub use super::{
        field, field_array, field_i64, field_str, gvk_key, gvk_of, parse_gvk_key, EventType, Message,
        ResourceId, Severity, StatusSink, WatchEvent,
    };
}
