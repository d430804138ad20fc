//! Per-kind await operations, keyed by gvk.
//!
//! A kind missing from the registry is unknown. A kind registered with empty
//! slots is known but has nothing to wait for. Both succeed immediately; the
//! dispatcher only logs them differently.

use std::future::Future;
use std::sync::Arc;

use converge_core::{gvk_key, parse_gvk_key};
use futures::future::BoxFuture;
use kube::core::GroupVersionKind;
use rustc_hash::FxHashMap;

use crate::config::{CreateAwaitConfig, DeleteAwaitConfig, UpdateAwaitConfig};
use crate::error::AwaitError;
use crate::{core_kinds, daemonset, deployment, ingress, job, pod, service, statefulset};

pub type AwaitResult = Result<(), AwaitError>;
pub type CreateFn = Arc<dyn Fn(CreateAwaitConfig) -> BoxFuture<'static, AwaitResult> + Send + Sync>;
pub type UpdateFn = Arc<dyn Fn(UpdateAwaitConfig) -> BoxFuture<'static, AwaitResult> + Send + Sync>;
pub type DeleteFn = Arc<dyn Fn(DeleteAwaitConfig) -> BoxFuture<'static, AwaitResult> + Send + Sync>;

pub fn create_fn<F, Fut>(f: F) -> CreateFn
where
    F: Fn(CreateAwaitConfig) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = AwaitResult> + Send + 'static,
{
    Arc::new(move |cfg| Box::pin(f(cfg)))
}

pub fn update_fn<F, Fut>(f: F) -> UpdateFn
where
    F: Fn(UpdateAwaitConfig) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = AwaitResult> + Send + 'static,
{
    Arc::new(move |cfg| Box::pin(f(cfg)))
}

pub fn delete_fn<F, Fut>(f: F) -> DeleteFn
where
    F: Fn(DeleteAwaitConfig) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = AwaitResult> + Send + 'static,
{
    Arc::new(move |cfg| Box::pin(f(cfg)))
}

/// Up to four operations; an empty slot means there is nothing to wait for.
#[derive(Clone, Default)]
pub struct AwaitSpec {
    pub create: Option<CreateFn>,
    pub update: Option<UpdateFn>,
    pub read: Option<CreateFn>,
    pub delete: Option<DeleteFn>,
}

impl AwaitSpec {
    /// Known kind without readiness semantics.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_create(mut self, f: CreateFn) -> Self {
        self.create = Some(f);
        self
    }

    pub fn with_update(mut self, f: UpdateFn) -> Self {
        self.update = Some(f);
        self
    }

    pub fn with_read(mut self, f: CreateFn) -> Self {
        self.read = Some(f);
        self
    }

    pub fn with_delete(mut self, f: DeleteFn) -> Self {
        self.delete = Some(f);
        self
    }

    /// Presence of the create, update, read and delete slots.
    pub fn slots(&self) -> [bool; 4] {
        [self.create.is_some(), self.update.is_some(), self.read.is_some(), self.delete.is_some()]
    }
}

impl std::fmt::Debug for AwaitSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [c, u, r, d] = self.slots();
        f.debug_struct("AwaitSpec").field("create", &c).field("update", &u).field("read", &r).field("delete", &d).finish()
    }
}

fn deployment_spec() -> AwaitSpec {
    AwaitSpec::none()
        .with_create(create_fn(deployment::await_creation))
        .with_update(update_fn(deployment::await_update))
        .with_read(create_fn(deployment::await_read))
        .with_delete(delete_fn(deployment::await_deletion))
}

fn statefulset_spec() -> AwaitSpec {
    AwaitSpec::none()
        .with_create(create_fn(statefulset::await_creation))
        .with_update(update_fn(statefulset::await_update))
        .with_read(create_fn(statefulset::await_read))
        .with_delete(delete_fn(statefulset::await_deletion))
}

fn daemonset_spec() -> AwaitSpec {
    AwaitSpec::none()
        .with_create(create_fn(daemonset::await_creation))
        .with_update(update_fn(daemonset::await_update))
        .with_read(create_fn(daemonset::await_read))
        .with_delete(delete_fn(daemonset::await_deletion))
}

fn ingress_spec() -> AwaitSpec {
    AwaitSpec::none()
        .with_create(create_fn(ingress::await_creation))
        .with_update(update_fn(ingress::await_update))
        .with_read(create_fn(ingress::await_read))
}

const NO_AWAIT: &[&str] = &[
    "autoscaling/v1/HorizontalPodAutoscaler",
    "v1/ConfigMap",
    "v1/LimitRange",
    "storage.k8s.io/v1/StorageClass",
];

const RBAC_KINDS: &[&str] = &["ClusterRole", "ClusterRoleBinding", "Role", "RoleBinding"];

#[derive(Clone, Default)]
pub struct Registry {
    specs: FxHashMap<String, AwaitSpec>,
}

impl Registry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Every kind with built-in await semantics, plus the known no-op kinds.
    pub fn builtin() -> Self {
        let mut r = Self::empty();
        for v in ["apps/v1", "apps/v1beta1", "apps/v1beta2", "extensions/v1beta1"] {
            r.insert(&format!("{}/Deployment", v), deployment_spec());
            r.insert(&format!("{}/DaemonSet", v), daemonset_spec());
        }
        for v in ["apps/v1", "apps/v1beta1", "apps/v1beta2"] {
            r.insert(&format!("{}/StatefulSet", v), statefulset_spec());
        }
        for v in ["extensions/v1beta1", "networking.k8s.io/v1", "networking.k8s.io/v1beta1"] {
            r.insert(&format!("{}/Ingress", v), ingress_spec());
        }
        r.insert(
            "batch/v1/Job",
            AwaitSpec::none()
                .with_create(create_fn(job::await_creation))
                .with_update(update_fn(job::await_update))
                .with_read(create_fn(job::await_read))
                .with_delete(delete_fn(job::await_deletion)),
        );
        r.insert(
            "v1/Pod",
            AwaitSpec::none()
                .with_create(create_fn(pod::await_creation))
                .with_update(update_fn(pod::await_update))
                .with_read(create_fn(pod::await_read))
                .with_delete(delete_fn(pod::await_deletion)),
        );
        r.insert(
            "v1/Service",
            AwaitSpec::none()
                .with_create(create_fn(service::await_creation))
                .with_update(update_fn(service::await_update))
                .with_read(create_fn(service::await_read)),
        );
        r.insert("v1/Namespace", AwaitSpec::none().with_delete(delete_fn(core_kinds::namespace_deletion)));
        r.insert("v1/PersistentVolume", AwaitSpec::none().with_create(create_fn(core_kinds::volume_creation)));
        r.insert("v1/PersistentVolumeClaim", AwaitSpec::none().with_create(create_fn(core_kinds::claim_creation)));
        r.insert(
            "v1/ReplicationController",
            AwaitSpec::none()
                .with_create(create_fn(core_kinds::controller_creation))
                .with_update(update_fn(core_kinds::controller_update))
                .with_delete(delete_fn(core_kinds::controller_deletion)),
        );
        r.insert(
            "v1/ResourceQuota",
            AwaitSpec::none()
                .with_create(create_fn(core_kinds::quota_creation))
                .with_update(update_fn(core_kinds::quota_update)),
        );
        r.insert("v1/Secret", AwaitSpec::none().with_create(create_fn(core_kinds::secret_creation)));
        r.insert("v1/ServiceAccount", AwaitSpec::none().with_create(create_fn(core_kinds::service_account_creation)));

        for key in NO_AWAIT {
            r.insert(key, AwaitSpec::none());
        }
        for v in ["v1", "v1alpha1", "v1beta1"] {
            for kind in RBAC_KINDS {
                r.insert(&format!("rbac.authorization.k8s.io/{}/{}", v, kind), AwaitSpec::none());
            }
        }
        r
    }

    fn insert(&mut self, key: &str, spec: AwaitSpec) {
        self.specs.insert(key.to_string(), spec);
    }

    /// Register or replace the operations for `gvk`.
    pub fn register(&mut self, gvk: &GroupVersionKind, spec: AwaitSpec) {
        self.specs.insert(gvk_key(gvk), spec);
    }

    /// `None` for a kind the registry does not know.
    pub fn lookup(&self, gvk: &GroupVersionKind) -> Option<&AwaitSpec> {
        self.specs.get(&gvk_key(gvk))
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Registered kinds sorted by gvk key.
    pub fn kinds(&self) -> Vec<(GroupVersionKind, &AwaitSpec)> {
        let mut keys: Vec<&String> = self.specs.keys().collect();
        keys.sort();
        keys.into_iter()
            .filter_map(|k| Some((parse_gvk_key(k).ok()?, self.specs.get(k)?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_distinguishes_unknown_from_no_await() {
        let r = Registry::builtin();
        let cm = r.lookup(&GroupVersionKind::gvk("", "v1", "ConfigMap")).expect("known kind");
        assert_eq!(cm.slots(), [false; 4]);
        assert!(r.lookup(&GroupVersionKind::gvk("example.com", "v1", "Widget")).is_none());
    }

    #[test]
    fn legacy_groups_share_the_awaiters() {
        let r = Registry::builtin();
        for (g, v) in [("apps", "v1"), ("apps", "v1beta2"), ("extensions", "v1beta1")] {
            let spec = r.lookup(&GroupVersionKind::gvk(g, v, "Deployment")).expect("deployment");
            assert_eq!(spec.slots(), [true; 4]);
        }
        assert!(r.lookup(&GroupVersionKind::gvk("extensions", "v1beta1", "StatefulSet")).is_none());
        let ing = r.lookup(&GroupVersionKind::gvk("networking.k8s.io", "v1", "Ingress")).expect("ingress");
        assert_eq!(ing.slots(), [true, true, true, false]);
        let role = r.lookup(&GroupVersionKind::gvk("rbac.authorization.k8s.io", "v1alpha1", "RoleBinding"));
        assert!(role.is_some());
    }

    #[test]
    fn register_overrides_and_lists_sorted() {
        let mut r = Registry::empty();
        let gvk = GroupVersionKind::gvk("example.com", "v1", "Widget");
        r.register(&gvk, AwaitSpec::none().with_create(create_fn(|_cfg| async { Ok(()) })));
        r.register(&GroupVersionKind::gvk("", "v1", "ConfigMap"), AwaitSpec::none());
        let kinds = r.kinds();
        assert_eq!(kinds.len(), 2);
        assert_eq!(gvk_key(&kinds[0].0), "example.com/v1/Widget");
        assert_eq!(kinds[0].1.slots(), [true, false, false, false]);
    }
}
