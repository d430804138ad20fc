//! API versions that clusters stop serving at a known release.

use converge_core::ServerVersion;
use kube::core::GroupVersionKind;

/// Cluster version at which `gvk` stopped being served, if known.
pub fn removed_in_version(gvk: &GroupVersionKind) -> Option<ServerVersion> {
    let v = ServerVersion::new;
    match (gvk.group.as_str(), gvk.version.as_str(), gvk.kind.as_str()) {
        ("admissionregistration.k8s.io", "v1beta1", _) | ("apiextensions.k8s.io", "v1beta1", _) => Some(v(1, 19)),
        ("authentication.k8s.io", "v1beta1", _)
        | ("authorization.k8s.io", "v1beta1", _)
        | ("coordination.k8s.io", "v1beta1", _) => Some(v(1, 22)),
        ("extensions", "v1beta1", "Ingress") => Some(v(1, 20)),
        ("extensions", "v1beta1", _) | ("apps", "v1beta1", _) | ("apps", "v1beta2", _) => Some(v(1, 16)),
        ("rbac.authorization.k8s.io", "v1alpha1", _) | ("rbac.authorization.k8s.io", "v1beta1", _) => Some(v(1, 22)),
        ("scheduling.k8s.io", "v1alpha1", _) | ("scheduling.k8s.io", "v1beta1", _) => Some(v(1, 17)),
        _ => None,
    }
}

/// True when `cluster` no longer serves `gvk`.
pub fn removed_at(gvk: &GroupVersionKind, cluster: ServerVersion) -> bool {
    removed_in_version(gvk).map(|removed| cluster >= removed).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_removals() {
        let ing = GroupVersionKind::gvk("extensions", "v1beta1", "Ingress");
        assert_eq!(removed_in_version(&ing), Some(ServerVersion::new(1, 20)));
        let dep = GroupVersionKind::gvk("apps", "v1beta2", "Deployment");
        assert!(removed_at(&dep, ServerVersion::new(1, 16)));
        assert!(!removed_at(&dep, ServerVersion::new(1, 15)));
        let current = GroupVersionKind::gvk("apps", "v1", "Deployment");
        assert!(!removed_at(&current, ServerVersion::new(1, 30)));
    }
}
