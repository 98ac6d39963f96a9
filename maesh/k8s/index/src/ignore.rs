//! The ignore policy: an immutable set evaluated at `ChangeHandler` entry.
//! The mesh namespace, the cluster's system namespace, and the data-plane's
//! own `app=maesh` label are always ignored regardless of CLI configuration.

use maesh_k8s_api::{MESH_APP_LABEL, MESH_APP_VALUE};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Debug, Default)]
pub struct IgnorePolicy {
    mesh_namespace: String,
    kube_system_namespace: String,
    ignored_namespaces: BTreeSet<String>,
    ignored_services: BTreeSet<(String, String)>,
    ignored_labels: BTreeMap<String, String>,
}

impl IgnorePolicy {
    pub fn new(
        mesh_namespace: impl Into<String>,
        kube_system_namespace: impl Into<String>,
        ignored_namespaces: impl IntoIterator<Item = String>,
        ignored_services: impl IntoIterator<Item = (String, String)>,
        ignored_labels: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        Self {
            mesh_namespace: mesh_namespace.into(),
            kube_system_namespace: kube_system_namespace.into(),
            ignored_namespaces: ignored_namespaces.into_iter().collect(),
            ignored_services: ignored_services.into_iter().collect(),
            ignored_labels: ignored_labels.into_iter().collect(),
        }
    }

    /// True if `namespace` is the mesh namespace, the cluster's system
    /// namespace, or explicitly configured as ignored.
    pub fn is_ignored_namespace(&self, namespace: &str) -> bool {
        namespace == self.mesh_namespace
            || namespace == self.kube_system_namespace
            || self.ignored_namespaces.contains(namespace)
    }

    /// True if the `(namespace, name)` service pair should never get a
    /// shadow service.
    pub fn is_ignored_service(&self, namespace: &str, name: &str) -> bool {
        self.is_ignored_namespace(namespace)
            || self
                .ignored_services
                .contains(&(namespace.to_string(), name.to_string()))
    }

    /// True if `labels` mark the owning resource as mesh-owned (the
    /// data-plane's own pods, shadow services) or match a configured
    /// ignored app-label.
    pub fn is_ignored_by_labels(&self, labels: &BTreeMap<String, String>) -> bool {
        if labels.get(MESH_APP_LABEL).map(String::as_str) == Some(MESH_APP_VALUE) {
            return true;
        }
        self.ignored_labels
            .iter()
            .any(|(key, value)| labels.get(key).map(String::as_str) == Some(value.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    fn policy() -> IgnorePolicy {
        IgnorePolicy::new(
            "maesh",
            "kube-system",
            ["internal".to_string()],
            [("default".to_string(), "debug".to_string())],
            [("team".to_string(), "platform".to_string())],
        )
    }

    #[test]
    fn mesh_and_system_namespaces_are_always_ignored() {
        let policy = IgnorePolicy::default();
        assert!(!policy.is_ignored_namespace("default"));

        let policy = policy();
        assert!(policy.is_ignored_namespace("maesh"));
        assert!(policy.is_ignored_namespace("kube-system"));
        assert!(policy.is_ignored_namespace("internal"));
        assert!(!policy.is_ignored_namespace("default"));
    }

    #[test]
    fn ignored_service_pairs_are_scoped_to_namespace_and_name() {
        let policy = policy();
        assert!(policy.is_ignored_service("default", "debug"));
        assert!(!policy.is_ignored_service("default", "web"));
        assert!(policy.is_ignored_service("internal", "anything"));
    }

    #[test]
    fn mesh_app_label_is_always_ignored() {
        let policy = policy();
        let labels = btreemap! { MESH_APP_LABEL.to_string() => MESH_APP_VALUE.to_string() };
        assert!(policy.is_ignored_by_labels(&labels));
    }

    #[test]
    fn configured_label_pair_is_ignored() {
        let policy = policy();
        let labels = btreemap! { "team".to_string() => "platform".to_string() };
        assert!(policy.is_ignored_by_labels(&labels));

        let labels = btreemap! { "team".to_string() => "other".to_string() };
        assert!(!policy.is_ignored_by_labels(&labels));
    }
}
