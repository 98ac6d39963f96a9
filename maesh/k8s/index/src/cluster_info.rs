use maesh_core::ServiceMode;

/// Holds cluster-wide configuration, threaded through every component that
/// needs it (the port allocator, the shadow-service manager, the ignore
/// policy, the reconciler). Cheap to clone; wrap in an `Arc` at the call
/// sites that need to share it across tasks.
#[derive(Clone, Debug)]
pub struct ClusterInfo {
    /// The mesh's own namespace: home of shadow services and the port-map
    /// document, and always ignored by the `ChangeHandler`.
    pub mesh_namespace: String,

    /// The cluster's own system namespace, always ignored.
    pub kube_system_namespace: String,

    /// The routing discipline applied to a user service when its
    /// `maesh.containo.us/traffic-type` annotation is absent or empty.
    pub default_mode: ServiceMode,

    /// Inclusive lower bound of the TCP port allocation range.
    pub min_port: i32,

    /// Inclusive upper bound of the TCP port allocation range.
    pub max_port: i32,

    /// Name of the `ConfigMap` holding the persisted port map, in
    /// `mesh_namespace`.
    pub port_map_name: String,
}

impl ClusterInfo {
    /// Number of distinct ports in `[min_port, max_port]`.
    pub fn port_range_size(&self) -> i64 {
        i64::from(self.max_port) - i64::from(self.min_port) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_range_size_is_inclusive() {
        let info = ClusterInfo {
            mesh_namespace: "maesh".into(),
            kube_system_namespace: "kube-system".into(),
            default_mode: ServiceMode::Http,
            min_port: 10000,
            max_port: 10100,
            port_map_name: "tcp-state-table".into(),
        };
        assert_eq!(info.port_range_size(), 101);
    }
}
