//! The durable TCP port allocator.
//!
//! Maintains a bijective mapping between `ServicePortRef`s and integers in
//! `[min_port, max_port]`, backed by a `ConfigMap` in the mesh namespace.

use crate::ClusterInfo;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{
    api::{Api, ObjectMeta, PostParams},
    Client,
};
use maesh_core::{PortAllocatorError, ServicePortRef};
use maesh_k8s_api::naming::{format_service_name_port, parse_service_name_port};
use parking_lot::RwLock;
use std::{collections::BTreeMap, sync::Arc};
use tracing::warn;

/// Bounded number of read-replace attempts on a `409 Conflict`, matching the
/// shadow-service manager's own compare-and-swap budget.
const CONFLICT_RETRY_ATTEMPTS: usize = 5;

#[derive(Default)]
struct Table {
    by_port: BTreeMap<i32, ServicePortRef>,
}

impl Table {
    fn find(&self, port_ref: &ServicePortRef) -> Option<i32> {
        self.by_port
            .iter()
            .find(|(_, r)| *r == port_ref)
            .map(|(port, _)| *port)
    }
}

pub struct PortAllocator {
    cluster_info: Arc<ClusterInfo>,
    client: Client,
    table: RwLock<Table>,
}

impl PortAllocator {
    /// Rehydrates the in-memory table from the persisted `ConfigMap`,
    /// skipping unparseable entries with a warning rather than failing.
    ///
    /// A missing `ConfigMap` is not an error: the mesh may be starting up for
    /// the first time. Any other cluster-client failure is fatal and aborts
    /// startup.
    pub async fn rehydrate(cluster_info: Arc<ClusterInfo>, client: Client) -> anyhow::Result<Self> {
        let api: Api<ConfigMap> = Api::namespaced(client.clone(), &cluster_info.mesh_namespace);
        let table = match api.get_opt(&cluster_info.port_map_name).await? {
            Some(cm) => Self::table_from_configmap(&cm, &cluster_info.mesh_namespace),
            None => Table::default(),
        };
        Ok(Self {
            cluster_info,
            client,
            table: RwLock::new(table),
        })
    }

    fn table_from_configmap(cm: &ConfigMap, default_namespace: &str) -> Table {
        let mut table = Table::default();
        let Some(data) = cm.data.as_ref() else {
            return table;
        };
        for (port_str, value) in data {
            let port = match port_str.parse::<i32>() {
                Ok(port) => port,
                Err(_) => {
                    warn!(key = %port_str, "skipping unparseable port-map key");
                    continue;
                }
            };
            match parse_service_name_port(value, default_namespace) {
                Ok(port_ref) => {
                    table.by_port.insert(port, port_ref);
                }
                Err(error) => warn!(%error, value, "skipping unparseable port-map entry"),
            }
        }
        table
    }

    /// `Find`: returns the currently assigned port for a `ServicePortRef`, if
    /// any.
    pub fn find(&self, port_ref: &ServicePortRef) -> Option<i32> {
        self.table.read().find(port_ref)
    }

    /// `Get`: the inverse lookup.
    pub fn get(&self, port: i32) -> Option<ServicePortRef> {
        self.table.read().by_port.get(&port).cloned()
    }

    /// `Add`: assigns the lowest unassigned port in `[min_port, max_port]` to
    /// `port_ref`, persists the table, and returns the claimed port.
    ///
    /// A ref that already has a port returns its existing assignment without
    /// consuming a new slot. The in-memory claim is made before persistence is
    /// attempted and is retained even if persistence fails: rolling it back
    /// could let a concurrent `Add` double-assign the same port.
    pub async fn add(&self, port_ref: ServicePortRef) -> Result<i32, PortAllocatorError> {
        let claimed = {
            let mut table = self.table.write();
            if let Some(port) = table.find(&port_ref) {
                return Ok(port);
            }
            let port = (self.cluster_info.min_port..=self.cluster_info.max_port)
                .find(|port| !table.by_port.contains_key(port))
                .ok_or(PortAllocatorError::Exhausted)?;
            table.by_port.insert(port, port_ref.clone());
            port
        };

        if let Err(error) = self.persist().await {
            warn!(
                %error,
                port = claimed,
                %port_ref,
                "failed to persist port map; in-memory claim retained, will flush on next successful save"
            );
            return Err(PortAllocatorError::Persistence(error.into()));
        }

        Ok(claimed)
    }

    /// Upserts the full in-memory table as the `ConfigMap`'s data, retrying on
    /// `409 Conflict` by re-reading the object for a fresh `resourceVersion`.
    ///
    /// The in-memory table is the authoritative state for this process -- it
    /// already contains every claim this process has made -- so a conflict
    /// only requires a fresher `resourceVersion`, not a data merge.
    async fn persist(&self) -> anyhow::Result<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.cluster_info.mesh_namespace);
        let data: BTreeMap<String, String> = {
            let table = self.table.read();
            table
                .by_port
                .iter()
                .map(|(port, port_ref)| (port.to_string(), format_service_name_port(port_ref)))
                .collect()
        };

        let mut last_error = None;
        for attempt in 1..=CONFLICT_RETRY_ATTEMPTS {
            let existing = api.get_opt(&self.cluster_info.port_map_name).await?;
            let resource_version = existing.as_ref().and_then(|cm| cm.metadata.resource_version.clone());
            let cm = ConfigMap {
                metadata: ObjectMeta {
                    name: Some(self.cluster_info.port_map_name.clone()),
                    namespace: Some(self.cluster_info.mesh_namespace.clone()),
                    resource_version,
                    ..Default::default()
                },
                data: Some(data.clone()),
                ..Default::default()
            };

            let result = if existing.is_some() {
                api.replace(&self.cluster_info.port_map_name, &PostParams::default(), &cm)
                    .await
            } else {
                api.create(&PostParams::default(), &cm).await
            };

            match result {
                Ok(_) => return Ok(()),
                Err(kube::Error::Api(e)) if e.code == 409 => {
                    warn!(attempt, "port map save conflicted, retrying with fresh resourceVersion");
                    last_error = Some(kube::Error::Api(e));
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(last_error.expect("loop always records an error before exhausting retries").into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_from_configmap_skips_unparseable_entries() {
        let cm = ConfigMap {
            data: Some(BTreeMap::from([
                ("10000".to_string(), "default/db:5432".to_string()),
                ("not-a-port".to_string(), "default/db:5432".to_string()),
                ("10001".to_string(), "garbage".to_string()),
                ("10002".to_string(), "legacy:9999".to_string()),
            ])),
            ..Default::default()
        };
        let table = PortAllocator::table_from_configmap(&cm, "default");
        assert_eq!(table.by_port.len(), 2);
        assert_eq!(
            table.by_port.get(&10000),
            Some(&ServicePortRef::new("default", "db", 5432))
        );
        assert_eq!(
            table.by_port.get(&10002),
            Some(&ServicePortRef::new("default", "legacy", 9999))
        );
    }

    #[test]
    fn table_find_locates_the_assigned_port() {
        let port_ref = ServicePortRef::new("default", "db", 5432);
        let mut table = Table::default();
        table.by_port.insert(10000, port_ref.clone());
        assert_eq!(table.find(&port_ref), Some(10000));
        assert_eq!(table.by_port.get(&10001), None);
    }

    #[test]
    fn lowest_unassigned_port_in_range_is_chosen() {
        let mut table = Table::default();
        table
            .by_port
            .insert(10000, ServicePortRef::new("default", "a", 1));
        let chosen = (10000..=10100_i32).find(|p| !table.by_port.contains_key(p));
        assert_eq!(chosen, Some(10001));
    }
}
