//! The shadow-service lifecycle manager.

use crate::{ClusterInfo, PortAllocator};
use k8s_openapi::api::core::v1::{ServicePort, ServiceSpec};
use maesh_core::{PortAllocatorError, ServiceKey, ServiceMode, ServicePortRef, ShadowPort};
use maesh_k8s_api::{
    naming::shadow_service_name, Api, Client, Error as KubeError, ErrorResponse, IntOrString,
    ObjectMeta, Patch, PatchParams, ResourceExt, Service, DATA_PLANE_COMPONENT_LABEL,
    DATA_PLANE_COMPONENT_VALUE, MESH_APP_LABEL, MESH_APP_VALUE, TRAFFIC_TYPE_ANNOTATION,
};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tracing::{debug, info, warn};

/// Bounded compare-and-swap retry budget for `OnUpdate`, matching the port
/// allocator's own retry budget so the two CAS loops in this codebase read as
/// one idiom.
const CONFLICT_RETRY_ATTEMPTS: usize = 5;
const CONFLICT_RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// The narrow capability the `ChangeHandler` needs from the shadow-service
/// manager. The handler would otherwise need to import the concrete manager
/// (which itself owns the handler), so it's constructed with a `ShadowOps`
/// implementation instead of owning the manager outright.
#[async_trait::async_trait]
pub trait ShadowOps: Send + Sync {
    async fn on_create(&self, user: &Service);
    async fn on_update(&self, old: &Service, new: &Service);
    async fn on_delete(&self, namespace: &str, name: &str);
}

pub struct ShadowServiceManager {
    cluster_info: Arc<ClusterInfo>,
    client: Client,
    allocator: Arc<PortAllocator>,
}

impl ShadowServiceManager {
    pub fn new(cluster_info: Arc<ClusterInfo>, client: Client, allocator: Arc<PortAllocator>) -> Self {
        Self {
            cluster_info,
            client,
            allocator,
        }
    }

    fn shadow_api(&self) -> Api<Service> {
        Api::namespaced(self.client.clone(), &self.cluster_info.mesh_namespace)
    }

    fn user_mode(&self, user: &Service) -> ServiceMode {
        let annotation = user
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(TRAFFIC_TYPE_ANNOTATION))
            .map(String::as_str);
        ServiceMode::from_annotation(annotation, self.cluster_info.default_mode)
    }

    /// Walks every declared port in order, indexed by its position in the
    /// *full* port list (not just the TCP ones) so
    /// `5000 + id` stays stable across restarts even when non-TCP ports are
    /// interleaved with TCP ones.
    async fn build_ports(&self, key: &ServiceKey, user: &Service) -> Vec<ShadowPort> {
        let mode = self.user_mode(user);
        let declared = user
            .spec
            .as_ref()
            .and_then(|spec| spec.ports.as_ref())
            .cloned()
            .unwrap_or_default();

        let mut ports = Vec::with_capacity(declared.len());
        for (id, sp) in declared.into_iter().enumerate() {
            let is_tcp = sp.protocol.as_deref().map(|p| p == "TCP").unwrap_or(true);
            if !is_tcp {
                continue;
            }

            let target_port = match mode {
                ServiceMode::Http => 5000 + id as i32,
                ServiceMode::Tcp => {
                    let port_ref = ServicePortRef::new(key.namespace.clone(), key.name.clone(), sp.port);
                    if let Some(existing) = self.allocator.find(&port_ref) {
                        existing
                    } else {
                        match self.allocator.add(port_ref.clone()).await {
                            Ok(port) => port,
                            Err(PortAllocatorError::Exhausted) => {
                                warn!(%key, port = sp.port, "TCP port range exhausted, skipping port");
                                continue;
                            }
                            Err(PortAllocatorError::Persistence(error)) => {
                                warn!(%key, port = sp.port, %error, "failed to persist port assignment, skipping port for this cycle");
                                continue;
                            }
                        }
                    }
                }
            };

            ports.push(ShadowPort {
                name: sp.name.clone().unwrap_or_default(),
                port: sp.port,
                target_port,
            });
        }
        ports
    }

    fn render(&self, key: &ServiceKey, ports: &[ShadowPort]) -> Service {
        let name = shadow_service_name(&self.cluster_info.mesh_namespace, key);
        let mut labels = BTreeMap::new();
        labels.insert(MESH_APP_LABEL.to_string(), MESH_APP_VALUE.to_string());

        let mut selector = BTreeMap::new();
        selector.insert(
            DATA_PLANE_COMPONENT_LABEL.to_string(),
            DATA_PLANE_COMPONENT_VALUE.to_string(),
        );

        Service {
            metadata: ObjectMeta {
                name: Some(name),
                namespace: Some(self.cluster_info.mesh_namespace.clone()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                selector: Some(selector),
                ports: Some(
                    ports
                        .iter()
                        .map(|p| ServicePort {
                            name: Some(p.name.clone()),
                            port: p.port,
                            target_port: Some(IntOrString::Int(p.target_port)),
                            protocol: Some("TCP".to_string()),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            status: None,
        }
    }

    /// `Sync()`: lists all non-ignored user services and creates any missing
    /// shadow service. Called once at startup; pre-existing shadow services
    /// are left untouched.
    pub async fn sync(&self, user_services: impl IntoIterator<Item = Service>) {
        for user in user_services {
            self.on_create(&user).await;
        }
    }
}

#[async_trait::async_trait]
impl ShadowOps for ShadowServiceManager {
    async fn on_create(&self, user: &Service) {
        let namespace = user.namespace().unwrap_or_default();
        let name = user.name_any();
        let key = ServiceKey::new(namespace, name);
        let shadow_name = shadow_service_name(&self.cluster_info.mesh_namespace, &key);

        match self.shadow_api().get_opt(&shadow_name).await {
            Ok(Some(_)) => {
                debug!(%key, shadow_name, "shadow service already exists, skipping create");
            }
            Ok(None) => {
                let ports = self.build_ports(&key, user).await;
                let shadow = self.render(&key, &ports);
                match self
                    .shadow_api()
                    .patch(
                        &shadow_name,
                        &PatchParams::apply("maesh"),
                        &Patch::Apply(&shadow),
                    )
                    .await
                {
                    Ok(_) => info!(%key, shadow_name, "created shadow service"),
                    Err(error) => warn!(%key, shadow_name, %error, "failed to create shadow service"),
                }
            }
            Err(error) => warn!(%key, shadow_name, %error, "failed to look up shadow service"),
        }
    }

    async fn on_update(&self, _old: &Service, new: &Service) {
        let namespace = new.namespace().unwrap_or_default();
        let name = new.name_any();
        let key = ServiceKey::new(namespace, name);
        let shadow_name = shadow_service_name(&self.cluster_info.mesh_namespace, &key);
        let ports = self.build_ports(&key, new).await;
        let desired = self.render(&key, &ports);

        let mut delay = CONFLICT_RETRY_BASE_DELAY;
        for attempt in 1..=CONFLICT_RETRY_ATTEMPTS {
            match self
                .shadow_api()
                .patch(
                    &shadow_name,
                    &PatchParams::apply("maesh"),
                    &Patch::Apply(&desired),
                )
                .await
            {
                Ok(_) => {
                    debug!(%key, shadow_name, "updated shadow service");
                    return;
                }
                Err(KubeError::Api(ErrorResponse { code: 409, .. })) if attempt < CONFLICT_RETRY_ATTEMPTS => {
                    warn!(%key, shadow_name, attempt, "shadow service update conflicted, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(error) => {
                    warn!(%key, shadow_name, %error, "failed to update shadow service");
                    return;
                }
            }
        }
    }

    async fn on_delete(&self, namespace: &str, name: &str) {
        let key = ServiceKey::new(namespace, name);
        let shadow_name = shadow_service_name(&self.cluster_info.mesh_namespace, &key);
        match self
            .shadow_api()
            .delete(&shadow_name, &Default::default())
            .await
        {
            Ok(_) => info!(%key, shadow_name, "deleted shadow service"),
            Err(KubeError::Api(ErrorResponse { code: 404, .. })) => {
                debug!(%key, shadow_name, "shadow service already absent, nothing to delete");
            }
            Err(error) => warn!(%key, shadow_name, %error, "failed to delete shadow service"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp_port(name: &str, port: i32) -> ServicePort {
        ServicePort {
            name: Some(name.to_string()),
            port,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }
    }

    fn udp_port(name: &str, port: i32) -> ServicePort {
        ServicePort {
            name: Some(name.to_string()),
            port,
            protocol: Some("UDP".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn missing_protocol_defaults_to_tcp() {
        let sp = ServicePort {
            name: Some("http".into()),
            port: 80,
            protocol: None,
            ..Default::default()
        };
        let is_tcp = sp.protocol.as_deref().map(|p| p == "TCP").unwrap_or(true);
        assert!(is_tcp);
    }

    #[test]
    fn id_counter_advances_past_skipped_non_tcp_ports() {
        // Mirrors `build_ports`' enumeration without requiring a live
        // cluster client: position 0 is UDP (skipped), so the surviving TCP
        // port at position 1 keeps `targetPort = 5000 + 1`, not `5000 + 0`.
        let declared = vec![udp_port("dns", 53), tcp_port("http", 80)];
        let mut target_ports = Vec::new();
        for (id, sp) in declared.into_iter().enumerate() {
            let is_tcp = sp.protocol.as_deref().map(|p| p == "TCP").unwrap_or(true);
            if !is_tcp {
                continue;
            }
            target_ports.push(5000 + id as i32);
        }
        assert_eq!(target_ports, vec![5001]);
    }
}
