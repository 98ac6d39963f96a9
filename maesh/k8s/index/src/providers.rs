//! The two `ConfigurationProvider` implementations: `PlainProvider` (the
//! `--policy=off` default) and `PolicyAwareProvider` (`--policy=on`), both
//! reading from cached `kube::runtime::reflector::Store`s populated by the
//! same watches the `ChangeHandler` observes.
//!
//! Both build the same small routing-config shape -- `{"backends": {...},
//! "routers": {...}}` -- and are compared by `DynamicConfiguration`'s
//! `PartialEq`. Translating cluster objects into routing rules is a
//! straightforward mapping, not the hard part of this crate; what's preserved
//! faithfully here is the shape of the inputs (ignore policy, shadow naming,
//! endpoint readiness) rather than a rich DSL.

use crate::IgnorePolicy;
use maesh_core::{ConfigurationProvider, DynamicConfiguration, ServiceKey};
use maesh_k8s_api::{naming::shadow_service_name, Endpoints, ResourceExt, Service, Store};
use serde_json::{Map, Value};

const TRAFFIC_SPLIT_ANNOTATION: &str = "maesh.containo.us/traffic-split";

/// Builds the `{name@weight,...}` backend server list shared by both
/// providers: every ready endpoint address behind a user service's TCP
/// ports, keyed by `"<shadow-name>-<port-name>"`.
fn build_base(mesh_namespace: &str, ignore_policy: &IgnorePolicy, services: &Store<Service>, endpoints: &Store<Endpoints>) -> (Map<String, Value>, Map<String, Value>) {
    let mut backends = Map::new();
    let mut routers = Map::new();

    for svc in services.state() {
        let namespace = svc.namespace().unwrap_or_default();
        let name = svc.name_any();
        if ignore_policy.is_ignored_service(&namespace, &name) {
            continue;
        }
        if svc
            .metadata
            .labels
            .as_ref()
            .map(|labels| ignore_policy.is_ignored_by_labels(labels))
            .unwrap_or(false)
        {
            continue;
        }

        let Some(spec) = svc.spec.as_ref() else {
            continue;
        };
        let Some(ports) = spec.ports.as_ref() else {
            continue;
        };

        let key = ServiceKey::new(namespace.clone(), name.clone());
        let shadow_name = shadow_service_name(mesh_namespace, &key);
        let ready_addrs = ready_addresses(endpoints, &namespace, &name);

        for port in ports {
            let is_tcp = port.protocol.as_deref().map(|p| p == "TCP").unwrap_or(true);
            if !is_tcp {
                continue;
            }
            let port_name = port.name.clone().unwrap_or_default();
            let router_name = format!("{shadow_name}-{port_name}");

            let servers: Map<String, Value> = ready_addrs
                .iter()
                .map(|ip| {
                    let url = format!("http://{ip}:{}", port.port);
                    (format!("{ip}:{}", port.port), serde_json::json!({ "url": url }))
                })
                .collect();

            backends.insert(router_name.clone(), serde_json::json!({ "servers": servers }));
            routers.insert(
                router_name.clone(),
                serde_json::json!({ "rule": "PathPrefix(`/`)", "service": router_name }),
            );
        }
    }

    (backends, routers)
}

fn ready_addresses(endpoints: &Store<Endpoints>, namespace: &str, name: &str) -> Vec<String> {
    endpoints
        .state()
        .iter()
        .filter(|ep| ep.namespace().as_deref() == Some(namespace) && ep.name_any() == name)
        .flat_map(|ep| ep.subsets.clone().unwrap_or_default())
        .flat_map(|subset| subset.addresses.unwrap_or_default())
        .map(|addr| addr.ip)
        .collect()
}

/// `to: name@weight` CSV grammar for the `maesh.containo.us/traffic-split`
/// annotation. Falls back silently (empty vec) when absent or malformed --
/// the policy-aware provider treats that the same as "no split configured".
fn parse_traffic_split(value: &str) -> Vec<(String, u32)> {
    value
        .split(',')
        .filter_map(|entry| {
            let entry = entry.trim();
            let (name, weight) = entry.split_once('@')?;
            let weight = weight.trim().parse::<u32>().ok()?;
            Some((name.trim().to_string(), weight))
        })
        .collect()
}

/// The `--policy=off` (default) provider: round-robin across ready endpoint
/// IPs, no per-destination weighting.
pub struct PlainProvider {
    mesh_namespace: String,
    ignore_policy: IgnorePolicy,
    services: Store<Service>,
    endpoints: Store<Endpoints>,
}

impl PlainProvider {
    pub fn new(
        mesh_namespace: impl Into<String>,
        ignore_policy: IgnorePolicy,
        services: Store<Service>,
        endpoints: Store<Endpoints>,
    ) -> Self {
        Self {
            mesh_namespace: mesh_namespace.into(),
            ignore_policy,
            services,
            endpoints,
        }
    }
}

#[async_trait::async_trait]
impl ConfigurationProvider for PlainProvider {
    async fn build(&self) -> anyhow::Result<DynamicConfiguration> {
        let (backends, routers) = build_base(&self.mesh_namespace, &self.ignore_policy, &self.services, &self.endpoints);
        Ok(DynamicConfiguration::new(serde_json::json!({
            "backends": backends,
            "routers": routers,
        })))
    }
}

/// The `--policy=on` provider: same base routers, additionally annotated
/// with per-destination weights read off `maesh.containo.us/traffic-split`
/// when present, falling back to plain round robin otherwise.
pub struct PolicyAwareProvider {
    mesh_namespace: String,
    ignore_policy: IgnorePolicy,
    services: Store<Service>,
    endpoints: Store<Endpoints>,
}

impl PolicyAwareProvider {
    pub fn new(
        mesh_namespace: impl Into<String>,
        ignore_policy: IgnorePolicy,
        services: Store<Service>,
        endpoints: Store<Endpoints>,
    ) -> Self {
        Self {
            mesh_namespace: mesh_namespace.into(),
            ignore_policy,
            services,
            endpoints,
        }
    }
}

#[async_trait::async_trait]
impl ConfigurationProvider for PolicyAwareProvider {
    async fn build(&self) -> anyhow::Result<DynamicConfiguration> {
        let (mut backends, routers) = build_base(&self.mesh_namespace, &self.ignore_policy, &self.services, &self.endpoints);

        for svc in self.services.state() {
            let namespace = svc.namespace().unwrap_or_default();
            let name = svc.name_any();
            let Some(split) = svc
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(TRAFFIC_SPLIT_ANNOTATION))
            else {
                continue;
            };
            let weights = parse_traffic_split(split);
            if weights.is_empty() {
                continue;
            }

            let key = ServiceKey::new(namespace, name);
            let shadow_name = shadow_service_name(&self.mesh_namespace, &key);
            for (backend_name, backend) in backends.iter_mut() {
                if backend_name.starts_with(&shadow_name) {
                    if let Value::Object(map) = backend {
                        map.insert(
                            "weighted".to_string(),
                            serde_json::json!(weights
                                .iter()
                                .map(|(name, weight)| serde_json::json!({ "name": name, "weight": weight }))
                                .collect::<Vec<_>>()),
                        );
                    }
                }
            }
        }

        Ok(DynamicConfiguration::new(serde_json::json!({
            "backends": backends,
            "routers": routers,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traffic_split_parses_name_weight_pairs() {
        let parsed = parse_traffic_split("stable@90,canary@10");
        assert_eq!(
            parsed,
            vec![("stable".to_string(), 90), ("canary".to_string(), 10)]
        );
    }

    #[test]
    fn traffic_split_ignores_malformed_entries() {
        let parsed = parse_traffic_split("stable@90,garbage,canary@not-a-number");
        assert_eq!(parsed, vec![("stable".to_string(), 90)]);
    }

    #[test]
    fn empty_traffic_split_annotation_yields_no_weights() {
        assert!(parse_traffic_split("").is_empty());
    }
}
