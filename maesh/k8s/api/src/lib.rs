//! Thin re-export layer over `k8s-openapi` and `kube`, plus the mesh's own
//! label/annotation constants and wire-format helpers.
//!
//! Mirrors the teacher's `linkerd-policy-controller-k8s-api` crate: callers
//! depend on this crate instead of `k8s-openapi`/`kube` directly so that a
//! future version bump of either is a one-crate change.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod labels;
pub mod naming;

pub use k8s_openapi::{
    api::core::v1::{
        ConfigMap, Container, ContainerStatus, EndpointAddress, EndpointPort, EndpointSubset,
        Endpoints, Pod, Service, ServicePort, ServiceSpec,
    },
    apimachinery::pkg::util::intstr::IntOrString,
};
pub use kube::{
    api::{Api, ListParams, ObjectMeta, Patch, PatchParams, Resource, ResourceExt},
    error::ErrorResponse,
    runtime::{reflector::Store, watcher::Event as WatchEvent},
    Client, Error,
};

pub use self::{
    labels::{DATA_PLANE_COMPONENT_LABEL, DATA_PLANE_COMPONENT_VALUE, MESH_APP_LABEL, MESH_APP_VALUE},
    naming::{format_service_name_port, parse_service_name_port, shadow_service_name},
};
