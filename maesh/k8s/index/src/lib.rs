//! The cluster-facing logic of the mesh control plane: cluster-wide
//! configuration, the ignore policy, the durable TCP port allocator, the
//! shadow-service lifecycle manager, the change handler, and the two
//! `ConfigurationProvider` implementations.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod change_handler;
mod cluster_info;
mod ignore;
mod port_allocator;
mod providers;
mod shadow_manager;

pub use self::{
    change_handler::{ChangeHandler, RefreshSignal, RefreshTag},
    cluster_info::ClusterInfo,
    ignore::IgnorePolicy,
    port_allocator::PortAllocator,
    providers::{PlainProvider, PolicyAwareProvider},
    shadow_manager::{ShadowOps, ShadowServiceManager},
};
