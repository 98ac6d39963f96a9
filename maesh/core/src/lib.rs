//! The mesh control plane's data model.
//!
//! This crate has no Kubernetes dependency: every type here is plain data or a
//! narrow trait, so that the reconciliation and shadow-service logic in
//! `maesh-k8s-index` can be unit tested without a cluster client in scope.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod config;
mod deploy_log;
mod error;
mod key;
mod shadow;

pub use self::{
    config::{ConfigurationProvider, DynamicConfiguration},
    deploy_log::{DeployLog, DeployRecord},
    error::{FanOutError, PortAllocatorError},
    key::{ServiceKey, ServiceMode, ServicePortRef},
    shadow::ShadowPort,
};
