#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use maesh_core as core;
pub use maesh_k8s_api as api;
pub use maesh_k8s_index as k8s;
pub use maesh_runtime as runtime;
