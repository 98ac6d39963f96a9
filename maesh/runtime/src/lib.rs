//! Startup wiring: CLI parsing, the reconciler, and the mesh's own admin
//! HTTP server. Mirrors the split the teacher keeps between
//! `policy-controller/runtime` (wiring) and `policy-controller/src`
//! (binary-local admin glue).

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod admin;
mod args;
mod reconciler;

pub use self::args::Args;
