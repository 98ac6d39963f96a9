//! CLI entry point: flag parsing and startup wiring, in the shape of the
//! teacher's own `runtime::Args` -- one flattened `clap` struct, a
//! `kubert::Runtime` for client bootstrap/logging/shutdown, one spawned
//! watch task per resource kind, and the reconciler and mesh-specific admin
//! server spawned alongside it.

use crate::{
    admin::{self, AdminState},
    reconciler::{Metrics, Reconciler},
};
use anyhow::{bail, Result};
use clap::Parser;
use maesh_core::{DeployLog, ServiceMode};
use maesh_k8s_api::{Endpoints, Pod, Service};
use maesh_k8s_index::{
    ChangeHandler, ClusterInfo, IgnorePolicy, PlainProvider, PolicyAwareProvider, PortAllocator,
    ShadowServiceManager,
};
use futures::StreamExt;
use kube::runtime::{reflector, watcher, WatchStreamExt};
use prometheus_client::registry::Registry;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::sync::{mpsc, watch};
use tracing::{info_span, Instrument};

/// Bounded so a burst of refresh signals coalesces behind the reconciler's
/// current cycle rather than growing without limit; `tokio::mpsc` has no
/// literal zero-capacity option, so 1 is the closest approximation of an
/// unbuffered channel.
const REFRESH_CHANNEL_CAPACITY: usize = 1;

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum PolicyMode {
    Off,
    On,
}

#[derive(Debug, Parser)]
#[clap(name = "maesh", about = "A lightweight service mesh control plane")]
pub struct Args {
    #[clap(long, default_value = "maesh=info,warn", env = "MAESH_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain", env = "MAESH_LOG_FORMAT")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Address the mesh's own admin server (ready/configuration/deploys/metrics)
    /// binds to, distinct from `kubert`'s own admin bundle above.
    #[clap(long, default_value = "0.0.0.0:9990", env = "MAESH_ADMIN_ADDR")]
    mesh_admin_addr: SocketAddr,

    #[clap(long, default_value = "maesh", env = "MAESH_NAMESPACE")]
    mesh_namespace: String,

    #[clap(long, default_value = "kube-system", env = "MAESH_KUBE_SYSTEM_NAMESPACE")]
    kube_system_namespace: String,

    #[clap(long, default_value = "http", env = "MAESH_DEFAULT_MODE")]
    default_mode: DefaultMode,

    #[clap(long, default_value = "10000", env = "MAESH_MIN_PORT")]
    min_port: i32,

    #[clap(long, default_value = "10100", env = "MAESH_MAX_PORT")]
    max_port: i32,

    #[clap(long, default_value = "tcp-state-table", env = "MAESH_PORT_MAP_NAME")]
    port_map_name: String,

    /// Comma-separated list of additional namespaces to ignore.
    #[clap(long, default_value = "", env = "MAESH_IGNORED_NAMESPACES")]
    ignored_namespaces: String,

    /// Comma-separated list of `ns/name` service pairs to ignore.
    #[clap(long, default_value = "", env = "MAESH_IGNORED_SERVICES")]
    ignored_services: String,

    /// Comma-separated list of `key=value` labels to ignore.
    #[clap(long, default_value = "", env = "MAESH_IGNORED_LABELS")]
    ignored_labels: String,

    #[clap(long, default_value = "off", env = "MAESH_POLICY")]
    policy: PolicyMode,

    #[clap(long, default_value = "10s", env = "MAESH_RECONCILE_TICK_PERIOD")]
    reconcile_tick_period: humantime::Duration,

    #[clap(long, default_value = "1000", env = "MAESH_DEPLOY_LOG_CAPACITY")]
    deploy_log_capacity: usize,

    #[clap(long, default_value = "10s", env = "MAESH_PUSH_TIMEOUT")]
    push_timeout: humantime::Duration,

    #[clap(long, default_value = "15s", env = "MAESH_PUSH_BACKOFF_MAX")]
    push_backoff_max: humantime::Duration,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum DefaultMode {
    Http,
    Tcp,
}

impl From<DefaultMode> for ServiceMode {
    fn from(mode: DefaultMode) -> Self {
        match mode {
            DefaultMode::Http => ServiceMode::Http,
            DefaultMode::Tcp => ServiceMode::Tcp,
        }
    }
}

fn parse_ignored_namespaces(value: &str) -> Vec<String> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
}

fn parse_ignored_services(value: &str) -> Vec<(String, String)> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|pair| pair.split_once('/'))
        .map(|(ns, name)| (ns.to_string(), name.to_string()))
        .collect()
}

fn parse_ignored_labels(value: &str) -> Vec<(String, String)> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            mesh_admin_addr,
            mesh_namespace,
            kube_system_namespace,
            default_mode,
            min_port,
            max_port,
            port_map_name,
            ignored_namespaces,
            ignored_services,
            ignored_labels,
            policy,
            reconcile_tick_period,
            deploy_log_capacity,
            push_timeout,
            push_backoff_max,
        } = self;

        // The mesh keeps its own `Registry` for the `/metrics` route on its own
        // admin server rather than handing it to `kubert`'s admin bundle: this
        // mesh has no need for `kubert`'s own runtime-diagnostics metrics on
        // the same exposition, just the reconciler's.
        let mut prom = Registry::default();

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_admin(admin.into_builder())
            .with_client(client)
            .build()
            .await?;

        let cluster_info = Arc::new(ClusterInfo {
            mesh_namespace: mesh_namespace.clone(),
            kube_system_namespace,
            default_mode: default_mode.into(),
            min_port,
            max_port,
            port_map_name,
        });

        let ignore_policy = IgnorePolicy::new(
            cluster_info.mesh_namespace.clone(),
            cluster_info.kube_system_namespace.clone(),
            parse_ignored_namespaces(&ignored_namespaces),
            parse_ignored_services(&ignored_services),
            parse_ignored_labels(&ignored_labels),
        );

        let client = runtime.client();

        let allocator = Arc::new(PortAllocator::rehydrate(cluster_info.clone(), client.clone()).await?);
        let shadow_manager = Arc::new(ShadowServiceManager::new(cluster_info.clone(), client.clone(), allocator));

        // Startup sync: create any missing shadow service for every
        // non-ignored user service observed at boot.
        let all_services: kube::Api<Service> = kube::Api::all(client.clone());
        let existing = all_services.list(&Default::default()).await?.items;
        shadow_manager.sync(existing).await;

        let (refresh_tx, refresh_rx) = mpsc::channel(REFRESH_CHANNEL_CAPACITY);
        let change_handler = ChangeHandler::new(ignore_policy.clone(), shadow_manager.clone(), refresh_tx.clone());
        let change_handler = Arc::new(parking_lot::RwLock::new(change_handler));

        // One watch per resource kind drives the `ChangeHandler` (shadow-service
        // lifecycle + refresh signals); a second, independent watch of the same
        // resource kind feeds a `reflector::Store` cache for the
        // `ConfigurationProvider`s. The two can't share a stream since a
        // `kube` watch stream isn't broadcastable, so each consumer gets its own
        // list-watch -- the same tradeoff the teacher's own `IndexList` makes for
        // fan-out to multiple indexes, just across two separate API calls
        // instead of one shared event.
        let services_index_stream = runtime.watch_all::<Service>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(change_handler.clone(), services_index_stream)
                .instrument(info_span!("services")),
        );

        let endpoints_index_stream = runtime.watch_all::<Endpoints>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(change_handler.clone(), endpoints_index_stream)
                .instrument(info_span!("endpoints")),
        );

        let pods_index_stream = runtime.watch_all::<Pod>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(change_handler.clone(), pods_index_stream)
                .instrument(info_span!("pods")),
        );

        let services_api: kube::Api<Service> = kube::Api::all(client.clone());
        let (services_reader, services_writer) = reflector::store::<Service>();
        let services_cache_stream =
            reflector(services_writer, watcher(services_api, watcher::Config::default())).default_backoff();
        tokio::spawn(
            services_cache_stream
                .for_each(|_| futures::future::ready(()))
                .instrument(info_span!("services_cache")),
        );

        let endpoints_api: kube::Api<Endpoints> = kube::Api::all(client.clone());
        let (endpoints_reader, endpoints_writer) = reflector::store::<Endpoints>();
        let endpoints_cache_stream =
            reflector(endpoints_writer, watcher(endpoints_api, watcher::Config::default())).default_backoff();
        tokio::spawn(
            endpoints_cache_stream
                .for_each(|_| futures::future::ready(()))
                .instrument(info_span!("endpoints_cache")),
        );

        let (ready_tx, ready_rx) = watch::channel(false);
        let (configuration_tx, configuration_rx) = watch::channel(None);
        let deploy_log = Arc::new(DeployLog::new(deploy_log_capacity));
        let metrics = Metrics::register(prom.sub_registry_with_prefix("reconciler"));

        let admin_state = Arc::new(AdminState {
            ready: ready_rx,
            last_configuration: configuration_rx,
            deploy_log: deploy_log.clone(),
            registry: prom,
        });

        let shutdown = runtime.shutdown_handle();
        tokio::spawn(admin::serve(mesh_admin_addr, admin_state, shutdown.clone()).instrument(info_span!("mesh_admin")));

        let tick_period: Duration = reconcile_tick_period.into();
        let push_timeout: Duration = push_timeout.into();
        let push_backoff_max: Duration = push_backoff_max.into();

        match policy {
            PolicyMode::Off => {
                let provider = PlainProvider::new(mesh_namespace.clone(), ignore_policy.clone(), services_reader, endpoints_reader);
                let reconciler = Reconciler::new(
                    client,
                    mesh_namespace,
                    provider,
                    deploy_log,
                    metrics,
                    ready_tx,
                    configuration_tx,
                    push_timeout,
                    push_backoff_max,
                );
                tokio::spawn(reconciler.run(refresh_rx, tick_period, shutdown.clone()).instrument(info_span!("reconciler")));
            }
            PolicyMode::On => {
                let provider = PolicyAwareProvider::new(mesh_namespace.clone(), ignore_policy.clone(), services_reader, endpoints_reader);
                let reconciler = Reconciler::new(
                    client,
                    mesh_namespace,
                    provider,
                    deploy_log,
                    metrics,
                    ready_tx,
                    configuration_tx,
                    push_timeout,
                    push_backoff_max,
                );
                tokio::spawn(reconciler.run(refresh_rx, tick_period, shutdown.clone()).instrument(info_span!("reconciler")));
            }
        }

        if runtime.run().await.is_err() {
            bail!("aborted");
        }

        Ok(())
    }
}
