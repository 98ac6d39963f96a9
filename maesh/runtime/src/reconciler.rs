//! The reconciler: the single serial task that owns the last deployed
//! configuration, fans it out to the data-plane fleet, and republishes
//! readiness.

use maesh_core::{ConfigurationProvider, DeployLog, DeployRecord, DynamicConfiguration, FanOutError};
use maesh_k8s_api::{Api, Client, ListParams, Pod, ResourceExt};
use maesh_k8s_index::{RefreshSignal, RefreshTag};
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, instrument, warn};

const DATA_PLANE_COMPONENT_LABEL: &str = "component";
const DATA_PLANE_COMPONENT_VALUE: &str = "maesh-mesh";
const PUSH_PATH: &str = "/api/providers/rest";
const PUSH_PORT: u16 = 8080;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct PushOutcomeLabels {
    outcome: &'static str,
}

/// Reconciler-owned metrics, registered once at construction.
pub struct Metrics {
    cycles: Counter,
    cycle_duration: Histogram,
    pushes: Family<PushOutcomeLabels, Counter>,
}

impl Metrics {
    pub fn register(registry: &mut Registry) -> Self {
        let cycles = Counter::default();
        registry.register("reconcile_cycles", "Total reconciliation cycles run", cycles.clone());

        let cycle_duration = Histogram::new([0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0].into_iter());
        registry.register(
            "reconcile_cycle_duration_seconds",
            "Duration of a reconciliation cycle",
            cycle_duration.clone(),
        );

        let pushes = Family::default();
        registry.register(
            "data_plane_pushes",
            "Per-instance configuration push outcomes",
            pushes.clone(),
        );

        Self { cycles, cycle_duration, pushes }
    }
}

pub struct Reconciler<P> {
    client: Client,
    mesh_namespace: String,
    provider: P,
    deploy_log: Arc<DeployLog>,
    metrics: Metrics,
    ready_tx: watch::Sender<bool>,
    configuration_tx: watch::Sender<Option<serde_json::Value>>,
    push_timeout: Duration,
    push_backoff_max: Duration,
    last_config: Option<DynamicConfiguration>,
}

impl<P> Reconciler<P>
where
    P: ConfigurationProvider,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Client,
        mesh_namespace: impl Into<String>,
        provider: P,
        deploy_log: Arc<DeployLog>,
        metrics: Metrics,
        ready_tx: watch::Sender<bool>,
        configuration_tx: watch::Sender<Option<serde_json::Value>>,
        push_timeout: Duration,
        push_backoff_max: Duration,
    ) -> Self {
        Self {
            client,
            mesh_namespace: mesh_namespace.into(),
            provider,
            deploy_log,
            metrics,
            ready_tx,
            configuration_tx,
            push_timeout,
            push_backoff_max,
            last_config: None,
        }
    }

    /// The main select loop: stop, coalesced refresh, and a fixed re-sync
    /// tick. Runs until the drain signal fires.
    pub async fn run(
        mut self,
        mut refresh_rx: mpsc::Receiver<RefreshSignal>,
        tick_period: Duration,
        shutdown: drain::Watch,
    ) {
        let mut tick = tokio::time::interval(tick_period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tokio::pin! {
            let shutdown_signaled = shutdown.signaled();
        }

        loop {
            tokio::select! {
                handle = &mut shutdown_signaled => {
                    info!("reconciler shutting down");
                    drop(handle);
                    return;
                }
                signal = refresh_rx.recv() => {
                    match signal {
                        Some(signal) => self.on_refresh(signal).await,
                        None => {
                            info!("refresh channel closed, reconciler exiting");
                            return;
                        }
                    }
                }
                _ = tick.tick() => self.on_tick().await,
            }
        }
    }

    #[instrument(skip(self))]
    async fn on_refresh(&mut self, signal: RefreshSignal) {
        let started = tokio::time::Instant::now();
        self.metrics.cycles.inc();

        let config = match self.provider.build().await {
            Ok(config) => config,
            Err(error) => {
                warn!(%error, "failed to build configuration, skipping cycle");
                return;
            }
        };

        let unchanged = self.last_config.as_ref() == Some(&config);
        if unchanged && signal.tag == RefreshTag::Normal {
            self.metrics.cycle_duration.observe(started.elapsed().as_secs_f64());
            return;
        }

        self.last_config = Some(config.clone());
        let _ = self.configuration_tx.send(Some(config.as_value().clone()));

        match self.deploy_to_all(&config).await {
            Ok(()) => {
                let _ = self.ready_tx.send(true);
            }
            Err(error) => warn!(%error, "fan-out reported failures this cycle"),
        }
        self.metrics.cycle_duration.observe(started.elapsed().as_secs_f64());
    }

    #[instrument(skip(self))]
    async fn on_tick(&mut self) {
        let Some(config) = self.last_config.clone() else {
            return;
        };
        if let Err(error) = self.deploy_to_unready(&config).await {
            warn!(%error, "re-sync tick reported failures");
        }
    }

    async fn data_plane_pods(&self) -> anyhow::Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &self.mesh_namespace);
        let params = ListParams::default().labels(&format!(
            "{DATA_PLANE_COMPONENT_LABEL}={DATA_PLANE_COMPONENT_VALUE}"
        ));
        Ok(api.list(&params).await?.items)
    }

    fn is_unready(pod: &Pod) -> bool {
        pod.status
            .as_ref()
            .and_then(|status| status.container_statuses.as_ref())
            .map(|statuses| statuses.iter().any(|cs| !cs.ready))
            .unwrap_or(true)
    }

    /// Pushes the given configuration to every data-plane pod in parallel.
    async fn deploy_to_all(&self, config: &DynamicConfiguration) -> Result<(), FanOutError> {
        let pods = self.data_plane_pods().await.unwrap_or_default();
        self.fan_out(pods, config).await
    }

    /// Pushes only to pods with a not-ready container, catching laggards the
    /// previous cycle missed.
    async fn deploy_to_unready(&self, config: &DynamicConfiguration) -> Result<(), FanOutError> {
        let pods = self
            .data_plane_pods()
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(Self::is_unready)
            .collect();
        self.fan_out(pods, config).await
    }

    async fn fan_out(&self, pods: Vec<Pod>, config: &DynamicConfiguration) -> Result<(), FanOutError> {
        if pods.is_empty() {
            return Err(FanOutError::NoInstances);
        }
        let total = pods.len();

        let tasks = pods.into_iter().map(|pod| {
            let config = config.clone();
            let push_timeout = self.push_timeout;
            let push_backoff_max = self.push_backoff_max;
            tokio::spawn(async move { push_one(pod, config, push_timeout, push_backoff_max).await })
        });

        let results = futures::future::join_all(tasks).await;
        let mut failed = 0;
        for result in results {
            let record = match result {
                Ok(record) => record,
                Err(error) => {
                    warn!(%error, "push task panicked");
                    continue;
                }
            };
            if !record.success {
                failed += 1;
                self.metrics.pushes.get_or_create(&PushOutcomeLabels { outcome: "failure" }).inc();
            } else {
                self.metrics.pushes.get_or_create(&PushOutcomeLabels { outcome: "success" }).inc();
            }
            self.deploy_log.push(record);
        }

        if failed > 0 {
            Err(FanOutError::PartialFailure { failed, total })
        } else {
            Ok(())
        }
    }
}

/// One per-instance push, wrapped in exponential backoff capped at
/// `push_backoff_max` total elapsed time.
async fn push_one(
    pod: Pod,
    config: DynamicConfiguration,
    push_timeout: Duration,
    push_backoff_max: Duration,
) -> DeployRecord {
    let instance_name = pod.name_any();
    let instance_ip = pod
        .status
        .as_ref()
        .and_then(|status| status.pod_ip.clone())
        .unwrap_or_default();

    if instance_ip.is_empty() {
        return DeployRecord {
            timestamp: chrono::Utc::now(),
            instance_name,
            instance_ip,
            success: false,
            message: "pod has no assigned IP".to_string(),
        };
    }

    let url = format!("http://{instance_ip}:{PUSH_PORT}{PUSH_PATH}");
    let body = match config.to_json_vec() {
        Ok(body) => body,
        Err(error) => {
            return DeployRecord {
                timestamp: chrono::Utc::now(),
                instance_name,
                instance_ip,
                success: false,
                message: format!("failed to encode configuration: {error}"),
            };
        }
    };

    let client = reqwest::Client::new();
    let mut backoff = Duration::from_millis(100);
    let mut elapsed = Duration::ZERO;
    let mut last_message = String::new();

    loop {
        let attempt = client
            .put(&url)
            .timeout(push_timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.clone())
            .send()
            .await;

        match attempt {
            Ok(response) if response.status().is_success() => {
                return DeployRecord {
                    timestamp: chrono::Utc::now(),
                    instance_name,
                    instance_ip,
                    success: true,
                    message: String::new(),
                };
            }
            Ok(response) => {
                last_message = format!("data-plane instance returned {}", response.status());
            }
            Err(error) => {
                last_message = error.to_string();
            }
        }

        if elapsed >= push_backoff_max {
            return DeployRecord {
                timestamp: chrono::Utc::now(),
                instance_name,
                instance_ip,
                success: false,
                message: last_message,
            };
        }

        tokio::time::sleep(backoff).await;
        elapsed += backoff;
        backoff = (backoff * 2).min(push_backoff_max);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ContainerStatus, PodStatus};

    fn pod_with_readiness(ready: bool) -> Pod {
        Pod {
            status: Some(PodStatus {
                container_statuses: Some(vec![ContainerStatus {
                    ready,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn pod_with_no_status_counts_as_unready() {
        assert!(Reconciler::<NeverBuild>::is_unready(&Pod::default()));
    }

    #[test]
    fn pod_readiness_follows_container_statuses() {
        assert!(!Reconciler::<NeverBuild>::is_unready(&pod_with_readiness(true)));
        assert!(Reconciler::<NeverBuild>::is_unready(&pod_with_readiness(false)));
    }

    struct NeverBuild;

    #[async_trait::async_trait]
    impl ConfigurationProvider for NeverBuild {
        async fn build(&self) -> anyhow::Result<DynamicConfiguration> {
            unreachable!("not exercised by these tests")
        }
    }
}
