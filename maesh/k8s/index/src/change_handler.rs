//! The `ChangeHandler`: filters cluster events through the ignore policy,
//! drives the shadow-service lifecycle, and emits coalesced refresh signals
//! to the reconciler.

use crate::{ignore::IgnorePolicy, shadow_manager::ShadowOps};
use k8s_openapi::api::core::v1::{Endpoints, Pod};
use maesh_core::ServiceKey;
use maesh_k8s_api::{ResourceExt, Service};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::mpsc;
use tracing::debug;

/// Tags a refresh request so the reconciler can tell a "something might have
/// changed" nudge (`Normal`) from a "a shadow service was just mutated, this
/// must be deployed even if the rebuilt config looks the same" nudge
/// (`Force`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshTag {
    Normal,
    Force,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefreshSignal {
    pub tag: RefreshTag,
}

impl RefreshSignal {
    pub fn normal() -> Self {
        Self {
            tag: RefreshTag::Normal,
        }
    }

    pub fn force() -> Self {
        Self {
            tag: RefreshTag::Force,
        }
    }
}

/// A queued shadow-service mutation, carrying enough of the event to apply it
/// without re-reading the handler's own state.
enum ShadowJob {
    Apply { old: Option<Service>, new: Service },
    Delete { namespace: String, name: String },
}

/// Drains queued shadow-service mutations one at a time, in arrival order,
/// and nudges the reconciler once each one lands.
///
/// Running these off a single worker task (rather than a fresh `tokio::spawn`
/// per event) is what keeps two rapid-fire events for the same service --
/// create-then-update, or update-then-update -- from racing each other as
/// independent concurrent tasks: the second write could otherwise finish
/// before the first and leave the shadow service's ports on stale data.
async fn run_shadow_worker<S>(
    shadow_ops: Arc<S>,
    mut job_rx: mpsc::UnboundedReceiver<ShadowJob>,
    refresh_tx: mpsc::Sender<RefreshSignal>,
) where
    S: ShadowOps,
{
    while let Some(job) = job_rx.recv().await {
        match job {
            ShadowJob::Apply { old, new } => match old {
                Some(old) => shadow_ops.on_update(&old, &new).await,
                None => shadow_ops.on_create(&new).await,
            },
            ShadowJob::Delete { namespace, name } => {
                shadow_ops.on_delete(&namespace, &name).await;
            }
        }
        let _ = refresh_tx.send(RefreshSignal::force()).await;
    }
}

/// Indexes cluster watch events into shadow-service operations and refresh
/// signals. Wrapped in `Arc<parking_lot::RwLock<_>>` by callers so it can
/// implement `kubert::index::IndexNamespacedResource` for every resource kind
/// the handler observes.
///
/// `apply`/`delete` are synchronous (the trait they implement is), so a
/// service mutation is handed off to `run_shadow_worker` over an unbounded
/// channel rather than awaited inline; the worker applies queued jobs
/// strictly in the order they were queued, so ordering between events for the
/// same service is preserved even though the handler methods themselves
/// return immediately.
pub struct ChangeHandler<S> {
    ignore_policy: IgnorePolicy,
    job_tx: mpsc::UnboundedSender<ShadowJob>,
    refresh_tx: mpsc::Sender<RefreshSignal>,
    seen_services: HashMap<ServiceKey, Service>,
}

impl<S> ChangeHandler<S>
where
    S: ShadowOps + 'static,
{
    pub fn new(
        ignore_policy: IgnorePolicy,
        shadow_ops: Arc<S>,
        refresh_tx: mpsc::Sender<RefreshSignal>,
    ) -> Self {
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_shadow_worker(shadow_ops, job_rx, refresh_tx.clone()));
        Self {
            ignore_policy,
            job_tx,
            refresh_tx,
            seen_services: HashMap::new(),
        }
    }

    fn is_service_ignored(&self, svc: &Service) -> bool {
        let namespace = svc.namespace().unwrap_or_default();
        let name = svc.name_any();
        if self.ignore_policy.is_ignored_service(&namespace, &name) {
            return true;
        }
        svc.metadata
            .labels
            .as_ref()
            .map(|labels| self.ignore_policy.is_ignored_by_labels(labels))
            .unwrap_or(false)
    }

    fn send_refresh(&self, signal: RefreshSignal) {
        let tx = self.refresh_tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(signal).await;
        });
    }

    fn apply_service(&mut self, svc: Service) {
        if self.is_service_ignored(&svc) {
            debug!(name = %svc.name_any(), "ignoring service event");
            return;
        }

        let namespace = svc.namespace().unwrap_or_default();
        let name = svc.name_any();
        let key = ServiceKey::new(namespace, name);
        let old = self.seen_services.insert(key, svc.clone());
        let _ = self.job_tx.send(ShadowJob::Apply { old, new: svc });
    }

    fn delete_service(&mut self, namespace: String, name: String) {
        let key = ServiceKey::new(namespace.clone(), name.clone());
        if self.ignore_policy.is_ignored_service(&namespace, &name) {
            self.seen_services.remove(&key);
            return;
        }
        self.seen_services.remove(&key);
        let _ = self.job_tx.send(ShadowJob::Delete { namespace, name });
    }

    /// Non-service events (endpoints, pods, traffic policy) never drive the
    /// shadow-service lifecycle; they only ever request a `Normal` rebuild,
    /// still gated by the ignore policy so the data-plane's own pods and
    /// endpoints don't cause refresh storms.
    fn note_generic_event(&self, namespace: &str) {
        if self.ignore_policy.is_ignored_namespace(namespace) {
            return;
        }
        self.send_refresh(RefreshSignal::normal());
    }
}

impl<S> kubert::index::IndexNamespacedResource<Service> for ChangeHandler<S>
where
    S: ShadowOps + 'static,
{
    fn apply(&mut self, svc: Service) {
        self.apply_service(svc);
    }

    fn delete(&mut self, ns: String, name: String) {
        self.delete_service(ns, name);
    }
}

impl<S> kubert::index::IndexNamespacedResource<Endpoints> for ChangeHandler<S>
where
    S: ShadowOps + 'static,
{
    fn apply(&mut self, endpoints: Endpoints) {
        let namespace = endpoints.namespace().unwrap_or_default();
        self.note_generic_event(&namespace);
    }

    fn delete(&mut self, ns: String, _name: String) {
        self.note_generic_event(&ns);
    }
}

impl<S> kubert::index::IndexNamespacedResource<Pod> for ChangeHandler<S>
where
    S: ShadowOps + 'static,
{
    fn apply(&mut self, pod: Pod) {
        let namespace = pod.namespace().unwrap_or_default();
        self.note_generic_event(&namespace);
    }

    fn delete(&mut self, ns: String, _name: String) {
        self.note_generic_event(&ns);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::ServiceSpec;
    use maesh_k8s_api::ObjectMeta;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingShadowOps {
        creates: AtomicUsize,
        updates: AtomicUsize,
        deletes: AtomicUsize,
    }

    #[async_trait]
    impl ShadowOps for CountingShadowOps {
        async fn on_create(&self, _user: &Service) {
            self.creates.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_update(&self, _old: &Service, _new: &Service) {
            self.updates.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_delete(&self, _namespace: &str, _name: &str) {
            self.deletes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn service(namespace: &str, name: &str) -> Service {
        Service {
            metadata: ObjectMeta {
                namespace: Some(namespace.to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec::default()),
            status: None,
        }
    }

    fn handler() -> (
        ChangeHandler<CountingShadowOps>,
        Arc<CountingShadowOps>,
        mpsc::Receiver<RefreshSignal>,
    ) {
        let (tx, rx) = mpsc::channel(8);
        let shadow_ops = Arc::new(CountingShadowOps::default());
        let handler = ChangeHandler::new(IgnorePolicy::default(), shadow_ops.clone(), tx);
        (handler, shadow_ops, rx)
    }

    #[tokio::test]
    async fn first_apply_creates_second_updates_in_order() {
        let (mut handler, shadow_ops, mut rx) = handler();
        handler.apply_service(service("default", "web"));
        handler.apply_service(service("default", "web"));

        // The worker sends its force signal only after the op it belongs to
        // has completed, so waiting for both signals also waits for both ops.
        assert_eq!(rx.recv().await.unwrap().tag, RefreshTag::Force);
        assert_eq!(rx.recv().await.unwrap().tag, RefreshTag::Force);

        assert_eq!(shadow_ops.creates.load(Ordering::SeqCst), 1);
        assert_eq!(shadow_ops.updates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ignored_namespace_never_reaches_shadow_ops() {
        let (tx, mut rx) = mpsc::channel(8);
        let shadow_ops = Arc::new(CountingShadowOps::default());
        let ignore_policy = IgnorePolicy::new(
            "maesh",
            "kube-system",
            Vec::<String>::new(),
            Vec::<(String, String)>::new(),
            Vec::<(String, String)>::new(),
        );
        let mut handler = ChangeHandler::new(ignore_policy, shadow_ops.clone(), tx);
        handler.apply_service(service("kube-system", "kube-dns"));

        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
        assert_eq!(shadow_ops.creates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn generic_event_emits_normal_refresh() {
        let (mut handler, _shadow_ops, mut rx) = handler();
        handler.note_generic_event("default");
        assert_eq!(rx.recv().await.unwrap().tag, RefreshTag::Normal);
    }
}
