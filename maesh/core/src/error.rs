use thiserror::Error;

/// Errors returned by `PortAllocator::add`.
///
/// Kept free of any Kubernetes-specific error type so this crate stays
/// cluster-agnostic; `maesh-k8s-index` boxes its `kube::Error` into the
/// `Persistence` variant.
#[derive(Debug, Error)]
pub enum PortAllocatorError {
    /// The `[minPort, maxPort]` range has no unassigned port left.
    #[error("TCP port range is exhausted")]
    Exhausted,

    /// The in-memory claim succeeded but persisting it failed. The claim is
    /// retained rather than rolled back; this error only tells the caller
    /// that durability is deferred to a future successful save.
    #[error("failed to persist port map: {0}")]
    Persistence(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

/// Errors returned by the reconciler's per-cycle fan-out.
#[derive(Debug, Error)]
pub enum FanOutError {
    /// No data-plane pods were found to push configuration to.
    #[error("no data-plane instances found")]
    NoInstances,

    /// At least one instance push failed; individual failures are recorded in
    /// the `DeployLog`, this only reports the aggregate outcome of the cycle.
    #[error("{failed} of {total} data-plane instances failed to receive the configuration")]
    PartialFailure { failed: usize, total: usize },
}
