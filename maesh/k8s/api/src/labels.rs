//! Label and annotation constants shared by the shadow-service manager, the
//! ignore policy, and the data-plane pod selector.

/// Carried by every shadow service so it can be identified as mesh-owned.
pub const MESH_APP_LABEL: &str = "app";
pub const MESH_APP_VALUE: &str = "maesh";

/// Selects data-plane pods; also used as the shadow service's pod selector.
pub const DATA_PLANE_COMPONENT_LABEL: &str = "component";
pub const DATA_PLANE_COMPONENT_VALUE: &str = "maesh-mesh";

/// Declares a user service's routing discipline. See
/// `maesh_core::ServiceMode::from_annotation`.
pub const TRAFFIC_TYPE_ANNOTATION: &str = "maesh.containo.us/traffic-type";

/// Declares a user service's traffic split, consumed by the policy-aware
/// `ConfigurationProvider`. Grammar: comma-separated `name@weight` pairs,
/// e.g. `stable@90,canary@10`.
pub const TRAFFIC_SPLIT_ANNOTATION: &str = "maesh.containo.us/traffic-split";
