/// One port entry of a shadow service, as constructed by the
/// `ShadowServiceManager` port-construction algorithm (see `maesh-k8s-index`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShadowPort {
    pub name: String,
    pub port: i32,
    pub target_port: i32,
}
