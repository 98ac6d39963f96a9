use std::sync::Arc;

/// The dynamic routing configuration built from a cluster snapshot.
///
/// The reconciler never interprets this value: it only compares successive
/// builds for deep equality and serializes the winner to JSON for the
/// data-plane push. The `Arc` makes clones used for diffing and for the
/// `/configuration` admin route cheap.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DynamicConfiguration(Arc<serde_json::Value>);

impl DynamicConfiguration {
    pub fn new(value: serde_json::Value) -> Self {
        Self(Arc::new(value))
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn to_json_vec(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&*self.0)
    }
}

/// Translates the current cluster snapshot into a `DynamicConfiguration`.
///
/// Implementations read from cached listers only -- no network calls on the
/// hot path. Two implementations exist in `maesh-k8s-index` (policy-aware and
/// policy-free); which one backs the reconciler is chosen at startup by CLI
/// flag, never at runtime.
#[async_trait::async_trait]
pub trait ConfigurationProvider: Send + Sync {
    async fn build(&self) -> anyhow::Result<DynamicConfiguration>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_values_compare_equal_regardless_of_field_order() {
        let a = DynamicConfiguration::new(serde_json::json!({"a": 1, "b": 2}));
        let b = DynamicConfiguration::new(serde_json::json!({"b": 2, "a": 1}));
        assert_eq!(a, b);
    }

    #[test]
    fn differing_values_compare_unequal() {
        let a = DynamicConfiguration::new(serde_json::json!({"a": 1}));
        let b = DynamicConfiguration::new(serde_json::json!({"a": 2}));
        assert_ne!(a, b);
    }
}
