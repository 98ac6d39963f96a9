use std::fmt;

/// Uniquely identifies a user service: `(namespace, name)`.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ServiceKey {
    pub namespace: String,
    pub name: String,
}

impl ServiceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Identifies one exposed port of a user service: `(namespace, name,
/// port)`. This is the key space the TCP port allocator maps into integer
/// ports.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ServicePortRef {
    pub namespace: String,
    pub name: String,
    pub port: i32,
}

impl ServicePortRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, port: i32) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            port,
        }
    }

    pub fn key(&self) -> ServiceKey {
        ServiceKey::new(self.namespace.clone(), self.name.clone())
    }
}

impl fmt::Display for ServicePortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.namespace, self.name, self.port)
    }
}

/// The routing discipline declared for a user service via the
/// `maesh.containo.us/traffic-type` annotation. Missing or empty falls back to
/// the process-configured default.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum ServiceMode {
    Http,
    Tcp,
}

impl ServiceMode {
    /// Parses the `maesh.containo.us/traffic-type` annotation value, falling
    /// back to `default` when the annotation is absent or empty rather than
    /// failing -- the annotation is advisory, not validated input.
    pub fn from_annotation(value: Option<&str>, default: ServiceMode) -> Self {
        match value.map(str::trim) {
            Some("http") => ServiceMode::Http,
            Some("tcp") => ServiceMode::Tcp,
            _ => default,
        }
    }
}

impl fmt::Display for ServiceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ServiceMode::Http => "http",
            ServiceMode::Tcp => "tcp",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_defaults_on_missing_or_empty_annotation() {
        assert_eq!(
            ServiceMode::from_annotation(None, ServiceMode::Http),
            ServiceMode::Http
        );
        assert_eq!(
            ServiceMode::from_annotation(Some(""), ServiceMode::Tcp),
            ServiceMode::Tcp
        );
        assert_eq!(
            ServiceMode::from_annotation(Some(" tcp "), ServiceMode::Http),
            ServiceMode::Tcp
        );
    }
}
