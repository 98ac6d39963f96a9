use maesh_core::{ServiceKey, ServicePortRef};
use thiserror::Error;

/// Hex encoding of the ASCII string `maesh`, used as a fixed separator in
/// shadow-service names to make collisions with user-chosen names
/// vanishingly unlikely.
const SHADOW_NAME_INTERFIX: &str = "6d61657368";

/// Derives the shadow service name for a user service: deterministic, total,
/// and collision-resistant across the `(namespace, name)` domain.
///
/// Kubernetes itself bounds `namespace` and `name` to 63-character DNS
/// labels, so the derived name (two labels plus a 10-character fixed
/// interfix and two hyphens) never approaches the 253-character object-name
/// limit; no truncation or hashing is needed.
pub fn shadow_service_name(mesh_namespace: &str, user: &ServiceKey) -> String {
    format!(
        "{mesh_namespace}-{name}-{SHADOW_NAME_INTERFIX}-{namespace}",
        name = user.name,
        namespace = user.namespace,
    )
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseServiceNamePortError {
    #[error("missing ':<port>' suffix in {0:?}")]
    MissingPort(String),
    #[error("invalid port in {0:?}")]
    InvalidPort(String),
}

/// Formats a `ServicePortRef` as a port-map document value:
/// `<namespace>/<name>:<port>`.
pub fn format_service_name_port(port_ref: &ServicePortRef) -> String {
    format!(
        "{}/{}:{}",
        port_ref.namespace, port_ref.name, port_ref.port
    )
}

/// Parses a port-map document value. Accepts both the current
/// `<namespace>/<name>:<port>` form and the legacy `<name>:<port>` form (no
/// slash), which is interpreted against `default_namespace`.
pub fn parse_service_name_port(
    value: &str,
    default_namespace: &str,
) -> Result<ServicePortRef, ParseServiceNamePortError> {
    let (name_part, port_part) = value
        .rsplit_once(':')
        .ok_or_else(|| ParseServiceNamePortError::MissingPort(value.to_string()))?;
    let port = port_part
        .parse::<i32>()
        .map_err(|_| ParseServiceNamePortError::InvalidPort(value.to_string()))?;

    let (namespace, name) = match name_part.split_once('/') {
        Some((ns, name)) => (ns.to_string(), name.to_string()),
        None => (default_namespace.to_string(), name_part.to_string()),
    };

    Ok(ServicePortRef::new(namespace, name, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shadow_name_follows_the_fixed_scheme() {
        let key = ServiceKey::new("default", "web");
        assert_eq!(
            shadow_service_name("maesh", &key),
            "maesh-web-6d61657368-default"
        );
    }

    #[test]
    fn round_trips_through_format_and_parse() {
        let port_ref = ServicePortRef::new("default", "db", 5432);
        let formatted = format_service_name_port(&port_ref);
        assert_eq!(formatted, "default/db:5432");
        let parsed = parse_service_name_port(&formatted, "maesh").unwrap();
        assert_eq!(parsed, port_ref);
    }

    #[test]
    fn legacy_form_without_slash_uses_default_namespace() {
        let parsed = parse_service_name_port("db:5432", "default").unwrap();
        assert_eq!(parsed, ServicePortRef::new("default", "db", 5432));
    }

    #[test]
    fn missing_port_is_rejected() {
        assert_eq!(
            parse_service_name_port("default/db", "default"),
            Err(ParseServiceNamePortError::MissingPort(
                "default/db".to_string()
            ))
        );
    }

    #[test]
    fn non_numeric_port_is_rejected() {
        assert!(matches!(
            parse_service_name_port("default/db:abc", "default"),
            Err(ParseServiceNamePortError::InvalidPort(_))
        ));
    }
}
