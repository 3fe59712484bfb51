//! Typed gateway errors.
//!
//! Every error crossing a request/response boundary carries a stable
//! machine-readable code, an HTTP-status-like classification, a
//! human-readable message, an optional description, and an optional
//! correlation id so multi-hop responses can be matched back to the
//! original request.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification driving retry and propagation behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed configuration or input. Fatal, never retried.
    Validation,
    /// Broker unreachable, socket reset. Transient, retried with backoff.
    Connectivity,
    /// A mapper failed or produced an oversized result. Scoped to one message.
    Mapping,
    /// Inbound identity did not match the enforcement rule.
    Enforcement,
    /// The connection is deleted or unknown.
    NotAccessible,
    /// A bounded wait elapsed.
    Timeout,
    /// Unexpected internal condition.
    Internal,
}

impl ErrorKind {
    /// Whether retrying without changing inputs may succeed.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Connectivity | Self::Timeout)
    }
}

/// Gateway error value.
///
/// A closed error struct with a `kind` discriminant rather than one type
/// per condition; constructors below cover the conditions the gateway
/// raises.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct GatewayError {
    pub kind: ErrorKind,
    /// Stable machine-readable code, e.g. `connectivity:connection.failed`.
    pub code: String,
    /// HTTP-status-like classification.
    pub status: u16,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl GatewayError {
    fn new(kind: ErrorKind, code: &str, status: u16, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.to_string(),
            status,
            message: message.into(),
            description: None,
            correlation_id: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Invalid connection configuration.
    pub fn configuration_invalid(message: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Validation,
            "connectivity:connection.configuration.invalid",
            400,
            message,
        )
    }

    /// Connection URI could not be parsed.
    pub fn uri_invalid(uri: &str) -> Self {
        Self::new(
            ErrorKind::Validation,
            "connectivity:connection.uri.invalid",
            400,
            format!("connection URI '{uri}' is not valid"),
        )
    }

    /// The configured host is on the blocklist.
    pub fn host_blocked(host: &str) -> Self {
        Self::new(
            ErrorKind::Validation,
            "connectivity:connection.host.blocked",
            422,
            format!("host '{host}' may not be used for connections"),
        )
        .with_description("Configure a host that is not blocked by the gateway.")
    }

    /// A live connect/disconnect operation failed.
    pub fn connection_failed(description: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Connectivity,
            "connectivity:connection.failed",
            502,
            "the connection to the external endpoint failed",
        )
        .with_description(description)
    }

    /// The connection id resolves to a deleted or unknown connection.
    pub fn connection_not_accessible(id: &str) -> Self {
        Self::new(
            ErrorKind::NotAccessible,
            "connectivity:connection.not.accessible",
            404,
            format!("connection '{id}' is not accessible"),
        )
    }

    /// A connection with this id already exists.
    pub fn connection_conflict(id: &str) -> Self {
        Self::new(
            ErrorKind::Validation,
            "connectivity:connection.conflict",
            409,
            format!("a connection with id '{id}' already exists"),
        )
    }

    /// A mapper raised or produced an unusable result.
    pub fn mapping_failed(mapper: &str, description: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Mapping,
            "connectivity:message.mapping.failed",
            400,
            format!("mapping failed in mapper '{mapper}'"),
        )
        .with_description(description)
    }

    /// The inbound identity did not satisfy the enforcement rule.
    pub fn enforcement_rejected(input: &str) -> Self {
        Self::new(
            ErrorKind::Enforcement,
            "connectivity:connection.id.enforcement.failed",
            400,
            format!("the identity '{input}' did not match the enforcement rule"),
        )
    }

    /// An unresolved placeholder remained after substitution.
    pub fn placeholder_unresolved(token: &str) -> Self {
        Self::new(
            ErrorKind::Validation,
            "connectivity:placeholder.unresolved",
            400,
            format!("placeholder '{token}' could not be resolved"),
        )
    }

    /// A bounded wait for responses or confirmations elapsed.
    pub fn timeout(what: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, "connectivity:timeout", 408, what)
    }

    /// A publish completed without producing the acknowledgement the
    /// target requested.
    pub fn null_acknowledgement() -> Self {
        Self::new(
            ErrorKind::Internal,
            "connectivity:acknowledgement.missing",
            503,
            "the publish completed without yielding the requested acknowledgement",
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, "connectivity:internal.error", 500, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_stable() {
        assert_eq!(
            GatewayError::host_blocked("10.0.0.1").code,
            "connectivity:connection.host.blocked"
        );
        assert_eq!(GatewayError::connection_not_accessible("c1").status, 404);
    }

    #[test]
    fn test_retryability_follows_kind() {
        assert!(GatewayError::connection_failed("broker down").is_retryable());
        assert!(!GatewayError::configuration_invalid("bad").is_retryable());
        assert!(!GatewayError::enforcement_rejected("x").is_retryable());
    }

    #[test]
    fn test_correlation_id_round_trip() {
        let err = GatewayError::mapping_failed("default", "boom").with_correlation_id("corr-1");
        let json = serde_json::to_string(&err).unwrap();
        let back: GatewayError = serde_json::from_str(&json).unwrap();
        assert_eq!(back.correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(back, err);
    }
}
