//! Networking: client TLS configuration for broker sessions.

pub mod tls;
