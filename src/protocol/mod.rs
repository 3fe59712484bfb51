//! Protocol values crossing the gateway boundary.
//!
//! - `signal` - the internal envelope exchanged with the platform core
//! - `message` - the external wire message exchanged with brokers
//! - `error` - the typed error surface shared by both directions

pub mod error;
pub mod message;
pub mod signal;
