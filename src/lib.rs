// Module naming: common pattern in domain-driven code
#![allow(clippy::module_name_repetitions)]
// Function complexity: some functions are inherently complex
#![allow(clippy::too_many_lines)]
#![allow(clippy::too_many_arguments)]
// Format strings: allow non-inlined for readability
#![allow(clippy::uninlined_format_args)]
// Error handling style
#![allow(clippy::result_large_err)]
#![allow(clippy::large_enum_variant)]
// Async functions that may not await yet
#![allow(clippy::unused_async)]

//! Twinlink - connectivity gateway for the device-twin platform.
//!
//! Maintains long-lived managed connections to external messaging brokers,
//! translates between the internal signal envelope and wire-specific
//! payloads, and enforces authorization, acknowledgement, and filtering
//! semantics on every signal crossing the boundary.
//!
//! # Module Organization
//!
//! ## Core
//! - `core::config` - Configuration parsing and validation
//! - `core::runtime` - Gateway wiring and recovery
//! - `core::time` - Deterministic time utilities
//!
//! ## Protocol
//! - `protocol::signal` - Internal signal envelope, topic paths, acks
//! - `protocol::message` - External wire message value and header filters
//! - `protocol::error` - Typed gateway errors with stable codes
//!
//! ## Connections
//! - `connections::model` - Connection, sources, targets, validation
//! - `connections::events` - Persisted connectivity events and replay
//! - `connections::supervisor` - Per-connection persistent actor + registry
//! - `connections::client` - Client connection state machine
//! - `connections::metrics` - Per-connection counters
//! - `connections::logs` - Bounded per-connection log buffer
//!
//! ## Mapping
//! - `mapping::mapper` - Mapper trait, config, built-in mappers
//! - `mapping::registry` - Alias-to-factory mapper registry
//! - `mapping::pipeline` - Inbound/outbound mapping with target grouping
//!
//! ## Routing
//! - `routing::filter` - Per-target signal filtering
//! - `routing::rql` - RQL filter expressions
//! - `routing::placeholder` - `{{ prefix:name }}` resolution
//! - `routing::enforcement` - Inbound identity enforcement
//! - `routing::pubsub` - In-process signal broker
//!
//! ## Delivery
//! - `delivery::sending` - Sending/Dropped publish decisions, weak acks
//! - `delivery::collector` - Per-request response collection
//!
//! ## Storage
//! - `storage::journal` - Append-only event journal with snapshots
//!
//! ## Transports
//! - `transports` - Broker client seam (MQTT, HTTP-push, loopback)
//!
//! ## Networking / Operations
//! - `net::tls` - Client TLS configuration
//! - `ops::telemetry` - Tracing initialization

// Core infrastructure
pub mod core;

// Protocol envelope and wire values
pub mod protocol;

// Connection lifecycle
pub mod connections;

// Signal mapping
pub mod mapping;

// Filtering and routing
pub mod routing;

// Publish decisions and acknowledgements
pub mod delivery;

// Persistence
pub mod storage;

// Broker client seam
pub mod transports;

// Networking
pub mod net;

// Operations
pub mod ops;

// CLI
pub mod cli;

// Re-exports for convenience
pub use self::core::{config, runtime, time};
pub use ops::telemetry;
pub use protocol::{error, message, signal};
pub use storage::journal;
