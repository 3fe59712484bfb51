//! Connection lifecycle: the durable connection model, its persisted
//! events, the per-connection supervisor actor, and the client connection
//! state machine owning the live broker session.

pub mod client;
pub mod events;
pub mod logs;
pub mod metrics;
pub mod model;
pub mod supervisor;
