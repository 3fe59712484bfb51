//! Signal routing: filtering, RQL expressions, placeholders, enforcement,
//! and the in-process pub/sub broker.

pub mod enforcement;
pub mod filter;
pub mod placeholder;
pub mod pubsub;
pub mod rql;
