//! Signal mapping engine.
//!
//! Bidirectional transformation between internal signals and external wire
//! messages through ordered chains of named mappers. Every mapping attempt
//! yields exactly one outcome (mapped, dropped, or error); consumers visit
//! the union exhaustively.

pub mod mapper;
pub mod pipeline;
pub mod registry;

use crate::connections::model::Target;
use crate::protocol::error::GatewayError;
use crate::protocol::signal::Signal;
use serde_json::Value;

/// Result of one mapper invocation on one input.
#[derive(Debug, Clone)]
pub enum MappingOutcome<T> {
    /// The mapper produced a value. A mapper returning several values
    /// yields several `Mapped` outcomes (duplication support).
    Mapped { mapper: String, value: T },
    /// The mapper legitimately produced nothing for this input.
    Dropped { mapper: String },
    /// The mapper failed; scoped to this input only.
    Error {
        mapper: String,
        error: GatewayError,
        topic_path: Option<String>,
    },
}

impl<T> MappingOutcome<T> {
    pub fn mapper(&self) -> &str {
        match self {
            Self::Mapped { mapper, .. }
            | Self::Dropped { mapper }
            | Self::Error { mapper, .. } => mapper,
        }
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self, Self::Mapped { .. })
    }
}

/// An internal signal addressed to the subset of targets that passed
/// filtering, optionally carrying enrichment fields fetched before
/// mapping.
#[derive(Debug, Clone)]
pub struct OutboundSignal {
    pub signal: Signal,
    pub targets: Vec<Target>,
    pub extra: Option<Value>,
}

impl OutboundSignal {
    pub fn new(signal: Signal, targets: Vec<Target>) -> Self {
        Self {
            signal,
            targets,
            extra: None,
        }
    }

    pub fn with_extra(mut self, extra: Value) -> Self {
        self.extra = Some(extra);
        self
    }
}
