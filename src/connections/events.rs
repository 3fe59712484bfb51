//! Persisted connectivity events.
//!
//! The append-only facts from which a connection's state is recovered.
//! The latest event (or snapshot) fully determines current status and
//! lifecycle; a `Deleted` event with no later event means the connection
//! is inaccessible.

use crate::connections::model::{Connection, ConnectionLifecycle, ConnectivityStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One persisted fact with a monotonic sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectivityEvent {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl ConnectivityEvent {
    pub fn new(seq: u64, payload: EventPayload) -> Self {
        Self {
            seq,
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Event payloads; `Created`/`Modified` carry the full connection
/// snapshot, the rest are status transitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EventPayload {
    Created { connection: Connection },
    Modified { connection: Connection },
    Opened,
    Closed,
    Deleted,
}

impl EventPayload {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Created { .. } => "created",
            Self::Modified { .. } => "modified",
            Self::Opened => "opened",
            Self::Closed => "closed",
            Self::Deleted => "deleted",
        }
    }
}

/// State folded from an event sequence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionState {
    pub connection: Option<Connection>,
    pub last_seq: u64,
}

impl ConnectionState {
    pub fn apply(&mut self, event: &ConnectivityEvent) {
        match &event.payload {
            EventPayload::Created { connection } | EventPayload::Modified { connection } => {
                self.connection = Some(connection.clone());
            }
            EventPayload::Opened => {
                if let Some(connection) = &mut self.connection {
                    connection.status = ConnectivityStatus::Open;
                }
            }
            EventPayload::Closed => {
                if let Some(connection) = &mut self.connection {
                    connection.status = ConnectivityStatus::Closed;
                }
            }
            // Soft delete: the connection value stays as a tombstone with
            // the lifecycle flag overwritten.
            EventPayload::Deleted => {
                if let Some(connection) = &mut self.connection {
                    connection.lifecycle = ConnectionLifecycle::Deleted;
                }
            }
        }
        self.last_seq = event.seq;
    }

    /// Fold events in append order; replay is deterministic.
    pub fn replay<'a>(events: impl IntoIterator<Item = &'a ConnectivityEvent>) -> Self {
        let mut state = Self::default();
        for event in events {
            state.apply(event);
        }
        state
    }

    pub fn is_deleted(&self) -> bool {
        self.connection
            .as_ref()
            .map(Connection::is_deleted)
            .unwrap_or(false)
    }

    pub fn desired_open(&self) -> bool {
        self.connection
            .as_ref()
            .map(|c| c.status == ConnectivityStatus::Open && !c.is_deleted())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::model::ConnectionType;

    fn connection(status: ConnectivityStatus) -> Connection {
        Connection::new("c1", ConnectionType::Mqtt5, status, "tcp://broker.local:1883")
    }

    #[test]
    fn test_replay_open_close() {
        let events = vec![
            ConnectivityEvent::new(
                1,
                EventPayload::Created {
                    connection: connection(ConnectivityStatus::Closed),
                },
            ),
            ConnectivityEvent::new(2, EventPayload::Opened),
        ];
        let state = ConnectionState::replay(&events);
        assert!(state.desired_open());
        assert_eq!(state.last_seq, 2);

        let mut state = state;
        state.apply(&ConnectivityEvent::new(3, EventPayload::Closed));
        assert!(!state.desired_open());
    }

    #[test]
    fn test_replay_deleted_keeps_tombstone() {
        let events = vec![
            ConnectivityEvent::new(
                1,
                EventPayload::Created {
                    connection: connection(ConnectivityStatus::Open),
                },
            ),
            ConnectivityEvent::new(2, EventPayload::Deleted),
        ];
        let state = ConnectionState::replay(&events);
        assert!(state.is_deleted());
        assert!(!state.desired_open());
        // The snapshot equals the last connection value with the lifecycle
        // flag overwritten.
        let tombstone = state.connection.unwrap();
        assert_eq!(tombstone.id, "c1");
        assert_eq!(tombstone.lifecycle, ConnectionLifecycle::Deleted);
        assert_eq!(tombstone.uri, "tcp://broker.local:1883");
    }

    #[test]
    fn test_modified_replaces_configuration() {
        let mut replacement = connection(ConnectivityStatus::Open);
        replacement.uri = "tcp://other.local:1883".to_string();
        let events = vec![
            ConnectivityEvent::new(
                1,
                EventPayload::Created {
                    connection: connection(ConnectivityStatus::Closed),
                },
            ),
            ConnectivityEvent::new(
                2,
                EventPayload::Modified {
                    connection: replacement,
                },
            ),
        ];
        let state = ConnectionState::replay(&events);
        assert_eq!(state.connection.unwrap().uri, "tcp://other.local:1883");
    }
}
