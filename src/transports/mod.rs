//! Broker client seam.
//!
//! Wire protocol implementations plug in here: a `Transport` owns one live
//! broker session, and a `TransportRegistry` maps each connection type to
//! a factory. The in-tree MQTT and HTTP-push transports exercise the seam;
//! AMQP 0.9.1/1.0 and Kafka clients register their factories at startup
//! the same way.

pub mod http;
pub mod loopback;
pub mod mqtt;

use crate::connections::client::ConnectionFailure;
use crate::connections::model::{Connection, ConnectionType};
use crate::delivery::sending::PublishResult;
use crate::protocol::error::GatewayError;
use crate::protocol::message::ExternalMessage;
use crate::protocol::signal::{AckLabel, EntityId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Events a live session reports back to its client state machine.
#[derive(Debug)]
pub enum TransportEvent {
    /// A message consumed from one of the connection's sources.
    Inbound(ExternalMessage),
    /// The wire session ended without a requested disconnect.
    Closed { reason: String },
}

/// Everything a transport needs to establish its session: a read-only
/// copy of the connection and the channel it reports events on.
pub struct TransportContext {
    pub connection: Connection,
    pub events: mpsc::UnboundedSender<TransportEvent>,
}

/// The acknowledgement a publish should produce, when the target
/// requested one.
#[derive(Debug, Clone)]
pub struct AckRequest {
    pub label: AckLabel,
    pub entity_id: EntityId,
}

/// One live broker session.
#[async_trait]
pub trait Transport: Send {
    /// Establish the session and start consuming the connection's sources.
    /// Failures carry their classification: validation failures are fatal,
    /// connectivity failures get retried by the caller.
    async fn connect(&mut self, ctx: TransportContext) -> Result<(), ConnectionFailure>;

    /// Tear the session down; idempotent.
    async fn disconnect(&mut self);

    /// Publish one message to a target address.
    async fn publish(
        &mut self,
        address: &str,
        message: ExternalMessage,
        ack: Option<AckRequest>,
    ) -> PublishResult;
}

/// Builds a transport for a connection.
pub type TransportFactory =
    Arc<dyn Fn(&Connection) -> Result<Box<dyn Transport>, GatewayError> + Send + Sync>;

/// Registration table from connection type to transport factory.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    factories: HashMap<ConnectionType, TransportFactory>,
}

impl TransportRegistry {
    /// Registry with the in-tree transports registered.
    pub fn defaults() -> Self {
        let mut registry = Self::default();
        registry.register(ConnectionType::Mqtt3, Arc::new(|connection| {
            let transport: Box<dyn Transport> = Box::new(mqtt::MqttTransport::new(connection)?);
            Ok(transport)
        }));
        registry.register(ConnectionType::Mqtt5, Arc::new(|connection| {
            let transport: Box<dyn Transport> = Box::new(mqtt::MqttTransport::new(connection)?);
            Ok(transport)
        }));
        registry.register(ConnectionType::HttpPush, Arc::new(|connection| {
            let transport: Box<dyn Transport> =
                Box::new(http::HttpPushTransport::new(connection)?);
            Ok(transport)
        }));
        registry
    }

    pub fn register(&mut self, connection_type: ConnectionType, factory: TransportFactory) {
        self.factories.insert(connection_type, factory);
    }

    pub fn create(&self, connection: &Connection) -> Result<Box<dyn Transport>, GatewayError> {
        let factory = self.factories.get(&connection.connection_type).ok_or_else(|| {
            GatewayError::configuration_invalid(format!(
                "no transport registered for connection type '{}'",
                connection.connection_type
            ))
        })?;
        factory(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::model::ConnectivityStatus;

    #[test]
    fn test_unregistered_type_is_validation_error() {
        let registry = TransportRegistry::defaults();
        let connection = Connection::new(
            "c1",
            ConnectionType::Amqp091,
            ConnectivityStatus::Closed,
            "amqp://broker.local:5672",
        );
        let err = registry.create(&connection).err().unwrap();
        assert_eq!(err.code, "connectivity:connection.configuration.invalid");
    }
}
