//! MQTT transport over rumqttc.
//!
//! Serves both MQTT 3.1.1 and MQTT 5 connection types. The connect call
//! drives the event loop until the broker acknowledges the session and
//! subscribes every source address; afterwards a pump task turns incoming
//! publishes into transport events until the session dies.

use crate::connections::client::ConnectionFailure;
use crate::connections::model::{Connection, ConnectionUri};
use crate::delivery::sending::PublishResult;
use crate::net::tls;
use crate::protocol::error::GatewayError;
use crate::protocol::message::ExternalMessage;
use crate::protocol::signal::Acknowledgement;
use crate::transports::{AckRequest, Transport, TransportContext, TransportEvent};
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, Incoming, MqttOptions, QoS, TlsConfiguration,
    Transport as WireTransport,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Header carrying the concrete MQTT topic a message arrived on.
pub const MQTT_TOPIC_HEADER: &str = "mqtt-topic";

pub struct MqttTransport {
    connection: Connection,
    uri: ConnectionUri,
    client: Option<AsyncClient>,
    pump: Option<JoinHandle<()>>,
}

impl MqttTransport {
    pub fn new(connection: &Connection) -> Result<Self, GatewayError> {
        let uri = ConnectionUri::parse(&connection.uri)?;
        Ok(Self {
            connection: connection.clone(),
            uri,
            client: None,
            pump: None,
        })
    }

    fn options(&self) -> Result<MqttOptions, ConnectionFailure> {
        let port = self
            .uri
            .port
            .unwrap_or(if self.uri.is_tls() { 8883 } else { 1883 });
        let client_id = format!(
            "twinlink-{}-{}",
            self.connection.id,
            uuid::Uuid::new_v4()
                .to_string()
                .split('-')
                .next()
                .unwrap_or("xxxx")
        );
        let mut options = MqttOptions::new(client_id, self.uri.host.clone(), port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_session(true);
        if let Some(username) = &self.uri.username {
            options.set_credentials(username, self.uri.password.as_deref().unwrap_or_default());
        }
        if self.uri.is_tls() {
            let config = tls::client_config(
                self.connection.validate_certificates,
                self.connection.trusted_certificates.as_deref(),
            )
            .map_err(|error| {
                ConnectionFailure::validation("TLS configuration rejected", Some(error))
            })?;
            options.set_transport(WireTransport::tls_with_config(TlsConfiguration::Rustls(
                Arc::new(config),
            )));
        }
        Ok(options)
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&mut self, ctx: TransportContext) -> Result<(), ConnectionFailure> {
        let options = self.options()?;
        let (client, mut eventloop) = AsyncClient::new(options, 64);

        // Drive the event loop until the broker acknowledges the session.
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                    if ack.code != ConnectReturnCode::Success {
                        return Err(ConnectionFailure::connectivity(
                            format!("broker rejected the session: {:?}", ack.code),
                            None,
                        ));
                    }
                    break;
                }
                Ok(_) => continue,
                Err(err) => {
                    return Err(ConnectionFailure::connectivity(
                        format!("mqtt connect: {err}"),
                        None,
                    ))
                }
            }
        }

        for source in &ctx.connection.sources {
            for address in &source.addresses {
                client
                    .subscribe(address, QoS::AtLeastOnce)
                    .await
                    .map_err(|err| {
                        ConnectionFailure::connectivity(
                            format!("subscribe '{address}': {err}"),
                            None,
                        )
                    })?;
            }
        }

        let events = ctx.events;
        self.pump = Some(tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        let topic = publish.topic.clone();
                        let message = match String::from_utf8(publish.payload.to_vec()) {
                            Ok(text) => ExternalMessage::new().with_text_payload(text),
                            Err(_) => {
                                ExternalMessage::new().with_bytes_payload(publish.payload.to_vec())
                            }
                        };
                        let message = message
                            .with_header(MQTT_TOPIC_HEADER, topic.clone())
                            .with_source_address(topic);
                        if events.send(TransportEvent::Inbound(message)).is_err() {
                            break;
                        }
                    }
                    Ok(event) => {
                        debug!(?event, "mqtt event");
                    }
                    Err(err) => {
                        let _ = events.send(TransportEvent::Closed {
                            reason: err.to_string(),
                        });
                        break;
                    }
                }
            }
        }));
        self.client = Some(client);
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(client) = self.client.take() {
            let _ = client.disconnect().await;
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }

    async fn publish(
        &mut self,
        address: &str,
        message: ExternalMessage,
        ack: Option<AckRequest>,
    ) -> PublishResult {
        let Some(client) = &self.client else {
            return Err(GatewayError::connection_failed("mqtt session is not connected"));
        };
        let payload = message
            .payload()
            .map(|p| p.as_bytes().to_vec())
            .unwrap_or_default();
        client
            .publish(address, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|err| GatewayError::connection_failed(format!("mqtt publish: {err}")))?;
        // QoS 1 completion is tracked by the event loop; the queued publish
        // satisfies the issued acknowledgement.
        Ok(ack.map(|request| Acknowledgement::success(request.label, request.entity_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::model::{ConnectionType, ConnectivityStatus};

    fn connection(uri: &str) -> Connection {
        Connection::new("c1", ConnectionType::Mqtt5, ConnectivityStatus::Open, uri)
    }

    #[test]
    fn test_bad_uri_is_rejected_at_construction() {
        assert!(MqttTransport::new(&connection("not-a-uri")).is_err());
    }

    #[test]
    fn test_tls_scheme_defaults_to_8883() {
        let transport = MqttTransport::new(&connection("mqtts://broker.local")).unwrap();
        assert!(transport.uri.is_tls());
        assert_eq!(transport.uri.port, None);
        let options = transport.options().unwrap();
        assert_eq!(options.broker_address(), ("broker.local".to_string(), 8883));
    }

    #[test]
    fn test_plain_scheme_defaults_to_1883() {
        let transport = MqttTransport::new(&connection("tcp://broker.local")).unwrap();
        let options = transport.options().unwrap();
        assert_eq!(options.broker_address(), ("broker.local".to_string(), 1883));
    }
}
