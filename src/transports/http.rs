//! HTTP-push transport over reqwest.
//!
//! Push-only: signals map to POST requests against the connection's base
//! URI, with the target address appended as the request path. There is no
//! consume path, so configuring sources on an http-push connection is a
//! validation failure at connect time.

use crate::connections::client::ConnectionFailure;
use crate::connections::model::{Connection, ConnectionUri};
use crate::delivery::sending::PublishResult;
use crate::net::tls;
use crate::protocol::error::GatewayError;
use crate::protocol::message::ExternalMessage;
use crate::protocol::signal::Acknowledgement;
use crate::transports::{AckRequest, Transport, TransportContext};
use async_trait::async_trait;
use reqwest::header::{HeaderName, HeaderValue};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

pub struct HttpPushTransport {
    base: String,
    validate_certificates: bool,
    trusted_certificates: Option<String>,
    client: Option<reqwest::Client>,
}

impl HttpPushTransport {
    pub fn new(connection: &Connection) -> Result<Self, GatewayError> {
        let uri = ConnectionUri::parse(&connection.uri)?;
        if !matches!(uri.scheme.as_str(), "http" | "https") {
            return Err(GatewayError::configuration_invalid(format!(
                "http-push connections need an http or https URI, got '{}'",
                uri.scheme
            )));
        }
        Ok(Self {
            base: connection.uri.trim_end_matches('/').to_string(),
            validate_certificates: connection.validate_certificates,
            trusted_certificates: connection.trusted_certificates.clone(),
            client: None,
        })
    }

    fn build_client(&self) -> Result<reqwest::Client, ConnectionFailure> {
        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .danger_accept_invalid_certs(!self.validate_certificates);
        if let Some(pem) = &self.trusted_certificates {
            let der_certs = tls::parse_cert_bundle(pem).map_err(|error| {
                ConnectionFailure::validation("invalid trusted certificate bundle", Some(error))
            })?;
            for der in der_certs {
                let cert = reqwest::Certificate::from_der(&der).map_err(|e| {
                    ConnectionFailure::validation(
                        format!("unusable trusted certificate: {e}"),
                        Some(GatewayError::configuration_invalid(e.to_string())),
                    )
                })?;
                builder = builder.add_root_certificate(cert);
            }
        }
        builder.build().map_err(|e| {
            ConnectionFailure::validation(
                format!("http client rejected configuration: {e}"),
                None,
            )
        })
    }

    fn url_for(&self, address: &str) -> String {
        if address.starts_with('/') {
            format!("{}{}", self.base, address)
        } else {
            format!("{}/{}", self.base, address)
        }
    }
}

#[async_trait]
impl Transport for HttpPushTransport {
    async fn connect(&mut self, ctx: TransportContext) -> Result<(), ConnectionFailure> {
        if !ctx.connection.sources.is_empty() {
            return Err(ConnectionFailure::validation(
                "http-push connections cannot consume messages",
                Some(GatewayError::configuration_invalid(
                    "http-push connections must not declare sources",
                )),
            ));
        }
        let client = self.build_client()?;
        // Reachability probe; any HTTP status counts as reachable.
        match client.head(&self.base).send().await {
            Ok(response) => {
                debug!(status = %response.status(), "http-push endpoint probed");
            }
            Err(err) => {
                return Err(ConnectionFailure::connectivity(
                    format!("http-push endpoint unreachable: {err}"),
                    None,
                ))
            }
        }
        self.client = Some(client);
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.client = None;
    }

    async fn publish(
        &mut self,
        address: &str,
        message: ExternalMessage,
        ack: Option<AckRequest>,
    ) -> PublishResult {
        let Some(client) = &self.client else {
            return Err(GatewayError::connection_failed("http session is not connected"));
        };
        let mut request = client.post(self.url_for(address));
        for (name, value) in message.headers() {
            if let (Ok(name), Ok(value)) =
                (HeaderName::from_str(name), HeaderValue::from_str(value))
            {
                request = request.header(name, value);
            }
        }
        if let Some(payload) = message.payload() {
            request = request.body(payload.as_bytes().to_vec());
        }
        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::connection_failed(format!("http push: {e}")))?;
        if !response.status().is_success() {
            return Err(GatewayError::connection_failed(format!(
                "http push returned status {}",
                response.status()
            )));
        }
        Ok(ack.map(|request| Acknowledgement::success(request.label, request.entity_id)))
    }
}
