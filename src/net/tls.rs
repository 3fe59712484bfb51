//! Client TLS configuration for broker connections.
//!
//! Each connection either validates the broker certificate against its
//! configured PEM trust bundle, or, with `validate_certificates = false`,
//! skips verification entirely so endpoints with self-signed certificates
//! can still be reached and tested.

use crate::protocol::error::GatewayError;
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, Error as TlsError, RootCertStore, ServerName};
use std::io::BufReader;
use std::sync::Arc;
use std::time::SystemTime;

/// Parse a PEM bundle into DER certificates.
pub fn parse_cert_bundle(pem: &str) -> Result<Vec<Vec<u8>>, GatewayError> {
    let mut reader = BufReader::new(pem.as_bytes());
    rustls_pemfile::certs(&mut reader)
        .map_err(|e| GatewayError::configuration_invalid(format!("invalid trusted certificate: {e}")))
}

/// Build the rustls client config for a connection.
///
/// `trusted_certificates` is the connection's PEM CA bundle; without one,
/// certificate validation has an empty trust store and every handshake
/// against an unknown issuer fails, which is the fail-closed default.
pub fn client_config(
    validate_certificates: bool,
    trusted_certificates: Option<&str>,
) -> Result<ClientConfig, GatewayError> {
    let mut roots = RootCertStore::empty();
    if let Some(pem) = trusted_certificates {
        let der_certs: Vec<Certificate> =
            parse_cert_bundle(pem)?.into_iter().map(Certificate).collect();
        let (added, _) = roots.add_parsable_certificates(&der_certs);
        if added == 0 {
            return Err(GatewayError::configuration_invalid(
                "trusted certificate bundle contains no usable certificates",
            ));
        }
    }
    let mut config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    if !validate_certificates {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(AcceptAnyServerCert));
    }
    Ok(config)
}

/// Verifier accepting any server certificate. Only reachable when the
/// connection explicitly disabled certificate validation.
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, TlsError> {
        Ok(ServerCertVerified::assertion())
    }
}
