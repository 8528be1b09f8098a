//! TLS layer: rustls configuration and handshake.

use std::sync::Arc;

use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use crate::error::{Error, Result};
use crate::settings::Settings;

/// Perform a TLS handshake over an established TCP connection.
///
/// SNI is always the hostname the caller originally asked for. The peer is
/// verified against the configured CA bundle, the built-in webpki roots, or
/// not at all when `tls_verify_peer` is off.
pub async fn handshake(
    settings: &Settings,
    hostname: &str,
    tcp: TcpStream,
) -> Result<TlsStream<TcpStream>> {
    let config = client_config(settings)?;
    let server_name =
        ServerName::try_from(hostname.to_owned()).map_err(|_| Error::InvalidArgument)?;
    let connector = TlsConnector::from(Arc::new(config));
    match timeout(settings.timeout, connector.connect(server_name, tcp)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(err)) => Err(map_handshake_error(&err)),
        Err(_) => Err(Error::TimedOut),
    }
}

fn map_handshake_error(err: &std::io::Error) -> Error {
    // tokio-rustls reports TLS-level failures as InvalidData; anything else
    // came from the socket underneath the session.
    if err.kind() == std::io::ErrorKind::InvalidData {
        Error::SslGeneric
    } else {
        Error::SslSyscall
    }
}

fn client_config(settings: &Settings) -> Result<ClientConfig> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|_| Error::SslGeneric)?;

    let config = if !settings.tls_verify_peer {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification(provider)))
            .with_no_client_auth()
    } else if settings.ca_bundle_path.is_empty() {
        let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    } else {
        builder
            .with_root_certificates(load_ca_bundle(&settings.ca_bundle_path)?)
            .with_no_client_auth()
    };
    Ok(config)
}

fn load_ca_bundle(path: &str) -> Result<RootCertStore> {
    let pem = std::fs::read(path).map_err(|_| Error::InvalidArgument)?;
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
        let cert = cert.map_err(|_| Error::SslGeneric)?;
        roots.add(cert).map_err(|_| Error::SslGeneric)?;
    }
    if roots.is_empty() {
        return Err(Error::SslGeneric);
    }
    Ok(roots)
}

/// Accepts any certificate chain; selected only when `tls_verify_peer` is
/// explicitly disabled.
#[derive(Debug)]
struct NoVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::ProtocolFlags;

    #[test]
    fn default_config_uses_webpki_roots() {
        let mut settings = Settings::default();
        settings.protocol_flags = ProtocolFlags::TLS;
        assert!(client_config(&settings).is_ok());
    }

    #[test]
    fn verification_can_be_disabled() {
        let mut settings = Settings::default();
        settings.protocol_flags = ProtocolFlags::TLS;
        settings.tls_verify_peer = false;
        assert!(client_config(&settings).is_ok());
    }

    #[test]
    fn unreadable_bundle_is_invalid_argument() {
        let mut settings = Settings::default();
        settings.protocol_flags = ProtocolFlags::TLS;
        settings.ca_bundle_path = "/nonexistent/ca-bundle.pem".to_owned();
        assert_eq!(client_config(&settings).unwrap_err(), Error::InvalidArgument);
    }
}
