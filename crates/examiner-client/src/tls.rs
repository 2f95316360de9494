//! TLS client configuration for the secure channel.
//!
//! The device authenticates itself with the certificate the desktop signed.
//! The desktop's own certificate is self-signed and not pinned, so server
//! verification is skipped.

use crate::certificate::DeviceIdentity;
use examiner_core::{ExaminerError, ExaminerResult};
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use std::sync::Arc;

/// Build a rustls client config presenting `identity` as the client certificate.
pub fn client_config(identity: &DeviceIdentity) -> ExaminerResult<ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ExaminerError::Transport(format!("TLS config error: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_client_auth_cert(identity.certificate_chain()?, identity.private_key()?)
        .map_err(|e| ExaminerError::Certificate(format!("client certificate rejected: {e}")))
}

#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::testing::self_signed_identity;

    #[test]
    fn builds_config_with_client_certificate() {
        let config = client_config(&self_signed_identity()).unwrap();
        assert!(config.client_auth_cert_resolver.has_certs());
    }

    #[test]
    fn rejects_identity_without_certificate() {
        let identity = DeviceIdentity::new("", "");
        assert!(matches!(
            client_config(&identity),
            Err(ExaminerError::Certificate(_))
        ));
    }
}
