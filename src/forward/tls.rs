//! TLS plumbing for the HTTPS listener and HTTPS upstream dials.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::common::Error;

/// Skip-verification verifier for upstream dials: forwarded targets are
/// internal and commonly carry self-signed certificates.
#[derive(Debug)]
pub struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

/// Client config that trusts any upstream certificate.
pub fn insecure_client_config() -> Result<rustls::ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| anyhow::anyhow!("TLS config error: {}", e))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier))
        .with_no_client_auth();
    Ok(config)
}

/// Build a ServerConfig from PEM cert/key files. Failure here is fatal for
/// the worker: a bad certificate does not get better by restarting.
pub fn load_server_config(cert_path: &str, key_path: &str) -> Result<rustls::ServerConfig> {
    let cert_data = std::fs::read(cert_path)
        .map_err(|e| Error::Fatal(format!("read cert file {}: {}", cert_path, e)))?;
    let certs = certs_from_pem(&cert_data)?;
    if certs.is_empty() {
        return Err(Error::Fatal(format!("no certificates in {}", cert_path)).into());
    }

    let key_data = std::fs::read(key_path)
        .map_err(|e| Error::Fatal(format!("read key file {}: {}", key_path, e)))?;
    let key = private_key_from_pem(&key_data)?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Fatal(format!("TLS version config: {}", e)))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Fatal(format!("TLS cert/key config: {}", e)))?;
    Ok(config)
}

fn certs_from_pem(data: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = std::io::BufReader::new(data);
    Ok(rustls_pemfile::certs(&mut reader)
        .filter_map(|r| r.ok())
        .collect())
}

fn private_key_from_pem(data: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let mut reader = std::io::BufReader::new(data);
    if let Some(key) = rustls_pemfile::pkcs8_private_keys(&mut reader)
        .filter_map(|r| r.ok())
        .next()
    {
        return Ok(PrivateKeyDer::Pkcs8(key));
    }

    let mut reader = std::io::BufReader::new(data);
    if let Some(key) = rustls_pemfile::rsa_private_keys(&mut reader)
        .filter_map(|r| r.ok())
        .next()
    {
        return Ok(PrivateKeyDer::Pkcs1(key));
    }

    let mut reader = std::io::BufReader::new(data);
    if let Some(key) = rustls_pemfile::ec_private_keys(&mut reader)
        .filter_map(|r| r.ok())
        .next()
    {
        return Ok(PrivateKeyDer::Sec1(key));
    }

    Err(Error::Fatal("no private key found in PEM data".into()).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_cert_file_is_fatal() {
        let err = load_server_config("/nonexistent/cert.pem", "/nonexistent/key.pem").unwrap_err();
        assert!(crate::common::error::is_fatal(&err));
    }

    #[test]
    fn empty_pem_has_no_key() {
        assert!(private_key_from_pem(b"").is_err());
        assert!(certs_from_pem(b"").unwrap().is_empty());
    }

    #[test]
    fn insecure_client_config_builds() {
        assert!(insecure_client_config().is_ok());
    }
}
