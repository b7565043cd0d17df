//! Mutual TLS configuration for hardware listeners.
//!
//! Every listener presents its own certificate and requires the peer to
//! present one that chains to the configured CA bundle.
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};

use super::TransportError;

/// Paths of the certificate/key/CA triple for one listener.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub ca: PathBuf,
}

/// Server-side TLS settings requiring client certificates.
#[derive(Clone)]
pub struct TlsConfig {
    server_config: Arc<ServerConfig>,
}

impl TlsConfig {
    pub fn from_files(files: &TlsFiles) -> Result<Self, TransportError> {
        let cert = read_pem(&files.cert)?;
        let key = read_pem(&files.key)?;
        let ca = read_pem(&files.ca)?;
        Self::from_pem(&cert, &key, &ca)
    }

    /// Build from PEM-encoded certificate chain, private key and CA bundle.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8], ca_pem: &[u8]) -> Result<Self, TransportError> {
        let ca_certs = parse_certificates(ca_pem)?;
        if ca_certs.is_empty() {
            return Err(TransportError::Certificate("no CA certificates found".into()));
        }
        let mut roots = RootCertStore::empty();
        for cert in ca_certs {
            roots.add(cert).map_err(|e| {
                TransportError::Certificate(format!("failed to add CA certificate: {e}"))
            })?;
        }

        let chain = parse_certificates(cert_pem)?;
        if chain.is_empty() {
            return Err(TransportError::Certificate("no server certificate found".into()));
        }
        let key = PrivateKeyDer::from_pem_slice(key_pem)
            .map_err(|e| TransportError::PrivateKey(format!("failed to parse private key: {e}")))?;

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
            .build()
            .map_err(|e| TransportError::TlsConfig(format!("client verifier error: {e}")))?;

        let server_config = ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
            .map_err(|e| TransportError::TlsConfig(format!("protocol versions: {e}")))?
            .with_client_cert_verifier(verifier)
            .with_single_cert(chain, key)
            .map_err(|e| TransportError::TlsConfig(format!("server config error: {e}")))?;

        Ok(Self {
            server_config: Arc::new(server_config),
        })
    }

    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.server_config)
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>, TransportError> {
    fs::read(path).map_err(|e| TransportError::Certificate(format!("{}: {e}", path.display())))
}

fn parse_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    CertificateDer::pem_slice_iter(pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Certificate(format!("failed to parse certificates: {e}")))
}
