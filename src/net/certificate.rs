//! Server certificate service.
//!
//! The TLS layer asks the certificate service for a certificate during every
//! handshake. How certificates are minted or signed is not this crate's
//! business; it ships a static service (one PEM/DER pair for every server
//! name) and an unavailable one that refuses every handshake.

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use thiserror::Error;

/// Error returned when no certificate can be provided.
#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("no certificate found in {0:?}")]
    NoCertificates(PathBuf),

    #[error("no private key found in {0:?}")]
    NoPrivateKey(PathBuf),

    #[error("unsupported private key: {0}")]
    UnsupportedKey(#[from] rustls::Error),

    #[error("certificate unavailable: {0}")]
    Unavailable(String),
}

/// Provides server certificates to the TLS layer.
///
/// Shared read-only by every connection; implementations must tolerate
/// concurrent calls.
pub trait CertificateService: Send + Sync {
    /// Certificate to present for `server_name` (the SNI value, when sent).
    fn server_certificate(
        &self,
        server_name: Option<&str>,
    ) -> Result<Arc<CertifiedKey>, CertificateError>;
}

/// Serves a single certificate for every server name.
pub struct StaticCertificateService {
    key: Arc<CertifiedKey>,
}

impl StaticCertificateService {
    /// Build from an already decoded chain and private key.
    pub fn from_der(
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Self, CertificateError> {
        let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&key)?;
        Ok(Self {
            key: Arc::new(CertifiedKey::new(chain, signing_key)),
        })
    }

    /// Load a PEM certificate chain and private key from disk.
    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> Result<Self, CertificateError> {
        let chain = rustls_pemfile::certs(&mut open(cert_path)?)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| CertificateError::Io {
                path: cert_path.to_path_buf(),
                source,
            })?;
        if chain.is_empty() {
            return Err(CertificateError::NoCertificates(cert_path.to_path_buf()));
        }

        let key = rustls_pemfile::private_key(&mut open(key_path)?)
            .map_err(|source| CertificateError::Io {
                path: key_path.to_path_buf(),
                source,
            })?
            .ok_or_else(|| CertificateError::NoPrivateKey(key_path.to_path_buf()))?;

        tracing::info!(
            cert_path = %cert_path.display(),
            chain_len = chain.len(),
            "Loaded server certificate"
        );

        Self::from_der(chain, key)
    }
}

fn open(path: &Path) -> Result<BufReader<File>, CertificateError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| CertificateError::Io {
            path: path.to_path_buf(),
            source,
        })
}

impl CertificateService for StaticCertificateService {
    fn server_certificate(
        &self,
        _server_name: Option<&str>,
    ) -> Result<Arc<CertifiedKey>, CertificateError> {
        Ok(Arc::clone(&self.key))
    }
}

/// Service used when no certificate is configured: every TLS handshake fails.
#[derive(Debug, Default)]
pub struct UnavailableCertificateService;

impl CertificateService for UnavailableCertificateService {
    fn server_certificate(
        &self,
        _server_name: Option<&str>,
    ) -> Result<Arc<CertifiedKey>, CertificateError> {
        Err(CertificateError::Unavailable(
            "no server certificate configured".to_string(),
        ))
    }
}

/// Adapts a `CertificateService` to rustls' per-handshake resolution.
pub(crate) struct CertificateResolver {
    service: Arc<dyn CertificateService>,
}

impl CertificateResolver {
    pub(crate) fn new(service: Arc<dyn CertificateService>) -> Self {
        Self { service }
    }
}

impl fmt::Debug for CertificateResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateResolver").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for CertificateResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let server_name = client_hello.server_name();
        match self.service.server_certificate(server_name) {
            Ok(key) => Some(key),
            Err(e) => {
                tracing::warn!(
                    server_name = server_name.unwrap_or("<none>"),
                    error = %e,
                    "No certificate for TLS handshake"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::pki_types::PrivatePkcs8KeyDer;

    #[test]
    fn static_service_serves_any_name() {
        let generated = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let chain = vec![generated.cert.der().clone()];
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            generated.key_pair.serialize_der(),
        ));

        let service = StaticCertificateService::from_der(chain, key).unwrap();
        let a = service.server_certificate(Some("example.com")).unwrap();
        let b = service.server_certificate(None).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.cert.len(), 1);
    }

    #[test]
    fn unavailable_service_refuses() {
        let err = UnavailableCertificateService
            .server_certificate(Some("example.com"))
            .unwrap_err();
        assert!(matches!(err, CertificateError::Unavailable(_)));
    }

    #[test]
    fn missing_pem_file_is_reported_with_path() {
        let err = StaticCertificateService::from_pem_files(
            Path::new("/nonexistent/cert.pem"),
            Path::new("/nonexistent/key.pem"),
        )
        .err()
        .unwrap();
        assert!(err.to_string().contains("/nonexistent/cert.pem"));
    }
}
