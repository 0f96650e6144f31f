//! TLS configuration and the TLS upgrade stage.
//!
//! # Responsibilities
//! - Hold the immutable TLS configuration (versions, ciphers, ALPN order)
//! - Build the rustls server configuration backed by the certificate service
//! - Sniff the first bytes of a connection to tell TLS from plaintext
//! - Run the handshake and report the negotiated application protocol

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

use crate::net::certificate::{CertificateResolver, CertificateService};

/// ALPN identifier of HTTP/1.1.
pub const APPLICATION_PROTOCOL_HTTP_1_1: &str = "http/1.1";
/// ALPN identifier of HTTP/2 over TLS.
pub const APPLICATION_PROTOCOL_HTTP_2: &str = "h2";

pub const TLS_V1_2: &str = "TLSv1.2";
pub const TLS_V1_3: &str = "TLSv1.3";

/// Content type of a TLS handshake record.
const TLS_HANDSHAKE_RECORD: u8 = 0x16;

/// Bytes read when sniffing a new connection.
const SNIFF_LEN: usize = 5;

/// Error type for TLS setup and handshakes.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("unknown TLS protocol {0:?}")]
    UnknownProtocol(String),

    #[error("no TLS protocol enabled")]
    NoProtocols,

    #[error("none of the configured cipher suites is supported")]
    NoCipherSuites,

    #[error("invalid TLS configuration: {0}")]
    Config(#[from] rustls::Error),

    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] io::Error),

    #[error("TLS handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
}

/// TLS protocol, cipher and ALPN preferences.
///
/// Built once at server construction and shared read-only by all connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    protocols: Vec<String>,
    cipher_suites: Vec<String>,
    alpn_enabled: bool,
    application_protocols: Vec<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            protocols: vec![TLS_V1_2.to_string(), TLS_V1_3.to_string()],
            cipher_suites: Vec::new(),
            alpn_enabled: true,
            application_protocols: vec![
                APPLICATION_PROTOCOL_HTTP_2.to_string(),
                APPLICATION_PROTOCOL_HTTP_1_1.to_string(),
            ],
        }
    }
}

impl TlsConfig {
    pub fn new(
        protocols: Vec<String>,
        cipher_suites: Vec<String>,
        alpn_enabled: bool,
        application_protocols: Vec<String>,
    ) -> Self {
        Self {
            protocols,
            cipher_suites,
            alpn_enabled,
            application_protocols,
        }
    }

    pub fn from_settings(settings: &crate::config::TlsSettings) -> Self {
        Self::new(
            settings.protocols.clone(),
            settings.cipher_suites.clone(),
            settings.alpn_enabled,
            settings.application_protocols.clone(),
        )
    }

    pub fn protocols(&self) -> &[String] {
        &self.protocols
    }

    pub fn is_alpn_enabled(&self) -> bool {
        self.alpn_enabled
    }

    pub fn application_protocols(&self) -> &[String] {
        &self.application_protocols
    }

    /// ALPN identifiers offered in the handshake, most preferred first.
    pub fn alpn_protocols(&self) -> Vec<Vec<u8>> {
        if !self.alpn_enabled {
            return Vec::new();
        }
        self.application_protocols
            .iter()
            .map(|p| p.as_bytes().to_vec())
            .collect()
    }

    fn protocol_versions(
        &self,
    ) -> Result<Vec<&'static rustls::SupportedProtocolVersion>, TlsError> {
        let versions = self
            .protocols
            .iter()
            .map(|p| match p.as_str() {
                TLS_V1_2 => Ok(&rustls::version::TLS12),
                TLS_V1_3 => Ok(&rustls::version::TLS13),
                other => Err(TlsError::UnknownProtocol(other.to_string())),
            })
            .collect::<Result<Vec<_>, _>>()?;
        if versions.is_empty() {
            return Err(TlsError::NoProtocols);
        }
        Ok(versions)
    }

    /// Build the rustls server configuration.
    ///
    /// Certificates are resolved per handshake through `certificates`.
    pub fn server_config(
        &self,
        certificates: Arc<dyn CertificateService>,
    ) -> Result<rustls::ServerConfig, TlsError> {
        let mut provider = rustls::crypto::aws_lc_rs::default_provider();
        if !self.cipher_suites.is_empty() {
            provider.cipher_suites.retain(|suite| {
                let name = format!("{:?}", suite.suite());
                self.cipher_suites
                    .iter()
                    .any(|allowed| allowed.eq_ignore_ascii_case(&name))
            });
            if provider.cipher_suites.is_empty() {
                return Err(TlsError::NoCipherSuites);
            }
        }

        let versions = self.protocol_versions()?;
        let mut config = rustls::ServerConfig::builder_with_provider(Arc::new(provider))
            .with_protocol_versions(&versions)?
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(CertificateResolver::new(certificates)));
        config.alpn_protocols = self.alpn_protocols();
        Ok(config)
    }
}

/// Whether the sniffed prefix starts a TLS handshake record.
pub fn is_tls_handshake(prefix: &[u8]) -> bool {
    prefix.first() == Some(&TLS_HANDSHAKE_RECORD)
}

/// Read the first bytes of a connection. `None` on EOF before any byte.
pub async fn sniff<S>(io: &mut S) -> io::Result<Option<Bytes>>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; SNIFF_LEN];
    let n = io.read(&mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    Ok(Some(Bytes::copy_from_slice(&buf[..n])))
}

/// Application protocol agreed through ALPN, `http/1.1` when none was.
pub fn negotiated_protocol(connection: &rustls::ServerConnection) -> String {
    connection
        .alpn_protocol()
        .map(|p| String::from_utf8_lossy(p).into_owned())
        .unwrap_or_else(|| APPLICATION_PROTOCOL_HTTP_1_1.to_string())
}

/// The TLS upgrade stage: server-side handshake on a sniffed TLS connection.
#[derive(Clone)]
pub struct TlsUpgrade {
    acceptor: TlsAcceptor,
    handshake_timeout: Duration,
}

impl TlsUpgrade {
    pub fn new(config: Arc<rustls::ServerConfig>, handshake_timeout: Duration) -> Self {
        Self {
            acceptor: TlsAcceptor::from(config),
            handshake_timeout,
        }
    }

    /// Build from the shared TLS configuration and certificate service.
    pub fn from_config(
        tls_config: &TlsConfig,
        certificates: Arc<dyn CertificateService>,
        handshake_timeout: Duration,
    ) -> Result<Self, TlsError> {
        let config = tls_config.server_config(certificates)?;
        Ok(Self::new(Arc::new(config), handshake_timeout))
    }

    /// Perform the handshake, bounded by the handshake timeout.
    pub async fn handshake<S>(&self, io: S) -> Result<TlsStream<S>, TlsError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match tokio::time::timeout(self.handshake_timeout, self.acceptor.accept(io)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(TlsError::Handshake(e)),
            Err(_) => Err(TlsError::HandshakeTimeout(self.handshake_timeout)),
        }
    }
}

impl std::fmt::Debug for TlsUpgrade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsUpgrade")
            .field("handshake_timeout", &self.handshake_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::certificate::UnavailableCertificateService;

    #[test]
    fn detects_handshake_record() {
        assert!(is_tls_handshake(&[0x16, 0x03, 0x01, 0x02, 0x00]));
        assert!(is_tls_handshake(&[0x16]));
        assert!(!is_tls_handshake(b"GET /"));
        assert!(!is_tls_handshake(b"CONNE"));
        assert!(!is_tls_handshake(&[]));
    }

    #[test]
    fn alpn_follows_preference_order() {
        let config = TlsConfig::default();
        assert_eq!(
            config.alpn_protocols(),
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );
    }

    #[test]
    fn alpn_disabled_offers_nothing() {
        let config = TlsConfig::new(
            vec![TLS_V1_3.into()],
            Vec::new(),
            false,
            vec![APPLICATION_PROTOCOL_HTTP_2.into()],
        );
        assert!(config.alpn_protocols().is_empty());
        let server = config
            .server_config(Arc::new(UnavailableCertificateService))
            .unwrap();
        assert!(server.alpn_protocols.is_empty());
    }

    #[test]
    fn server_config_carries_alpn() {
        let server = TlsConfig::default()
            .server_config(Arc::new(UnavailableCertificateService))
            .unwrap();
        assert_eq!(
            server.alpn_protocols,
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );
    }

    #[test]
    fn unknown_protocol_rejected() {
        let config = TlsConfig::new(vec!["SSLv3".into()], Vec::new(), true, Vec::new());
        let err = config
            .server_config(Arc::new(UnavailableCertificateService))
            .unwrap_err();
        assert!(matches!(err, TlsError::UnknownProtocol(p) if p == "SSLv3"));
    }

    #[test]
    fn unknown_cipher_suites_rejected() {
        let config = TlsConfig::new(
            vec![TLS_V1_3.into()],
            vec!["TLS_NULL_WITH_NULL_NULL_NOT_REAL".into()],
            true,
            Vec::new(),
        );
        let err = config
            .server_config(Arc::new(UnavailableCertificateService))
            .unwrap_err();
        assert!(matches!(err, TlsError::NoCipherSuites));
    }

    #[test]
    fn cipher_suites_filter_by_name() {
        let config = TlsConfig::new(
            vec![TLS_V1_3.into()],
            vec!["tls13_aes_128_gcm_sha256".into()],
            true,
            Vec::new(),
        );
        assert!(config
            .server_config(Arc::new(UnavailableCertificateService))
            .is_ok());
    }

    #[tokio::test]
    async fn sniff_reports_eof() {
        let mut empty: &[u8] = b"";
        assert!(sniff(&mut empty).await.unwrap().is_none());

        let mut request: &[u8] = b"GET / HTTP/1.1\r\n";
        let prefix = sniff(&mut request).await.unwrap().unwrap();
        assert_eq!(prefix, Bytes::from_static(b"GET /"));
    }
}
