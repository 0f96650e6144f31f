//! Per-connection context and the server configuration it shares.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::{ArcSwap, ArcSwapOption};
use hyper::http::uri::Scheme;

use crate::config::ConnectionOptions;
use crate::net::certificate::CertificateService;
use crate::net::connection::ConnectionId;
use crate::net::tls::TlsConfig;
use crate::pipeline::negotiation::{NegotiationError, NegotiationState};
use crate::pipeline::Pipeline;

/// Callback invoked once the application protocol of a connection is known.
///
/// Owned by the server and shared by every connection. It receives the
/// connection's pipeline to rewrite, the connection context and the
/// negotiated ALPN identifier.
pub type PipelineConfigurator = Arc<
    dyn Fn(&mut Pipeline, &ConnectionContext, &str) -> Result<NegotiationState, NegotiationError>
        + Send
        + Sync,
>;

/// Server-wide settings seen by connections.
///
/// The bound address, and the interface addresses behind an unspecified
/// bind, are written once by the server at start; connections only read them.
#[derive(Debug)]
pub struct ServerConfig {
    address: ArcSwapOption<SocketAddr>,
    interface_addresses: ArcSwap<Vec<IpAddr>>,
    idle_timeout: Duration,
    handshake_timeout: Duration,
    max_request_head_bytes: Option<usize>,
}

impl ServerConfig {
    pub fn new(options: &ConnectionOptions) -> Self {
        Self {
            address: ArcSwapOption::empty(),
            interface_addresses: ArcSwap::from_pointee(Vec::new()),
            idle_timeout: options.idle_timeout(),
            handshake_timeout: options.handshake_timeout(),
            max_request_head_bytes: options.max_request_head_bytes,
        }
    }

    /// Address the server is bound to, once started.
    pub fn address(&self) -> Option<SocketAddr> {
        self.address.load_full().map(|addr| *addr)
    }

    pub(crate) fn set_address(&self, address: SocketAddr) {
        self.address.store(Some(Arc::new(address)));
    }

    /// Local interface addresses the listener is reachable on when bound to
    /// an unspecified address. Empty otherwise.
    pub fn interface_addresses(&self) -> Arc<Vec<IpAddr>> {
        self.interface_addresses.load_full()
    }

    pub fn is_interface_address(&self, ip: IpAddr) -> bool {
        self.interface_addresses.load().contains(&ip)
    }

    pub(crate) fn set_interface_addresses(&self, addresses: Vec<IpAddr>) {
        self.interface_addresses.store(Arc::new(addresses));
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    /// Read buffer limit for HTTP/1.1 request heads; `None` keeps hyper's.
    pub fn max_request_head_bytes(&self) -> Option<usize> {
        self.max_request_head_bytes
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(&ConnectionOptions::default())
    }
}

/// Attributes attached to a connection at accept time.
///
/// Lives exactly as long as the connection. Everything but `tls_upgraded` is
/// shared, read-only server state.
pub struct ConnectionContext {
    id: ConnectionId,
    peer_addr: SocketAddr,
    certificate_service: Arc<dyn CertificateService>,
    server_config: Arc<ServerConfig>,
    tls_config: Arc<TlsConfig>,
    pipeline_configurator: PipelineConfigurator,
    tls_upgraded: bool,
}

impl ConnectionContext {
    pub fn new(
        id: ConnectionId,
        peer_addr: SocketAddr,
        certificate_service: Arc<dyn CertificateService>,
        server_config: Arc<ServerConfig>,
        tls_config: Arc<TlsConfig>,
        pipeline_configurator: PipelineConfigurator,
    ) -> Self {
        Self {
            id,
            peer_addr,
            certificate_service,
            server_config,
            tls_config,
            pipeline_configurator,
            tls_upgraded: false,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn certificate_service(&self) -> &Arc<dyn CertificateService> {
        &self.certificate_service
    }

    pub fn server_config(&self) -> &Arc<ServerConfig> {
        &self.server_config
    }

    pub fn tls_config(&self) -> &Arc<TlsConfig> {
        &self.tls_config
    }

    pub fn pipeline_configurator(&self) -> &PipelineConfigurator {
        &self.pipeline_configurator
    }

    /// Whether a TLS session has been started on top of this connection.
    pub fn tls_upgraded(&self) -> bool {
        self.tls_upgraded
    }

    pub fn mark_tls_upgraded(&mut self) {
        self.tls_upgraded = true;
    }

    /// Scheme stamped on requests decoded from this connection.
    pub fn scheme(&self) -> Scheme {
        if self.tls_upgraded {
            Scheme::HTTPS
        } else {
            Scheme::HTTP
        }
    }
}

impl std::fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("server_config", &self.server_config)
            .field("tls_config", &self.tls_config)
            .field("tls_upgraded", &self.tls_upgraded)
            .finish_non_exhaustive()
    }
}
