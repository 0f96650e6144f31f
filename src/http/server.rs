//! HTTP server setup and the accept loop.
//!
//! # Responsibilities
//! - Hold the shared, read-only server state (TLS configuration, certificate
//!   service, pipeline configurator, main handler)
//! - Refuse to start without a main handler, before any port is bound
//! - Bind the listener and record the bound address
//! - Attach a context and the initial stage chain to every accepted
//!   connection, then hand it to its own driver task

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};

use crate::config::ProxyConfig;
use crate::http::handler::{HandlerExecutor, MainHandler, MainHandlerStage};
use crate::lifecycle::shutdown::ShutdownSignal;
use crate::net::certificate::CertificateService;
use crate::net::connection::ConnectionTracker;
use crate::net::context::{ConnectionContext, PipelineConfigurator, ServerConfig};
use crate::net::listener::{self, Listener, ListenerError};
use crate::net::tls::{TlsConfig, TlsError, TlsUpgrade};
use crate::observability::metrics;
use crate::pipeline::driver::ConnectionDriver;
use crate::pipeline::negotiation::{configure_protocol, NegotiationError, NegotiationState};
use crate::pipeline::Pipeline;

/// Error type for starting and running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("No main server handler set.")]
    NoMainHandler,

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("TLS setup failed: {0}")]
    Tls(#[from] TlsError),

    #[error("cannot read the bound address: {0}")]
    Io(#[from] io::Error),

    #[error("accept loop failed: {0}")]
    Aborted(#[from] JoinError),
}

/// The intercepting proxy server.
pub struct HttpServer {
    config: ProxyConfig,
    server_config: Arc<ServerConfig>,
    tls_config: Arc<TlsConfig>,
    certificate_service: Arc<dyn CertificateService>,
    pipeline_configurator: PipelineConfigurator,
    main_handler: Option<Arc<dyn MainHandler>>,
    executor: Option<HandlerExecutor>,
}

impl HttpServer {
    /// Create a server for `config`, issuing certificates from `certificates`.
    pub fn new(config: ProxyConfig, certificates: Arc<dyn CertificateService>) -> Self {
        let server_config = Arc::new(ServerConfig::new(&config.connection));
        let tls_config = Arc::new(TlsConfig::from_settings(&config.tls));
        Self {
            config,
            server_config,
            tls_config,
            certificate_service: certificates,
            pipeline_configurator: Arc::new(configure_protocol),
            main_handler: None,
            executor: None,
        }
    }

    pub fn with_main_handler<H: MainHandler>(mut self, handler: H) -> Self {
        self.main_handler = Some(Arc::new(handler));
        self
    }

    pub fn set_main_handler(&mut self, handler: Arc<dyn MainHandler>) {
        self.main_handler = Some(handler);
    }

    /// Run the main handler on `executor` instead of the server's runtime.
    pub fn with_handler_executor(mut self, executor: HandlerExecutor) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Replace the negotiation callback.
    pub fn with_pipeline_configurator<F>(mut self, configurator: F) -> Self
    where
        F: Fn(&mut Pipeline, &ConnectionContext, &str) -> Result<NegotiationState, NegotiationError>
            + Send
            + Sync
            + 'static,
    {
        self.pipeline_configurator = Arc::new(configurator);
        self
    }

    /// Override the TLS preferences taken from the config file.
    pub fn with_tls_config(mut self, tls_config: TlsConfig) -> Self {
        self.tls_config = Arc::new(tls_config);
        self
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn server_config(&self) -> &Arc<ServerConfig> {
        &self.server_config
    }

    /// Bind and start accepting connections until `shutdown` fires.
    pub async fn start(self, shutdown: ShutdownSignal) -> Result<ServerHandle, ServerError> {
        let handler = self.main_handler.clone().ok_or(ServerError::NoMainHandler)?;
        let executor = self.executor.clone().unwrap_or_else(HandlerExecutor::current);
        let main_handler = MainHandlerStage::new(handler, executor);
        let tls_upgrade = TlsUpgrade::from_config(
            &self.tls_config,
            Arc::clone(&self.certificate_service),
            self.server_config.handshake_timeout(),
        )?;

        let listener = Listener::bind(&self.config.listener).await?;
        let local_addr = listener.local_addr()?;
        self.server_config.set_address(local_addr);
        match listener::interface_addresses(local_addr.ip()) {
            Ok(addresses) => self.server_config.set_interface_addresses(addresses),
            Err(e) => tracing::warn!(
                error = %e,
                "Failed to list interface addresses, recursive requests are only detected on loopback"
            ),
        }

        tracing::info!(
            address = %local_addr,
            idle_timeout = ?self.server_config.idle_timeout(),
            alpn = ?self.tls_config.application_protocols(),
            "Proxy server started"
        );

        let tracker = ConnectionTracker::new();
        let accept = AcceptLoop {
            server: self,
            listener,
            tracker: tracker.clone(),
            tls_upgrade,
            main_handler,
        };
        let task = tokio::spawn(accept.run(shutdown));

        Ok(ServerHandle {
            local_addr,
            tracker,
            task,
        })
    }
}

impl std::fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServer")
            .field("config", &self.config)
            .field("tls_config", &self.tls_config)
            .field("has_main_handler", &self.main_handler.is_some())
            .finish_non_exhaustive()
    }
}

struct AcceptLoop {
    server: HttpServer,
    listener: Listener,
    tracker: ConnectionTracker,
    tls_upgrade: TlsUpgrade,
    main_handler: MainHandlerStage,
}

impl AcceptLoop {
    async fn run(self, mut shutdown: ShutdownSignal) {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.recv() => break,
                accepted = self.listener.accept() => accepted,
            };
            let (stream, peer_addr, permit) = match accepted {
                Ok(accepted) => accepted,
                Err(ListenerError::Accept(e)) => {
                    tracing::warn!(error = %e, "Failed to accept connection");
                    continue;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Listener failed, stopping");
                    break;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(peer_addr = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
            }

            let guard = self.tracker.track();
            metrics::record_connection_accepted();
            metrics::record_active_connections(self.tracker.active_count());

            let ctx = ConnectionContext::new(
                guard.id(),
                peer_addr,
                Arc::clone(&self.server.certificate_service),
                Arc::clone(&self.server.server_config),
                Arc::clone(&self.server.tls_config),
                Arc::clone(&self.server.pipeline_configurator),
            );
            let driver = match ConnectionDriver::init_channel(
                ctx,
                self.tls_upgrade.clone(),
                self.main_handler.clone(),
            ) {
                Ok(driver) => driver,
                Err(e) => {
                    tracing::error!(connection_id = %guard.id(), error = %e, "Failed to build stage chain");
                    continue;
                }
            };

            let tracker = self.tracker.clone();
            tokio::spawn(async move {
                driver.run(stream).await;
                drop(guard);
                drop(permit);
                metrics::record_active_connections(tracker.active_count());
            });
        }

        tracing::info!(
            active_connections = self.tracker.active_count(),
            "Stopped accepting connections"
        );
    }
}

/// Handle to a started server.
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    tracker: ConnectionTracker,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// The address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn active_connections(&self) -> u64 {
        self.tracker.active_count()
    }

    /// Wait for the accept loop to stop.
    pub async fn wait(self) -> Result<(), ServerError> {
        self.task.await?;
        Ok(())
    }
}
