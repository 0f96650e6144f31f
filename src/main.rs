//! Intercepting proxy binary.
//!
//! ```text
//!  client ──TCP──▶ listener ──▶ per-connection driver
//!                                  │
//!                                  ├─ sniff: TLS? ──yes──▶ handshake (certificate service)
//!                                  │                         └─ ALPN → negotiation (h2 / http/1.1)
//!                                  ├─ HTTP/1.1 or HTTP/2 codec
//!                                  ├─ CONNECT → 200, tunnel re-enters the TLS stage
//!                                  ├─ recursive guard → 508
//!                                  └─ main handler (forwarder) ──▶ origin
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;

use intercepting_proxy::config::validation::validate_config;
use intercepting_proxy::config::{load_config_or_default, ConfigError};
use intercepting_proxy::http::forward::ForwardHandler;
use intercepting_proxy::http::HandlerPool;
use intercepting_proxy::lifecycle::{wait_for_signal, Shutdown};
use intercepting_proxy::net::certificate::{
    CertificateService, StaticCertificateService, UnavailableCertificateService,
};
use intercepting_proxy::observability::{logging, metrics};
use intercepting_proxy::HttpServer;

#[derive(Parser)]
#[command(name = "intercepting-proxy")]
#[command(about = "Intercepting HTTP/HTTPS proxy", long_about = None)]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides `listener.bind_address`.
    #[arg(short, long)]
    bind: Option<String>,

    /// Certificate chain (PEM) presented to intercepted clients.
    #[arg(long, requires = "key")]
    cert: Option<String>,

    /// Private key (PEM) of the certificate.
    #[arg(long, requires = "cert")]
    key: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = load_config_or_default(cli.config.as_deref())?;
    if let Some(bind) = cli.bind {
        config.listener.bind_address = bind;
    }
    if cli.cert.is_some() {
        config.tls.cert_path = cli.cert;
        config.tls.key_path = cli.key;
    }
    validate_config(&config).map_err(ConfigError::Validation)?;

    logging::init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "intercepting-proxy starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr)?,
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let certificates: Arc<dyn CertificateService> =
        match (&config.tls.cert_path, &config.tls.key_path) {
            (Some(cert), Some(key)) => Arc::new(StaticCertificateService::from_pem_files(
                Path::new(cert),
                Path::new(key),
            )?),
            _ => {
                tracing::warn!("No certificate configured, TLS handshakes will be refused");
                Arc::new(UnavailableCertificateService)
            }
        };

    let handler_pool = match config.handler.worker_threads {
        0 => None,
        threads => {
            tracing::info!(worker_threads = threads, "Starting main handler pool");
            Some(HandlerPool::new(threads)?)
        }
    };

    let shutdown = Shutdown::new();
    let mut server = HttpServer::new(config, certificates).with_main_handler(ForwardHandler::new());
    if let Some(pool) = &handler_pool {
        server = server.with_handler_executor(pool.executor());
    }
    let handle = server.start(shutdown.subscribe()).await?;

    wait_for_signal().await?;
    shutdown.trigger();
    handle.wait().await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
