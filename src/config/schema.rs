//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default idle timeout of a client connection, in seconds.
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 20;

/// Root configuration for the intercepting proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address, connection limit).
    pub listener: ListenerConfig,

    /// Per-connection options.
    pub connection: ConnectionOptions,

    /// TLS protocol, cipher and ALPN preferences.
    pub tls: TlsSettings,

    /// Main handler execution pool.
    pub handler: HandlerConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "127.0.0.1:8080"). Port 0 binds an ephemeral port.
    pub bind_address: String,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8080".to_string(),
            max_connections: 10_000,
        }
    }
}

/// Options applied to every accepted connection.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionOptions {
    /// Idle time after which an HTTP/1.1 connection is closed, in seconds.
    pub idle_timeout_secs: u64,

    /// Upper bound for a TLS handshake, in seconds.
    pub handshake_timeout_secs: u64,

    /// Read buffer limit for an HTTP/1.1 request head, in bytes.
    /// Unset keeps hyper's default.
    pub max_request_head_bytes: Option<usize>,
}

impl ConnectionOptions {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            handshake_timeout_secs: 10,
            max_request_head_bytes: None,
        }
    }
}

/// Main handler pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HandlerConfig {
    /// Worker threads of the dedicated handler runtime. Zero runs the
    /// handler on the runtime serving connections.
    pub worker_threads: usize,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self { worker_threads: 4 }
    }
}

/// TLS settings as written in the config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsSettings {
    /// Enabled protocol versions ("TLSv1.2", "TLSv1.3").
    pub protocols: Vec<String>,

    /// Allowed cipher suites by name. Empty keeps the provider defaults.
    pub cipher_suites: Vec<String>,

    /// Whether ALPN is offered at all.
    pub alpn_enabled: bool,

    /// Application protocols offered through ALPN, most preferred first.
    pub application_protocols: Vec<String>,

    /// Path to the server certificate chain (PEM).
    pub cert_path: Option<String>,

    /// Path to the server private key (PEM).
    pub key_path: Option<String>,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            protocols: vec!["TLSv1.2".to_string(), "TLSv1.3".to_string()],
            cipher_suites: Vec::new(),
            alpn_enabled: true,
            application_protocols: vec!["h2".to_string(), "http/1.1".to_string()],
            cert_path: None,
            key_path: None,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit JSON log lines instead of the human readable format.
    pub json_logs: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
