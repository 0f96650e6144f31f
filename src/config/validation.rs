//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, addresses parse)
//! - Reject TLS protocols and ALPN identifiers the connection core cannot drive
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::ProxyConfig;

/// Smallest read buffer hyper accepts for HTTP/1.1.
pub const MIN_REQUEST_HEAD_BYTES: usize = 8192;

/// Upper bound for the dedicated handler pool.
pub const MAX_HANDLER_THREADS: usize = 1024;
use crate::net::tls::{
    APPLICATION_PROTOCOL_HTTP_1_1, APPLICATION_PROTOCOL_HTTP_2, TLS_V1_2, TLS_V1_3,
};

/// A single semantic problem found in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("listener.bind_address {0:?} is not a socket address")]
    InvalidBindAddress(String),

    #[error("listener.max_connections must be greater than zero")]
    ZeroMaxConnections,

    #[error("connection.idle_timeout_secs must be greater than zero")]
    ZeroIdleTimeout,

    #[error("connection.handshake_timeout_secs must be greater than zero")]
    ZeroHandshakeTimeout,

    #[error("connection.max_request_head_bytes must be at least {MIN_REQUEST_HEAD_BYTES}, got {0}")]
    RequestHeadLimitTooSmall(usize),

    #[error("handler.worker_threads must be at most {MAX_HANDLER_THREADS}, got {0}")]
    TooManyHandlerThreads(usize),

    #[error("tls.protocols must not be empty")]
    NoTlsProtocols,

    #[error("tls.protocols contains unknown protocol {0:?}")]
    UnknownTlsProtocol(String),

    #[error("tls.application_protocols must not be empty when ALPN is enabled")]
    NoApplicationProtocols,

    #[error("tls.application_protocols contains unsupported protocol {0:?}")]
    UnsupportedApplicationProtocol(String),

    #[error("tls.cert_path and tls.key_path must be set together")]
    IncompleteCertificate,
}

/// Validate a configuration, collecting every problem found.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidBindAddress(
            config.listener.bind_address.clone(),
        ));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::ZeroMaxConnections);
    }

    if config.connection.idle_timeout_secs == 0 {
        errors.push(ValidationError::ZeroIdleTimeout);
    }
    if config.connection.handshake_timeout_secs == 0 {
        errors.push(ValidationError::ZeroHandshakeTimeout);
    }

    if let Some(limit) = config.connection.max_request_head_bytes {
        if limit < MIN_REQUEST_HEAD_BYTES {
            errors.push(ValidationError::RequestHeadLimitTooSmall(limit));
        }
    }
    if config.handler.worker_threads > MAX_HANDLER_THREADS {
        errors.push(ValidationError::TooManyHandlerThreads(
            config.handler.worker_threads,
        ));
    }

    let tls = &config.tls;
    if tls.protocols.is_empty() {
        errors.push(ValidationError::NoTlsProtocols);
    }
    for protocol in &tls.protocols {
        if protocol != TLS_V1_2 && protocol != TLS_V1_3 {
            errors.push(ValidationError::UnknownTlsProtocol(protocol.clone()));
        }
    }

    if tls.alpn_enabled {
        if tls.application_protocols.is_empty() {
            errors.push(ValidationError::NoApplicationProtocols);
        }
        for protocol in &tls.application_protocols {
            if protocol != APPLICATION_PROTOCOL_HTTP_1_1 && protocol != APPLICATION_PROTOCOL_HTTP_2
            {
                errors.push(ValidationError::UnsupportedApplicationProtocol(
                    protocol.clone(),
                ));
            }
        }
    }

    if tls.cert_path.is_some() != tls.key_path.is_some() {
        errors.push(ValidationError::IncompleteCertificate);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
