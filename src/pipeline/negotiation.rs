//! Application-protocol negotiation.
//!
//! Runs once per connection, right after a TLS handshake settles ALPN:
//!
//! ```text
//! Unnegotiated ──"http/1.1"──▶ Http1Active        (chain untouched)
//!              ──"h2"────────▶ Http2Active        (timeout + HTTP/1.1 pair out,
//!                                                  http2.codec in)
//!              ──other───────▶ UnsupportedClosed  (connection closed)
//! ```

use thiserror::Error;

use crate::http::http2::Http2Codec;
use crate::net::context::ConnectionContext;
use crate::net::tls::{APPLICATION_PROTOCOL_HTTP_1_1, APPLICATION_PROTOCOL_HTTP_2};
use crate::observability::metrics;
use crate::pipeline::stage::{self, Stage};
use crate::pipeline::{Pipeline, PipelineError};

/// Where a connection stands in protocol negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Unnegotiated,
    Http1Active,
    Http2Active,
    UnsupportedClosed,
}

impl std::fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NegotiationState::Unnegotiated => "unnegotiated",
            NegotiationState::Http1Active => "http1-active",
            NegotiationState::Http2Active => "http2-active",
            NegotiationState::UnsupportedClosed => "unsupported-closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("protocol already negotiated ({0})")]
    AlreadyNegotiated(NegotiationState),

    #[error("negotiated protocol not supported: {0:?}")]
    Unsupported(String),

    #[error("cannot rewrite the chain: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Rewrite `pipeline` for the negotiated `protocol`.
///
/// The default pipeline configurator of the server. Failures are logged here
/// at error level; the exception boundary only records them.
pub fn configure_protocol(
    pipeline: &mut Pipeline,
    ctx: &ConnectionContext,
    protocol: &str,
) -> Result<NegotiationState, NegotiationError> {
    let result = negotiate(pipeline, ctx, protocol);
    if let Err(e) = &result {
        tracing::error!(connection_id = %ctx.id(), protocol, error = %e, "Protocol negotiation failed");
    }
    result
}

fn negotiate(
    pipeline: &mut Pipeline,
    ctx: &ConnectionContext,
    protocol: &str,
) -> Result<NegotiationState, NegotiationError> {
    let current = pipeline.negotiation_state();
    if current != NegotiationState::Unnegotiated {
        return Err(NegotiationError::AlreadyNegotiated(current));
    }

    match protocol {
        APPLICATION_PROTOCOL_HTTP_1_1 => {
            pipeline.set_negotiation_state(NegotiationState::Http1Active);
            metrics::record_negotiation(protocol);
            tracing::debug!(connection_id = %ctx.id(), protocol, "Serving HTTP/1.1");
            Ok(NegotiationState::Http1Active)
        }
        APPLICATION_PROTOCOL_HTTP_2 => {
            splice_http2(pipeline, ctx)?;
            pipeline.set_negotiation_state(NegotiationState::Http2Active);
            metrics::record_negotiation(protocol);
            tracing::debug!(connection_id = %ctx.id(), protocol, "Serving HTTP/2");
            Ok(NegotiationState::Http2Active)
        }
        other => {
            pipeline.set_negotiation_state(NegotiationState::UnsupportedClosed);
            Err(NegotiationError::Unsupported(other.to_string()))
        }
    }
}

fn splice_http2(pipeline: &mut Pipeline, ctx: &ConnectionContext) -> Result<(), PipelineError> {
    for name in [stage::TIMEOUT, stage::HTTP_DECODER, stage::HTTP_ENCODER] {
        if !pipeline.contains(name) {
            return Err(PipelineError::NoSuchStage(name.to_string()));
        }
    }
    if pipeline.contains(stage::HTTP2_CODEC) {
        return Err(PipelineError::DuplicateName(stage::HTTP2_CODEC));
    }

    pipeline.remove(stage::TIMEOUT)?;
    pipeline.remove(stage::HTTP_DECODER)?;
    pipeline.replace(
        stage::HTTP_ENCODER,
        stage::HTTP2_CODEC,
        Stage::Http2Codec(Http2Codec::new(ctx.scheme())),
    )?;
    Ok(())
}
