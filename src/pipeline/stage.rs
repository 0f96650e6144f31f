//! Stage names and stage kinds.
//!
//! The names are a compatibility surface for tooling that inspects a
//! connection's chain, and must not change.

use hyper::Response;
use thiserror::Error;
use tokio::task::JoinError;

use crate::http::connect::ConnectStage;
use crate::http::exception::ExceptionBoundary;
use crate::http::handler::MainHandlerStage;
use crate::http::http1::{HttpRequestDecoder, HttpResponseEncoder};
use crate::http::http2::Http2Codec;
use crate::http::recursive::RecursiveGuard;
use crate::http::request::DecodedRequest;
use crate::http::response::{BoxError, ProxyBody};
use crate::net::idle::IdleTimeoutHandle;
use crate::net::tls::TlsUpgrade;

pub const TIMEOUT: &str = "timeout";
pub const TLS_UPGRADE: &str = "tls.upgrade";
pub const HTTP_DECODER: &str = "http.decoder";
pub const HTTP_ENCODER: &str = "http.encoder";
pub const HTTP2_CODEC: &str = "http2.codec";
pub const HTTP_CONNECT: &str = "http.connect";
pub const HTTP_RECURSIVE: &str = "http.recursive";
pub const MAIN_HANDLER: &str = "http.main-handler";
pub const EXCEPTION: &str = "exception";

/// One processing stage of a connection.
#[derive(Debug)]
pub enum Stage {
    IdleTimeout(IdleTimeoutHandle),
    TlsUpgrade(TlsUpgrade),
    HttpDecoder(HttpRequestDecoder),
    HttpEncoder(HttpResponseEncoder),
    Http2Codec(Http2Codec),
    Connect(ConnectStage),
    Recursive(RecursiveGuard),
    MainHandler(MainHandlerStage),
    Exception(ExceptionBoundary),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    IdleTimeout,
    TlsUpgrade,
    HttpDecoder,
    HttpEncoder,
    Http2Codec,
    Connect,
    Recursive,
    MainHandler,
    Exception,
}

impl Stage {
    pub fn kind(&self) -> StageKind {
        match self {
            Stage::IdleTimeout(_) => StageKind::IdleTimeout,
            Stage::TlsUpgrade(_) => StageKind::TlsUpgrade,
            Stage::HttpDecoder(_) => StageKind::HttpDecoder,
            Stage::HttpEncoder(_) => StageKind::HttpEncoder,
            Stage::Http2Codec(_) => StageKind::Http2Codec,
            Stage::Connect(_) => StageKind::Connect,
            Stage::Recursive(_) => StageKind::Recursive,
            Stage::MainHandler(_) => StageKind::MainHandler,
            Stage::Exception(_) => StageKind::Exception,
        }
    }

    /// Called when the stage leaves the chain.
    pub(crate) fn removed(&self) {
        if let Stage::IdleTimeout(handle) = self {
            handle.disarm();
        }
    }
}

/// Result of a request stage.
#[derive(Debug)]
pub enum StageOutcome<B> {
    /// Hand the request to the next stage.
    Forward(DecodedRequest<B>),
    /// The stage answered; later stages never see the request.
    Respond(Response<ProxyBody>),
}

/// Error raised while a request travels the chain.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("main handler failed: {0}")]
    Handler(BoxError),

    #[error("main handler task failed: {0}")]
    HandlerTask(#[from] JoinError),

    #[error("CONNECT tunnel could not be handed to the connection")]
    TunnelClosed,

    #[error("request left the chain without a response")]
    Unanswered,
}
