//! Per-connection stage chain.
//!
//! # Data Flow
//! ```text
//! accept → context attached → initial chain:
//!
//!   timeout → tls.upgrade → http.decoder → http.encoder → http.connect
//!           → http.recursive → http.main-handler → exception
//!
//! ALPN "h2" (negotiation.rs):
//!
//!   tls.upgrade → http2.codec → http.connect → http.recursive
//!               → http.main-handler → exception
//! ```
//!
//! # Design Decisions
//! - The chain is an ordered list of tagged stages owned by one connection
//!   task; only that task reads or rewrites it, so no lock guards it
//! - Rewrites are splices (remove / replace) by stage name
//! - Exactly one framing pair is active: HTTP/1.1 decoder + encoder, or the
//!   HTTP/2 codec

pub mod driver;
pub mod negotiation;
pub mod stage;

use std::sync::Arc;

use hyper::Response;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::http::connect::{ConnectStage, TunnelRequest};
use crate::http::exception::ExceptionBoundary;
use crate::http::handler::MainHandlerStage;
use crate::http::http1::{HttpRequestDecoder, HttpResponseEncoder};
use crate::http::http2::Http2Codec;
use crate::http::recursive::RecursiveGuard;
use crate::http::request::DecodedRequest;
use crate::http::response::ProxyBody;
use crate::net::context::ConnectionContext;
use crate::net::idle::IdleTimeoutHandle;
use crate::net::tls::TlsUpgrade;

pub use negotiation::{configure_protocol, NegotiationError, NegotiationState};
pub use stage::{Stage, StageError, StageKind, StageOutcome};

/// Error raised by an invalid chain edit or an inconsistent chain.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("stage {0:?} is already in the chain")]
    DuplicateName(&'static str),

    #[error("no stage named {0:?} in the chain")]
    NoSuchStage(String),

    #[error("the chain must hold exactly one framing (HTTP/1.1 pair or HTTP/2 codec)")]
    InvalidFraming,

    #[error("the chain has no main handler stage")]
    NoMainHandler,
}

/// Framing active on a chain.
#[derive(Debug, Clone)]
pub enum Framing {
    Http1(HttpRequestDecoder),
    Http2(Http2Codec),
}

/// Stages a connection is created with, besides the ones built from its context.
pub struct ChannelStages {
    pub tls_upgrade: TlsUpgrade,
    pub tunnels: mpsc::UnboundedSender<TunnelRequest>,
    pub main_handler: MainHandlerStage,
}

/// Ordered, named stages of one connection.
#[derive(Debug)]
pub struct Pipeline {
    stages: Vec<(&'static str, Stage)>,
    state: NegotiationState,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            stages: Vec::new(),
            state: NegotiationState::Unnegotiated,
        }
    }

    /// The chain every accepted connection starts with.
    pub fn initial(ctx: &ConnectionContext, stages: ChannelStages) -> Result<Self, PipelineError> {
        let server_config = ctx.server_config();
        let mut pipeline = Self::new();
        pipeline.add_last(
            stage::TIMEOUT,
            Stage::IdleTimeout(IdleTimeoutHandle::new(server_config.idle_timeout())),
        )?;
        pipeline.add_last(stage::TLS_UPGRADE, Stage::TlsUpgrade(stages.tls_upgrade))?;
        let mut decoder = HttpRequestDecoder::new();
        if let Some(limit) = server_config.max_request_head_bytes() {
            decoder = decoder.with_max_buf_size(limit);
        }
        pipeline.add_last(stage::HTTP_DECODER, Stage::HttpDecoder(decoder))?;
        pipeline.add_last(stage::HTTP_ENCODER, Stage::HttpEncoder(HttpResponseEncoder))?;
        pipeline.add_last(stage::HTTP_CONNECT, Stage::Connect(ConnectStage::new(stages.tunnels)))?;
        pipeline.add_last(
            stage::HTTP_RECURSIVE,
            Stage::Recursive(RecursiveGuard::new(Arc::clone(server_config))),
        )?;
        pipeline.add_last(stage::MAIN_HANDLER, Stage::MainHandler(stages.main_handler))?;
        pipeline.add_last(stage::EXCEPTION, Stage::Exception(ExceptionBoundary))?;
        Ok(pipeline)
    }

    pub fn add_last(&mut self, name: &'static str, stage: Stage) -> Result<(), PipelineError> {
        if self.contains(name) {
            return Err(PipelineError::DuplicateName(name));
        }
        self.stages.push((name, stage));
        Ok(())
    }

    /// Remove the stage called `name`, running its removal hook.
    pub fn remove(&mut self, name: &str) -> Result<Stage, PipelineError> {
        let index = self.index_of(name)?;
        let (_, stage) = self.stages.remove(index);
        stage.removed();
        Ok(stage)
    }

    /// Put `stage` under `new_name` where `old_name` was.
    pub fn replace(
        &mut self,
        old_name: &str,
        new_name: &'static str,
        stage: Stage,
    ) -> Result<Stage, PipelineError> {
        let index = self.index_of(old_name)?;
        if new_name != old_name && self.contains(new_name) {
            return Err(PipelineError::DuplicateName(new_name));
        }
        let (_, old) = std::mem::replace(&mut self.stages[index], (new_name, stage));
        old.removed();
        Ok(old)
    }

    pub fn get(&self, name: &str) -> Option<&Stage> {
        self.stages
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, stage)| stage)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|(n, _)| *n == name)
    }

    /// Stage names in chain order.
    pub fn names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|(name, _)| *name).collect()
    }

    pub fn negotiation_state(&self) -> NegotiationState {
        self.state
    }

    pub(crate) fn set_negotiation_state(&mut self, state: NegotiationState) {
        self.state = state;
    }

    fn index_of(&self, name: &str) -> Result<usize, PipelineError> {
        self.position(name)
            .ok_or_else(|| PipelineError::NoSuchStage(name.to_string()))
    }

    /// The one framing active on the chain.
    pub fn framing(&self) -> Result<Framing, PipelineError> {
        let decoder = match self.get(stage::HTTP_DECODER) {
            Some(Stage::HttpDecoder(decoder)) => Some(decoder),
            _ => None,
        };
        let has_encoder = matches!(self.get(stage::HTTP_ENCODER), Some(Stage::HttpEncoder(_)));
        let codec = match self.get(stage::HTTP2_CODEC) {
            Some(Stage::Http2Codec(codec)) => Some(codec),
            _ => None,
        };

        match (decoder, has_encoder, codec) {
            (Some(decoder), true, None) => Ok(Framing::Http1(decoder.clone())),
            (None, false, Some(codec)) => Ok(Framing::Http2(codec.clone())),
            _ => Err(PipelineError::InvalidFraming),
        }
    }

    /// Snapshot of the request stages, in chain order.
    pub fn request_chain(&self) -> Result<RequestChain, PipelineError> {
        let stages: Vec<RequestStage> = self
            .stages
            .iter()
            .filter_map(|(_, stage)| match stage {
                Stage::Connect(s) => Some(RequestStage::Connect(s.clone())),
                Stage::Recursive(s) => Some(RequestStage::Recursive(s.clone())),
                Stage::MainHandler(s) => Some(RequestStage::MainHandler(s.clone())),
                _ => None,
            })
            .collect();

        if !stages.iter().any(|s| matches!(s, RequestStage::MainHandler(_))) {
            return Err(PipelineError::NoMainHandler);
        }
        Ok(RequestChain {
            stages: stages.into(),
        })
    }

    /// The exception boundary of the chain, if still present.
    pub fn exception_boundary(&self) -> Option<ExceptionBoundary> {
        match self.get(stage::EXCEPTION) {
            Some(Stage::Exception(boundary)) => Some(*boundary),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
enum RequestStage {
    Connect(ConnectStage),
    Recursive(RecursiveGuard),
    MainHandler(MainHandlerStage),
}

/// Request stages a decoded request travels, cheap to clone per request.
#[derive(Debug, Clone)]
pub struct RequestChain {
    stages: Arc<[RequestStage]>,
}

impl RequestChain {
    /// Run `request` through the stages until one of them answers.
    pub async fn process(&self, request: DecodedRequest) -> Result<Response<ProxyBody>, StageError> {
        let mut request = request;
        for stage in self.stages.iter() {
            let outcome = match stage {
                RequestStage::Connect(connect) => connect.process(request)?,
                RequestStage::Recursive(guard) => guard.process(request),
                RequestStage::MainHandler(handler) => return handler.dispatch(request).await,
            };
            match outcome {
                StageOutcome::Forward(next) => request = next,
                StageOutcome::Respond(response) => return Ok(response),
            }
        }
        Err(StageError::Unanswered)
    }
}
