//! CONNECT tunnel stage.
//!
//! A CONNECT request never reaches the main handler. Over HTTP/1.1 the stage
//! answers `200`, and hands the pending upgrade to the connection driver,
//! which takes the raw stream back once the answer is written and runs the
//! TLS upgrade stage again on it. That second handshake is the proxy's own,
//! so the traffic inside the tunnel can be intercepted.

use hyper::upgrade::OnUpgrade;
use hyper::{Method, StatusCode};
use tokio::sync::mpsc;

use crate::http::request::{DecodedRequest, HttpProtocol, Target};
use crate::http::response;
use crate::observability::metrics;
use crate::pipeline::stage::{StageError, StageOutcome};

/// A tunnel the connection should switch to.
#[derive(Debug)]
pub struct TunnelRequest {
    pub target: Target,
    pub upgrade: OnUpgrade,
}

/// Intercepts CONNECT requests.
#[derive(Debug, Clone)]
pub struct ConnectStage {
    tunnels: mpsc::UnboundedSender<TunnelRequest>,
}

impl ConnectStage {
    pub fn new(tunnels: mpsc::UnboundedSender<TunnelRequest>) -> Self {
        Self { tunnels }
    }

    pub fn process<B>(&self, mut request: DecodedRequest<B>) -> Result<StageOutcome<B>, StageError> {
        if request.method() != Method::CONNECT {
            return Ok(StageOutcome::Forward(request));
        }

        if request.protocol() == HttpProtocol::Http2 {
            tracing::debug!(uri = %request.uri(), "CONNECT over HTTP/2 not supported");
            return Ok(StageOutcome::Respond(response::text(
                StatusCode::NOT_IMPLEMENTED,
                "CONNECT is only supported over HTTP/1.1.",
            )));
        }

        let Some(target) = request.target() else {
            tracing::debug!(uri = %request.uri(), "CONNECT without a usable target");
            return Ok(StageOutcome::Respond(response::text(
                StatusCode::BAD_REQUEST,
                "CONNECT requires a host:port target.",
            )));
        };

        let upgrade = hyper::upgrade::on(request.request_mut());
        tracing::debug!(target = %target, "CONNECT accepted, awaiting tunnel");
        self.tunnels
            .send(TunnelRequest { target, upgrade })
            .map_err(|_| StageError::TunnelClosed)?;
        metrics::record_tunnel();

        Ok(StageOutcome::Respond(response::connection_established()))
    }
}
