//! Recursive-call guard.
//!
//! A request whose target is the proxy's own listening address would make the
//! proxy forward to itself without end. Such requests are answered here and
//! never reach the main handler.

use std::net::IpAddr;
use std::sync::Arc;

use crate::http::request::{DecodedRequest, Target};
use crate::http::response;
use crate::net::context::ServerConfig;
use crate::observability::metrics;
use crate::pipeline::stage::StageOutcome;

#[derive(Debug, Clone)]
pub struct RecursiveGuard {
    server_config: Arc<ServerConfig>,
}

impl RecursiveGuard {
    pub fn new(server_config: Arc<ServerConfig>) -> Self {
        Self { server_config }
    }

    pub fn process<B>(&self, request: DecodedRequest<B>) -> StageOutcome<B> {
        match request.target() {
            Some(target) if self.is_recursive(&target) => {
                tracing::warn!(
                    target = %target,
                    method = %request.method(),
                    "Recursive request to the proxy rejected"
                );
                metrics::record_recursive_request();
                StageOutcome::Respond(response::recursive_request())
            }
            _ => StageOutcome::Forward(request),
        }
    }

    /// Whether `target` designates the address this server is bound to.
    pub fn is_recursive(&self, target: &Target) -> bool {
        let Some(bound) = self.server_config.address() else {
            return false;
        };
        if target.port() != bound.port() {
            return false;
        }

        let host = target
            .host()
            .trim_start_matches('[')
            .trim_end_matches(']');
        let bound_ip = bound.ip();
        match host.parse::<IpAddr>() {
            Ok(ip) => {
                ip == bound_ip
                    || (bound_ip.is_unspecified()
                        && (ip.is_loopback() || self.server_config.is_interface_address(ip)))
            }
            Err(_) => {
                host.eq_ignore_ascii_case("localhost")
                    && (bound_ip.is_loopback() || bound_ip.is_unspecified())
            }
        }
    }
}
