//! Exception boundary: the last stage of every chain.
//!
//! Whatever error ends a connection lands here. The boundary records it and
//! the connection is dropped; nothing tries to bring a failed connection back
//! into a usable state.

use crate::net::connection::ConnectionId;
use crate::observability::metrics;
use crate::pipeline::driver::ConnectionError;

#[derive(Debug, Clone, Copy, Default)]
pub struct ExceptionBoundary;

impl ExceptionBoundary {
    /// Record the error that closed connection `id`.
    pub fn caught(&self, id: ConnectionId, error: &ConnectionError) {
        let kind = error.kind();
        metrics::record_connection_error(kind);

        match error {
            ConnectionError::Negotiation(_) => {
                tracing::debug!(connection_id = %id, error = %error, "Negotiation failed, closing connection");
            }
            ConnectionError::Tls(_) => {
                tracing::debug!(connection_id = %id, error = %error, "TLS handshake failed, closing connection");
            }
            _ if error.is_idle_timeout() => {
                tracing::debug!(connection_id = %id, "Idle timeout, closing connection");
            }
            ConnectionError::Http(e) if e.is_incomplete_message() || e.is_closed() => {
                tracing::trace!(connection_id = %id, error = %error, "Peer went away");
            }
            _ => {
                tracing::warn!(connection_id = %id, kind, error = %error, "Closing connection after error");
            }
        }
    }
}
