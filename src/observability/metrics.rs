//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_connections_total` (counter)
//! - `proxy_active_connections` (gauge)
//! - `proxy_protocol_negotiations_total` (counter): by ALPN protocol
//! - `proxy_connection_errors_total` (counter): by error kind
//! - `proxy_recursive_requests_total` (counter)
//! - `proxy_connect_tunnels_total` (counter)
//!
//! Recording is a no-op until a recorder is installed, so the counters cost
//! nothing in tests or when metrics are disabled.

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder and its scrape endpoint on `addr`.
///
/// Must run inside a tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_connection_accepted() {
    counter!("proxy_connections_total").increment(1);
}

pub fn record_active_connections(count: u64) {
    gauge!("proxy_active_connections").set(count as f64);
}

pub fn record_negotiation(protocol: &str) {
    counter!("proxy_protocol_negotiations_total", "protocol" => protocol.to_string()).increment(1);
}

pub fn record_connection_error(kind: &'static str) {
    counter!("proxy_connection_errors_total", "kind" => kind).increment(1);
}

pub fn record_recursive_request() {
    counter!("proxy_recursive_requests_total").increment(1);
}

pub fn record_tunnel() {
    counter!("proxy_connect_tunnels_total").increment(1);
}
