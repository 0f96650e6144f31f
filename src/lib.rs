//! Intercepting HTTP/HTTPS proxy: connection-handling core.
//!
//! Every accepted connection gets its own stage chain. TLS is detected from
//! the first bytes, ALPN decides between HTTP/1.1 and HTTP/2 and the chain is
//! rewritten to match, CONNECT requests turn the connection into a tunnel
//! whose traffic is intercepted with a second TLS handshake, and requests
//! aimed at the proxy itself are refused before they reach the main handler.

pub mod config;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod pipeline;

pub use config::schema::ProxyConfig;
pub use http::{HttpServer, MainHandler};
pub use lifecycle::Shutdown;
pub use pipeline::Pipeline;
