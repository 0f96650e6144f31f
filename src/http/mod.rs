//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! bytes (plaintext or decrypted)
//!     → http1.rs (HTTP/1.1 decoder + encoder)  or  http2.rs (HTTP/2 codec + adapter)
//!     → request.rs (DecodedRequest, same shape for both protocols)
//!     → connect.rs (CONNECT → 200 + tunnel, never forwarded)
//!     → recursive.rs (requests aimed at the proxy itself → 508)
//!     → handler.rs (main handler, on the handler executor)
//!     → response.rs (ProxyBody back through the codec)
//!
//! errors → exception.rs (log, count, close)
//! ```
//!
//! server.rs owns the accept loop; forward.rs is the main handler the binary
//! ships with.

pub mod connect;
pub mod exception;
pub mod forward;
pub mod handler;
pub mod http1;
pub mod http2;
pub mod recursive;
pub mod request;
pub mod response;
pub mod server;

pub use handler::{HandlerExecutor, HandlerPool, MainHandler};
pub use request::{DecodedRequest, HttpProtocol, Target};
pub use server::{HttpServer, ServerError, ServerHandle};
