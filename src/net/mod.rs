//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → context.rs (per-connection attributes)
//!     → idle.rs (idle timeout guard around the raw socket)
//!     → tls.rs (sniff, optional TLS handshake, ALPN result)
//!     → Hand off to the pipeline driver / HTTP layer
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - TLS is detected from the first bytes, never configured per port
//! - Sniffed bytes are replayed (rewind.rs), nothing is lost

pub mod certificate;
pub mod connection;
pub mod context;
pub mod idle;
pub mod listener;
pub mod rewind;
pub mod tls;
