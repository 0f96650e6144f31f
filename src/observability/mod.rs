//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! listener, TLS upgrade, negotiation, request stages, exception stage
//!     → logging.rs (structured log events, connection_id on each)
//!     → metrics.rs (counters and gauges)
//!
//! Consumers:
//!     → stdout (text or JSON)
//!     → Prometheus scrape endpoint (optional)
//! ```

pub mod logging;
pub mod metrics;
