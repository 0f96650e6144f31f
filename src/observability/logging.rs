//! Structured logging.
//!
//! `RUST_LOG` wins over the configured level, so a single run can be made
//! more verbose without touching the config file.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ObservabilityConfig;

/// Install the global subscriber. Plain text unless `json_logs` is set.
pub fn init_logging(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(&config.log_level)));

    let registry = tracing_subscriber::registry().with(filter);
    if config.json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Directive applying `level` to this crate only, keeping dependencies quiet.
fn default_directive(level: &str) -> String {
    format!("intercepting_proxy={level},warn")
}
