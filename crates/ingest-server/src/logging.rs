//! Logging setup
//!
//! JSON output by default for log pipelines; `LOG_PRETTY=true` switches
//! to a compact human-readable console format for local work. The
//! minimum level comes from `LOG_LEVEL`, overridable per module with
//! `RUST_LOG`.

use ingest_core::prelude::*;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global subscriber. Call once at startup.
pub fn init(cfg: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.log_level.clone()));

    if cfg.log_pretty {
        tracing_subscriber::registry()
            .with(fmt::layer().compact().with_target(false))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    }

    info!(
        service = "ingest-server",
        instance = %cfg.instance_id,
        "logger initialized"
    );
}
