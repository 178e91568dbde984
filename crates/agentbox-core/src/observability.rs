//! Observability: tracing init.
//!
//! Uses `config::ObservabilityConfig` for AGENTBOX_QUIET, LOG_LEVEL and
//! LOG_JSON. The agent binary must log to stderr only — stdout carries the
//! wire protocol — so every layer here writes to stderr.

use tracing_subscriber::{prelude::*, EnvFilter};

/// Initialize tracing. Call once at process startup.
///
/// When AGENTBOX_QUIET=1, only WARN and above are logged. `RUST_LOG` (the
/// standard env filter) takes precedence over both when set.
pub fn init_tracing() {
    let cfg = crate::config::ObservabilityConfig::from_env();
    let level: String = if cfg.quiet {
        "agentbox=warn".to_string()
    } else {
        cfg.log_level.clone()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));

    let _ = if cfg.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    };
}
