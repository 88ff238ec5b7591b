//! # Structured Logging
//!
//! Environment-aware tracing initialization for binaries and tests that
//! embed the engine. Library code only emits `tracing` events; installing a
//! subscriber stays the embedder's choice, and this helper is the default
//! one.

use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging once per process.
///
/// The filter comes from `RUST_LOG` (default `info`); setting
/// `PIPELINE_LOG_FORMAT=json` switches to JSON output for log shippers.
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let json = std::env::var("PIPELINE_LOG_FORMAT")
            .map(|format| format.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let result = if json {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_target(true).json())
                .try_init()
        } else {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_target(true))
                .try_init()
        };

        // A subscriber installed by the embedding application wins.
        if let Err(error) = result {
            tracing::debug!(error = %error, "tracing subscriber already installed");
        }
    });
}
