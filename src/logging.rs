//! Tracing bootstrap for the leadboard binary.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable holding the tracing filter directive.
pub const LOG_ENV: &str = "LEADBOARD_LOG";

/// Build the filter from `LEADBOARD_LOG`, falling back to `default_level`.
pub fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Initialize tracing with either human-readable or JSON output.
///
/// Defaults to "info" ("debug" when `verbose`) if `LEADBOARD_LOG` is not set.
/// Calling this more than once is a no-op.
pub fn init_tracing(verbose: bool, json: bool) {
    let filter = env_filter(if verbose { "debug" } else { "info" });
    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
