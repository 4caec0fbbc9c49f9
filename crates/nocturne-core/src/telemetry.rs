//! Global tracing subscriber setup for programs embedding the engine.
//!
//! Only the first call in a process takes effect; later calls are ignored.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Selects JSON output when set to `json`.
pub const LOG_FORMAT_ENV: &str = "NOCTURNE_LOG_FORMAT";

/// Install the global subscriber.
///
/// `RUST_LOG` wins when set; otherwise `level` is the default verbosity.
/// `json` switches to newline-delimited JSON lines.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if json {
        registry
            .with(fmt::layer().with_target(false).json())
            .try_init()
    } else {
        registry.with(fmt::layer().with_target(false)).try_init()
    };
    result.ok();
}

/// Like [`init_tracing`] at `INFO`, with the format taken from
/// `NOCTURNE_LOG_FORMAT`.
pub fn init_from_env() {
    let json = std::env::var(LOG_FORMAT_ENV)
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    init_tracing(json, Level::INFO);
}
