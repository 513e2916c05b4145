/// Logging setup for the command line tool.
use std::io;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Default filter when neither `RUST_LOG` nor a level is given.
pub fn default_log_level() -> &'static str {
    "info"
}

/// Build the filter from `RUST_LOG`, falling back to `level`.
pub fn build_filter(level: Option<&str>) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = level.unwrap_or(default_log_level());
        EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new(default_log_level()))
    })
}

/// Install the global subscriber writing to stderr.
///
/// `RUST_LOG` takes precedence over the level passed on the command line.
/// Fails if a subscriber was already installed.
pub fn init_logging(level: Option<&str>) -> Result<(), tracing_subscriber::util::TryInitError> {
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_target(false);

    tracing_subscriber::registry()
        .with(build_filter(level))
        .with(stderr_layer)
        .try_init()
}
