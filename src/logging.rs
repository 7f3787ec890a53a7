//! Console logging for binaries embedding the engine.

use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, fmt};

/// Environment variable holding the log filter, e.g. `tsumiki=debug`.
pub const LOG_ENV: &str = "TSUMIKI_LOG";

/// Installs a global subscriber that prints log lines above the progress
/// bars of running tasks.
///
/// The filter is read from [`LOG_ENV`] and defaults to `info`. Fails if a
/// global subscriber is already installed.
pub fn init() -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let indicatif = IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(indicatif.get_stderr_writer()),
        )
        .with(indicatif)
        .try_init()
}
