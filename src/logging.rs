//! Tracing setup for the `logscan` binary.

use anyhow::{anyhow, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "logscan=info";
const VERBOSE_LOG_FILTER: &str = "logscan=debug,tower_http=debug";

/// Install a stderr fmt layer. `RUST_LOG` overrides the default filter.
///
/// stdout stays reserved for command output and JSON-lines records.
pub fn init_logging(verbose: bool) -> Result<()> {
    let default = if verbose {
        VERBOSE_LOG_FILTER
    } else {
        DEFAULT_LOG_FILTER
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(verbose)
                .with_filter(filter),
        )
        .try_init()
        .map_err(|e| anyhow!("Failed to initialize logging: {}", e))
}
