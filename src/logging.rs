use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

use crate::config::Config;

/// Install the global subscriber. Logs go to stderr so command output on
/// stdout stays clean. `RUST_LOG` wins over `LOG_LEVEL` when both are set.
pub fn init_logging(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false);

    let installed = if config.log_format.eq_ignore_ascii_case("json") {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| anyhow!("failed to install log subscriber: {e}"))
}
