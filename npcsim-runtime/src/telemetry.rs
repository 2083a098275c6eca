//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use npcsim_core::config::SimConfig;

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `general.log_level`. With `telemetry.json_logs` the
/// output is one JSON object per line.
///
/// # Errors
/// Fails if the level string is not a valid filter or a global subscriber
/// is already installed.
pub fn init_tracing(config: &SimConfig) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.general.log_level)?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    if config.telemetry.json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()?;
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()?;
    }
    Ok(())
}
