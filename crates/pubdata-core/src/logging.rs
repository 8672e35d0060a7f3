use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, LoggingSection};
use crate::error::ConfigError;

/// Builds the filter: `RUST_LOG` when set and valid, otherwise the configured level.
pub fn env_filter(section: &LoggingSection) -> Result<EnvFilter, ConfigError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&section.level).map_err(|e| {
            ConfigError::Tracing(format!("invalid log level '{}': {e}", section.level))
        }),
    }
}

/// Installs the global subscriber.
///
/// Fails if a subscriber is already installed.
pub fn init_tracing(section: &LoggingSection) -> Result<(), ConfigError> {
    let format = section
        .log_format()
        .map_err(|e| ConfigError::Invalid(vec![e]))?;
    let filter = env_filter(section)?;
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match format {
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
    };
    installed.map_err(|e| ConfigError::Tracing(format!("failed to init subscriber: {e}")))?;

    tracing::debug!(level = %section.level, format = %section.format, "tracing initialized");
    Ok(())
}
