use tracing_subscriber::filter::EnvFilter;

use crate::config::{CoreConfig, LogFormat};
use crate::errors::{ConfigError, CrystalError, Result};

/// Builds the event filter: `RUST_LOG` when set, else the configured level.
pub fn event_filter(config: &CoreConfig) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.log_level).map_err(|_| {
        ConfigError::InvalidEnvVar {
            key: "CRYSTAL_LOG_LEVEL".into(),
            value: config.log_level.clone(),
        }
        .into()
    })
}

/// Installs the global subscriber for the engine binary.
///
/// Colours are only used on an interactive terminal outside production.
pub fn init_tracing(config: &CoreConfig) -> Result<()> {
    let filter = event_filter(config)?;
    let ansi = !config.is_production() && atty::is(atty::Stream::Stdout);
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_ansi(ansi);

    let installed = match config.log_format {
        LogFormat::Full => builder.with_target(true).try_init(),
        LogFormat::Compact => builder.compact().with_target(false).try_init(),
    };
    installed.map_err(|err| CrystalError::LoggingError(err.to_string()))
}
