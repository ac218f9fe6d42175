//! Tracing subscriber setup

use crate::core::config::LoggingConfig;
use crate::core::error::{Error, Result};
use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber described by `config`
///
/// `RUST_LOG` takes precedence over the configured level. Installing a second
/// subscriber fails with [`Error::Config`].
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| Error::config(format!("Invalid log filter: {}", e)))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match config.format.as_str() {
        "pretty" => builder.pretty().try_init(),
        "full" => builder.try_init(),
        "compact" => builder.compact().try_init(),
        other => return Err(Error::config(format!("Invalid log format: {}", other))),
    };
    installed.map_err(|e| Error::config(format!("Failed to install logging: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_format_is_rejected() {
        let config = LoggingConfig {
            format: "json".into(),
            ..Default::default()
        };
        assert!(matches!(init_logging(&config), Err(Error::Config(_))));
    }

    #[test]
    fn test_second_install_is_an_error() {
        let config = LoggingConfig::default();
        let _ = init_logging(&config);
        assert!(matches!(init_logging(&config), Err(Error::Config(_))));
    }
}
