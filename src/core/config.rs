//! Configuration management for the synchronization core
//!
//! Settings come from a TOML file, then `UISYNC_*` environment overrides, and
//! are validated before use.

use crate::core::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default configuration file looked up by [`Config::load`]
pub const DEFAULT_CONFIG_FILE: &str = "ui-state-sync.toml";

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Change tracking and outbound assembly
    pub sync: SyncConfig,

    /// Event dispatcher and round-trip calls
    pub dispatcher: DispatcherConfig,

    /// Metrics and monitoring
    pub metrics: MetricsConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Change tracking and outbound assembly configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Extra serialization rounds allowed when writing changes produces new changes
    pub max_extra_serialization_rounds: usize,

    /// Treat `a.b` property names as nested map addressing (compatibility only)
    pub dotted_property_paths: bool,
}

/// Event dispatcher configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// How long a synchronous remote call waits for the client reply
    #[serde(
        serialize_with = "serialize_duration",
        deserialize_with = "deserialize_duration"
    )]
    pub call_timeout: Duration,
}

/// Metrics configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Register prometheus collectors
    pub enabled: bool,

    /// Prefix of every metric name
    pub namespace: String,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (compact, pretty, full)
    pub format: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_extra_serialization_rounds: 5,
            dotted_property_paths: true,
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            namespace: "uisync".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the default file (if present) and environment variables
    pub fn load() -> Result<Self> {
        let mut config = if std::path::Path::new(DEFAULT_CONFIG_FILE).exists() {
            Self::from_file(DEFAULT_CONFIG_FILE)?
        } else {
            Config::default()
        };

        config.apply_env_overrides()?;
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)
            .map_err(|e| Error::config(format!("Failed to parse config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) -> Result<()> {
        use std::env;

        if let Ok(rounds) = env::var("UISYNC_MAX_EXTRA_ROUNDS") {
            self.sync.max_extra_serialization_rounds = rounds
                .parse()
                .map_err(|e| Error::config(format!("Invalid extra round cap: {}", e)))?;
        }

        if let Ok(dotted) = env::var("UISYNC_DOTTED_PATHS") {
            self.sync.dotted_property_paths = dotted
                .parse()
                .map_err(|e| Error::config(format!("Invalid dotted path flag: {}", e)))?;
        }

        if let Ok(timeout) = env::var("UISYNC_CALL_TIMEOUT") {
            self.dispatcher.call_timeout = parse_duration(&timeout)
                .map_err(|e| Error::config(format!("Invalid call timeout: {}", e)))?;
        }

        if let Ok(enabled) = env::var("UISYNC_METRICS_ENABLED") {
            self.metrics.enabled = enabled
                .parse()
                .map_err(|e| Error::config(format!("Invalid metrics flag: {}", e)))?;
        }

        if let Ok(level) = env::var("UISYNC_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Ok(format) = env::var("UISYNC_LOG_FORMAT") {
            self.logging.format = format;
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.sync.max_extra_serialization_rounds > 100 {
            return Err(Error::config(
                "Too many extra serialization rounds (maximum 100)",
            ));
        }

        if self.dispatcher.call_timeout.is_zero() {
            return Err(Error::config("Call timeout must be greater than zero"));
        }

        if self.metrics.namespace.trim().is_empty() {
            return Err(Error::config("Metrics namespace must not be empty"));
        }

        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => return Err(Error::config("Invalid log level")),
        }

        match self.logging.format.as_str() {
            "compact" | "pretty" | "full" => {}
            _ => return Err(Error::config("Invalid log format")),
        }

        Ok(())
    }
}

use serde::de::{self, Deserializer, Visitor};
use serde::Serializer;
use std::fmt;

// Durations are written as "250ms" or "30s"
fn serialize_duration<S>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    if duration.subsec_millis() != 0 {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    } else {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }
}

fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    struct DurationVisitor;

    impl<'de> Visitor<'de> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a duration string like '30s' or '5m', or whole seconds")
        }

        fn visit_str<E>(self, value: &str) -> std::result::Result<Duration, E>
        where
            E: de::Error,
        {
            parse_duration(value).map_err(E::custom)
        }

        fn visit_u64<E>(self, value: u64) -> std::result::Result<Duration, E>
        where
            E: de::Error,
        {
            Ok(Duration::from_secs(value))
        }

        fn visit_i64<E>(self, value: i64) -> std::result::Result<Duration, E>
        where
            E: de::Error,
        {
            u64::try_from(value)
                .map(Duration::from_secs)
                .map_err(|_| E::custom("negative duration"))
        }
    }

    deserializer.deserialize_any(DurationVisitor)
}

/// Simple duration parser for common formats
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        let ms: u64 = ms.parse().map_err(|_| "Invalid milliseconds")?;
        Ok(Duration::from_millis(ms))
    } else if let Some(secs) = s.strip_suffix('s') {
        let secs: u64 = secs.parse().map_err(|_| "Invalid seconds")?;
        Ok(Duration::from_secs(secs))
    } else if let Some(mins) = s.strip_suffix('m') {
        let mins: u64 = mins.parse().map_err(|_| "Invalid minutes")?;
        Ok(Duration::from_secs(mins * 60))
    } else if let Some(hours) = s.strip_suffix('h') {
        let hours: u64 = hours.parse().map_err(|_| "Invalid hours")?;
        Ok(Duration::from_secs(hours * 3600))
    } else {
        let secs: u64 = s.parse().map_err(|_| "Invalid duration format")?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sync.max_extra_serialization_rounds, 5);
        assert!(config.sync.dotted_property_paths);
        assert_eq!(config.dispatcher.call_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            [sync]
            max_extra_serialization_rounds = 2

            [dispatcher]
            call_timeout = "250ms"
            "#,
        )
        .unwrap();

        assert_eq!(config.sync.max_extra_serialization_rounds, 2);
        assert!(config.sync.dotted_property_paths);
        assert_eq!(config.dispatcher.call_timeout, Duration::from_millis(250));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let result = Config::from_toml_str("[logging]\nlevel = \"loud\"\n");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[metrics]\nnamespace = \"forms\"\nenabled = false").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.metrics.namespace, "forms");
        assert!(!config.metrics.enabled);
    }

    #[test]
    fn test_duration_round_trip() {
        let config = Config {
            dispatcher: DispatcherConfig {
                call_timeout: Duration::from_millis(1500),
            },
            ..Default::default()
        };
        let text = toml::to_string(&config).unwrap();
        assert!(text.contains("1500ms"));
        assert_eq!(Config::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_parse_duration_formats() {
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("12").unwrap(), Duration::from_secs(12));
        assert!(parse_duration("soon").is_err());
    }
}
