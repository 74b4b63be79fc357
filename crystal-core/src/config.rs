use std::env;

use crate::errors::ConfigError;

/// Runtime environment used by the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl Environment {
    fn from_str(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "production" | "prod" => Environment::Production,
            "staging" | "stage" => Environment::Staging,
            _ => Environment::Development,
        }
    }
}

impl Default for Environment {
    fn default() -> Self {
        Environment::Development
    }
}

/// What happens to the record of a transient policy once its monitor fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientRetirement {
    /// Keep the record for auditing with `alive = false`.
    MarkInactive,
    /// Delete the record together with the monitor.
    Delete,
}

impl TransientRetirement {
    fn parse(key: &str, value: &str) -> Result<Self, ConfigError> {
        match value.to_ascii_lowercase().as_str() {
            "mark_inactive" | "inactive" => Ok(TransientRetirement::MarkInactive),
            "delete" => Ok(TransientRetirement::Delete),
            _ => Err(ConfigError::InvalidEnvVar {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }
}

impl Default for TransientRetirement {
    fn default() -> Self {
        TransientRetirement::MarkInactive
    }
}

/// Output layout of the log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Timestamp, level, target and fields.
    Full,
    /// Single line without the target, for container logs.
    Compact,
}

impl LogFormat {
    fn parse(key: &str, value: &str) -> Result<Self, ConfigError> {
        match value.to_ascii_lowercase().as_str() {
            "full" => Ok(LogFormat::Full),
            "compact" => Ok(LogFormat::Compact),
            _ => Err(ConfigError::InvalidEnvVar {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Full
    }
}

/// Global configuration shared across the engine and its tools.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub database_url: Option<String>,
    pub environment: Environment,
    pub node_name: String,
    pub http_bind: String,
    pub metrics_bind: Option<String>,
    pub filter_api_url: Option<String>,
    pub auth_token: Option<String>,
    pub transient_retirement: TransientRetirement,
    pub persistent_alive_after_fire: bool,
    /// Default `EnvFilter` directive; `RUST_LOG` overrides it.
    pub log_level: String,
    pub log_format: LogFormat,
}

impl CoreConfig {
    /// Loads configuration from the process environment using the `CRYSTAL_` prefix.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with_prefix("CRYSTAL_")
    }

    /// Loads configuration from env vars prefixed with the provided value.
    ///
    /// `DATABASE_URL` is read both with and without the prefix so the usual
    /// unprefixed variable keeps working.
    pub fn from_env_with_prefix(prefix: &str) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(prefix, |key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(prefix: &str, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let key = |suffix: &str| format!("{}{}", prefix, suffix);
        let non_empty = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let database_url = non_empty(&key("DATABASE_URL")).or_else(|| non_empty("DATABASE_URL"));

        let environment = non_empty(&key("ENV"))
            .map(|raw| Environment::from_str(&raw))
            .unwrap_or_default();

        let node_name = non_empty(&key("NODE_NAME")).unwrap_or_else(|| "crystal-node".to_string());
        let http_bind = non_empty(&key("HTTP_BIND")).unwrap_or_else(|| "0.0.0.0:9000".to_string());
        let metrics_bind = non_empty(&key("METRICS_BIND"));
        let filter_api_url = non_empty(&key("FILTER_API_URL"));
        let auth_token = non_empty(&key("AUTH_TOKEN"));

        let retirement_key = key("TRANSIENT_RETIREMENT");
        let transient_retirement = match non_empty(&retirement_key) {
            Some(raw) => TransientRetirement::parse(&retirement_key, &raw)?,
            None => TransientRetirement::default(),
        };

        let alive_key = key("PERSISTENT_ALIVE_AFTER_FIRE");
        let persistent_alive_after_fire = match non_empty(&alive_key) {
            Some(raw) => parse_bool(&alive_key, &raw)?,
            None => true,
        };

        let log_level = non_empty(&key("LOG_LEVEL")).unwrap_or_else(|| "info".to_string());
        let format_key = key("LOG_FORMAT");
        let log_format = match non_empty(&format_key) {
            Some(raw) => LogFormat::parse(&format_key, &raw)?,
            None => LogFormat::default(),
        };

        Ok(Self {
            database_url,
            environment,
            node_name,
            http_bind,
            metrics_bind,
            filter_api_url,
            auth_token,
            transient_retirement,
            persistent_alive_after_fire,
            log_level,
            log_format,
        })
    }

    /// Returns the Postgres URL, if a durable store is configured.
    pub fn database_url(&self) -> Option<&str> {
        self.database_url.as_deref()
    }

    /// Whether the service is running in production.
    pub fn is_production(&self) -> bool {
        matches!(self.environment, Environment::Production)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnvVar {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}
