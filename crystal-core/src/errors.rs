use thiserror::Error;

/// Result type used across the Crystal core crate.
pub type Result<T> = std::result::Result<T, CrystalError>;

/// Canonical error representation shared by the engine and its tools.
#[derive(Debug, Error)]
pub enum CrystalError {
    #[error("database error: {0}")]
    DatabaseError(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("logging setup failed: {0}")]
    LoggingError(String),
}

impl From<sqlx::Error> for CrystalError {
    fn from(err: sqlx::Error) -> Self {
        CrystalError::DatabaseError(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for CrystalError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        CrystalError::DatabaseError(err.to_string())
    }
}

/// Dedicated configuration error used by the configuration module.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for environment variable {key}: {value}")]
    InvalidEnvVar { key: String, value: String },
}

impl From<ConfigError> for CrystalError {
    fn from(value: ConfigError) -> Self {
        CrystalError::ConfigError(value.to_string())
    }
}
