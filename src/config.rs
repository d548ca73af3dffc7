//! Application configuration module
//! Loads environment variables (with `.env` support) and validates them at startup.
//! Runtime business settings live in the `app_settings` table instead, see
//! [`crate::services::settings`].

use std::env;

use crate::payments::providers::lipana::LipanaCredentials;
use crate::payments::providers::mpesa::MpesaCredentials;
use crate::payments::providers::payhero::PayHeroCredentials;

/// Main application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    /// Absent when running with `SKIP_EXTERNALS=true`
    pub database: Option<DatabaseConfig>,
    pub logging: LoggingConfig,
    pub payments: PaymentsConfig,
    pub skip_externals: bool,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout: u64,   // seconds
    pub idle_timeout: Option<u64>, // seconds
    pub run_migrations: bool,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Gateway settings and environment credential fallbacks
#[derive(Debug, Clone, Default)]
pub struct PaymentsConfig {
    pub request_timeout_secs: u64,
    /// Public base URL used to build callback URLs, e.g. `https://api.earnify.app`
    pub callback_base_url: Option<String>,
    pub mpesa: MpesaCredentials,
    pub payhero: PayHeroCredentials,
    pub lipana: LipanaCredentials,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenv::dotenv().ok();

        let skip_externals = parse_bool("SKIP_EXTERNALS", false)?;
        let database = if skip_externals {
            None
        } else {
            Some(DatabaseConfig::from_env()?)
        };

        Ok(AppConfig {
            server: ServerConfig::from_env()?,
            database,
            logging: LoggingConfig::from_env()?,
            payments: PaymentsConfig::from_env()?,
            skip_externals,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        if let Some(database) = &self.database {
            database.validate()?;
        }
        self.logging.validate()?;
        self.payments.validate()?;

        Ok(())
    }
}

fn parse_bool(key: &str, default: bool) -> Result<bool, ConfigError> {
    match env::var(key) {
        Ok(value) => match value.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" | "" => Ok(false),
            _ => Err(ConfigError::InvalidValue(key.to_string())),
        },
        Err(_) => Ok(default),
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(ServerConfig {
            host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env::var("SERVER_PORT")
                .unwrap_or_else(|_| "8000".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("SERVER_PORT".to_string()))?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidValue(
                "SERVER_PORT cannot be 0".to_string(),
            ));
        }

        if self.host.is_empty() {
            return Err(ConfigError::InvalidValue(
                "SERVER_HOST cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(DatabaseConfig {
            url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::MissingVariable("DATABASE_URL".to_string()))?,
            max_connections: env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("DB_MAX_CONNECTIONS".to_string()))?,
            min_connections: env::var("DB_MIN_CONNECTIONS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("DB_MIN_CONNECTIONS".to_string()))?,
            connection_timeout: env::var("DB_CONNECTION_TIMEOUT")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("DB_CONNECTION_TIMEOUT".to_string()))?,
            idle_timeout: env::var("DB_IDLE_TIMEOUT")
                .ok()
                .and_then(|val| val.parse().ok()),
            run_migrations: parse_bool("RUN_MIGRATIONS", false)?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::InvalidValue("DATABASE_URL".to_string()));
        }

        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue("DB_MAX_CONNECTIONS".to_string()));
        }

        if self.min_connections > self.max_connections {
            return Err(ConfigError::InvalidValue(
                "DB_MIN_CONNECTIONS must be <= DB_MAX_CONNECTIONS".to_string(),
            ));
        }

        Ok(())
    }
}

impl LoggingConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];
        if !valid_levels.contains(&self.level.to_uppercase().as_str()) {
            return Err(ConfigError::InvalidValue("LOG_LEVEL".to_string()));
        }

        Ok(())
    }
}

impl PaymentsConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(PaymentsConfig {
            request_timeout_secs: env::var("PAYMENT_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("PAYMENT_TIMEOUT_SECS".to_string()))?,
            callback_base_url: env::var("CALLBACK_BASE_URL")
                .ok()
                .map(|v| v.trim().trim_end_matches('/').to_string())
                .filter(|v| !v.is_empty()),
            mpesa: MpesaCredentials::from_env(),
            payhero: PayHeroCredentials::from_env(),
            lipana: LipanaCredentials::from_env(),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "PAYMENT_TIMEOUT_SECS must be greater than 0".to_string(),
            ));
        }

        if let Some(base) = &self.callback_base_url {
            if !base.starts_with("http://") && !base.starts_with("https://") {
                return Err(ConfigError::InvalidValue(
                    "CALLBACK_BASE_URL must be a valid URL".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),

    #[error("Invalid value for configuration: {0}")]
    InvalidValue(String),
}

impl From<ConfigError> for crate::error::AppError {
    fn from(err: ConfigError) -> Self {
        use crate::error::{AppError, AppErrorKind, InfrastructureError};

        AppError::new(AppErrorKind::Infrastructure(
            InfrastructureError::Configuration {
                message: err.to_string(),
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_validation() {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8000,
        };

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_port_validation() {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_database_pool_bounds() {
        let config = DatabaseConfig {
            url: "postgres://localhost/earnify".to_string(),
            max_connections: 5,
            min_connections: 10,
            connection_timeout: 30,
            idle_timeout: None,
            run_migrations: false,
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_payments_callback_base_must_be_url() {
        let config = PaymentsConfig {
            request_timeout_secs: 30,
            callback_base_url: Some("earnify.app".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = PaymentsConfig {
            request_timeout_secs: 30,
            callback_base_url: Some("https://api.earnify.app".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = PaymentsConfig::default();
        assert!(config.validate().is_err());
    }
}
