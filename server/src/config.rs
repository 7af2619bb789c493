//! Configuration management for the server.

use std::env;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// Bearer token clients must present; anonymous access when unset
    pub auth_token: Option<String>,
    /// Largest accepted push, in records
    pub max_batch_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            auth_token: None,
            max_batch_size: 1000,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let host = env::var("HOST").unwrap_or(defaults.host);

        let port = match env::var("PORT") {
            Ok(value) => value.parse().map_err(|_| ConfigError::InvalidPort)?,
            Err(_) => defaults.port,
        };

        let auth_token = env::var("AUTH_TOKEN").ok().filter(|t| !t.is_empty());

        let max_batch_size = match env::var("MAX_BATCH_SIZE") {
            Ok(value) => value
                .parse()
                .ok()
                .filter(|n| *n > 0)
                .ok_or(ConfigError::InvalidBatchSize)?,
            Err(_) => defaults.max_batch_size,
        };

        Ok(Self {
            host,
            port,
            auth_token,
            max_batch_size,
        })
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid PORT value")]
    InvalidPort,

    #[error("MAX_BATCH_SIZE must be a positive integer")]
    InvalidBatchSize,
}
