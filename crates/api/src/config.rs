//! Application configuration

use std::env;
use std::path::PathBuf;

use repurpose_credits::DEFAULT_LOCK_TIMEOUT_MS;

/// Longest lock wait an operator may configure
const MAX_LOCK_TIMEOUT_MS: u64 = 5_000;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,

    // Database
    pub database_url: String,
    pub database_max_connections: u32,
    pub run_migrations: bool,
    /// Lock wait for plan mutations
    pub lock_timeout_ms: u64,

    // Authentication
    /// Bearer token the gateway presents on every request
    pub internal_api_secret: String,
    /// Bearer token for scheduled jobs; cron routes are disabled without it
    pub cron_secret: Option<String>,

    // Entitlements
    pub tier_config_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),

            // Database
            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .unwrap_or(20),
            run_migrations: env::var("RUN_MIGRATIONS")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .unwrap_or(false),
            lock_timeout_ms: {
                let raw = env::var("LOCK_TIMEOUT_MS")
                    .unwrap_or_else(|_| DEFAULT_LOCK_TIMEOUT_MS.to_string());
                let ms: u64 = raw
                    .parse()
                    .map_err(|_| ConfigError::Invalid("LOCK_TIMEOUT_MS must be an integer"))?;
                if !(1..=MAX_LOCK_TIMEOUT_MS).contains(&ms) {
                    return Err(ConfigError::Invalid(
                        "LOCK_TIMEOUT_MS must be between 1 and 5000",
                    ));
                }
                ms
            },

            // Authentication
            internal_api_secret: {
                let secret = env::var("INTERNAL_API_SECRET")
                    .map_err(|_| ConfigError::Missing("INTERNAL_API_SECRET"))?;
                if secret.len() < 32 {
                    return Err(ConfigError::WeakSecret(
                        "INTERNAL_API_SECRET must be at least 32 characters",
                    ));
                }
                secret
            },
            cron_secret: match env::var("CRON_SECRET") {
                Ok(secret) if secret.is_empty() => None,
                Ok(secret) if secret.len() < 32 => {
                    return Err(ConfigError::WeakSecret(
                        "CRON_SECRET must be at least 32 characters",
                    ))
                }
                Ok(secret) => Some(secret),
                Err(_) => None,
            },

            // Entitlements
            tier_config_path: env::var("TIER_CONFIG_PATH")
                .ok()
                .filter(|p| !p.is_empty())
                .map(PathBuf::from),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
    #[error("Weak secret: {0}")]
    WeakSecret(&'static str),
}
