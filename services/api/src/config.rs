use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

pub const DEFAULT_PORT: u16 = 3001;

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    /// Upstream URL that issues Direct Line tokens. Token requests fail
    /// while it is unset.
    pub token_url: Option<String>,
    pub token_timeout: Duration,
    pub static_dir: PathBuf,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let port = match std::env::var("PORT") {
            Ok(port) => port
                .parse::<u16>()
                .map_err(|e| ConfigError::InvalidValue("PORT".to_string(), e.to_string()))?,
            Err(_) => DEFAULT_PORT,
        };
        let bind_address = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));

        let token_url = std::env::var("COPILOT_TOKEN_URL")
            .ok()
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty());

        let timeout_str =
            std::env::var("TOKEN_TIMEOUT_SECS").unwrap_or_else(|_| "10".to_string());
        let token_timeout = timeout_str
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| {
                ConfigError::InvalidValue("TOKEN_TIMEOUT_SECS".to_string(), e.to_string())
            })?;

        let static_dir = std::env::var("STATIC_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("dist"));

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            bind_address,
            token_url,
            token_timeout,
            static_dir,
            log_level,
        })
    }

    /// The upstream token URL, or the error every token request reports
    /// while it is missing.
    pub fn require_token_url(&self) -> Result<&str, ConfigError> {
        self.token_url
            .as_deref()
            .ok_or_else(|| ConfigError::MissingVar("COPILOT_TOKEN_URL".to_string()))
    }
}
