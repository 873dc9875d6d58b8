//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the configuration
//! and the HTTP client used to reach the upstream token endpoint.

use crate::config::Config;
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub http: reqwest::Client,
    pub config: Arc<Config>,
}

impl AppState {
    /// Builds the upstream client with the configured request timeout.
    pub fn new(config: Config) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(config.token_timeout)
            .build()?;
        Ok(Self {
            http,
            config: Arc::new(config),
        })
    }
}
