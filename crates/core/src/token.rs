//! Session token acquisition through the token proxy.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("token endpoint returned status {0}")]
    Status(reqwest::StatusCode),
    #[error("token not found in token endpoint response: {0}")]
    MissingToken(String),
}

/// Anything that can hand out a fresh channel token.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Requests a new token. Implementations must not cache tokens.
    async fn fetch_token(&self) -> Result<String, TokenError>;
}

/// Pulls the `token` string out of a token endpoint response body.
pub fn extract_token(body: &Value) -> Result<String, TokenError> {
    body.get("token")
        .and_then(Value::as_str)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .ok_or_else(|| TokenError::MissingToken(body.to_string()))
}

/// A `TokenSource` that calls the backend token proxy over HTTP.
pub struct ProxyTokenSource {
    http: reqwest::Client,
    url: String,
}

impl ProxyTokenSource {
    pub fn new(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl TokenSource for ProxyTokenSource {
    async fn fetch_token(&self) -> Result<String, TokenError> {
        let response = self.http.get(&self.url).send().await?;
        if !response.status().is_success() {
            return Err(TokenError::Status(response.status()));
        }
        let body: Value = response.json().await?;
        debug!(keys = ?body.as_object().map(|o| o.keys().cloned().collect::<Vec<_>>()), "Token response received");
        extract_token(&body)
    }
}
