//! Axum Handlers for the Token Proxy
//!
//! The proxy exists so the upstream token URL, which embeds the bot's
//! secret, never reaches the browser. It uses `utoipa` doc comments to
//! generate OpenAPI documentation.

use axum::{
    body::Bytes,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Json, Response},
};
use std::sync::Arc;
use tracing::{error, info, instrument};

use crate::{
    config::ConfigError,
    models::{ErrorResponse, TokenResponse},
    state::AppState,
};

/// Everything that can go wrong while relaying a token. All of it is
/// reported to the client the same way.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Copilot token fetch failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Copilot token fetch failed: {0}")]
    Status(reqwest::StatusCode),
    #[error("Copilot token response was not JSON: {0}")]
    InvalidBody(#[from] serde_json::Error),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        error!(error = %self, "Token proxy error");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse::token_failure()),
        )
            .into_response()
    }
}

/// Fetch a fresh Direct Line token from the upstream token endpoint.
#[utoipa::path(
    get,
    path = "/api/directline/token",
    responses(
        (status = 200, description = "Upstream token payload, relayed unmodified", body = TokenResponse),
        (status = 500, description = "The upstream token request failed", body = ErrorResponse)
    ),
    tag = "Token Proxy"
)]
#[instrument(name = "token_proxy", skip_all)]
pub async fn get_token(State(state): State<Arc<AppState>>) -> Result<Response, ProxyError> {
    let url = state.config.require_token_url()?;

    let upstream = state.http.get(url).send().await?;
    if !upstream.status().is_success() {
        return Err(ProxyError::Status(upstream.status()));
    }

    let body: Bytes = upstream.bytes().await?;
    // Relay the original bytes, but only once they are known to be JSON.
    serde_json::from_slice::<serde::de::IgnoredAny>(&body)?;

    info!(bytes = body.len(), "Token relayed");
    Ok(([(header::CONTENT_TYPE, "application/json")], body).into_response())
}
