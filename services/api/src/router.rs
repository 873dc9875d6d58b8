//! Axum Router Configuration
//!
//! This module defines the complete HTTP routing for the application: the
//! token endpoint, the OpenAPI document and the static client with its
//! single-page fallback.

use crate::{
    handlers,
    models::{ErrorResponse, TokenResponse},
    state::AppState,
};

use axum::{Json, Router, routing::get};
use std::sync::Arc;
use tower_http::services::{ServeDir, ServeFile};
use tracing::{info, warn};
use utoipa::OpenApi;

pub const TOKEN_ROUTE: &str = "/api/directline/token";
pub const OPENAPI_ROUTE: &str = "/api-docs/openapi.json";

#[derive(OpenApi)]
#[openapi(
    paths(handlers::get_token),
    components(schemas(TokenResponse, ErrorResponse)),
    tags(
        (name = "Token Proxy", description = "Direct Line token issuance for the Copilot voice client")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    let static_dir = app_state.config.static_dir.clone();

    let api_router = Router::new()
        .route(TOKEN_ROUTE, get(handlers::get_token))
        .with_state(app_state);

    let router = Router::new()
        .route(OPENAPI_ROUTE, get(|| async { Json(ApiDoc::openapi()) }))
        .merge(api_router);

    // Every other path serves the built client, falling back to its entry
    // page so client-side routes resolve.
    let index = static_dir.join("index.html");
    if index.is_file() {
        info!(dir = %static_dir.display(), "Serving static client");
        router.fallback_service(ServeDir::new(&static_dir).fallback(ServeFile::new(index)))
    } else {
        warn!(dir = %static_dir.display(), "No index.html found, static client disabled");
        router
    }
}
