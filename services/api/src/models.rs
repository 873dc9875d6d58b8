//! API Models
//!
//! Response shapes of the token proxy, used for serialization and for the
//! OpenAPI document generated with `utoipa`.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// The only error message the proxy ever returns to clients.
pub const TOKEN_FAILURE_MESSAGE: &str = "Failed to fetch token";

/// The upstream token payload. The proxy relays the upstream body untouched,
/// so this only documents the fields clients rely on.
#[derive(Serialize, Deserialize, ToSchema, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    #[schema(example = "ew0KICAiYWxnIjog...")]
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, rename = "expires_in", skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct ErrorResponse {
    #[schema(example = "Failed to fetch token")]
    pub error: String,
}

impl ErrorResponse {
    pub fn token_failure() -> Self {
        Self {
            error: TOKEN_FAILURE_MESSAGE.to_string(),
        }
    }
}
