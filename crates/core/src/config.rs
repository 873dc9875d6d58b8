/// Marker left in token URLs that were never filled in.
pub const PLACEHOLDER_MARKER: &str = "PASTE_YOUR";

pub const DEFAULT_TOKEN_URL: &str = "http://localhost:3001/api/directline/token";
pub const DEFAULT_USER_NAME: &str = "WebUser";

/// Settings for one conversation session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// Where session tokens are requested (normally the token proxy).
    pub token_url: String,
    /// Display name sent with every user activity.
    pub user_name: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            token_url: DEFAULT_TOKEN_URL.to_string(),
            user_name: DEFAULT_USER_NAME.to_string(),
        }
    }
}

impl SessionConfig {
    /// `false` when the token URL is empty or still a placeholder.
    pub fn has_token_url(&self) -> bool {
        let url = self.token_url.trim();
        !url.is_empty() && !url.contains(PLACEHOLDER_MARKER)
    }
}
