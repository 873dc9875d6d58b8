use clap::Parser;
use copilot_voice_core::{
    SessionConfig,
    config::{DEFAULT_TOKEN_URL, DEFAULT_USER_NAME},
    speech::DEFAULT_LOCALE,
};

/// Talk to a Copilot Studio bot from the terminal.
#[derive(Parser, Debug)]
#[command(name = "copilot-voice", version, long_about = None)]
pub struct Args {
    /// Token endpoint, normally the token proxy.
    #[arg(long, env = "COPILOT_PROXY_URL", default_value = DEFAULT_TOKEN_URL)]
    pub token_url: String,

    /// Direct Line base URL, for regional or self-hosted channels.
    #[arg(long, env = "DIRECTLINE_DOMAIN")]
    pub directline_domain: Option<String>,

    /// Locale for speech capture and synthesis.
    #[arg(long, env = "COPILOT_LOCALE", default_value = DEFAULT_LOCALE)]
    pub locale: String,

    /// Display name sent with every message.
    #[arg(long, env = "COPILOT_USER_NAME", default_value = DEFAULT_USER_NAME)]
    pub user_name: String,

    /// Speech-to-text command run once per capture. `{locale}` is replaced
    /// with the locale; the first line it prints is the transcript.
    #[arg(long, env = "COPILOT_STT_COMMAND")]
    pub stt_command: Option<String>,

    /// Do not read bot replies aloud.
    #[arg(long)]
    pub no_speech: bool,
}

impl Args {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            token_url: self.token_url.trim().to_string(),
            user_name: self.user_name.clone(),
        }
    }
}
