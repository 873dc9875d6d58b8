//! Conversation core for the Copilot voice client.
//!
//! Owns one conversation with a bot: token acquisition, the bot channel,
//! inbound filtering, the transcript and the speech side effects. The
//! front-end only sends [`session::SessionCommand`]s and renders
//! [`session::SessionEvent`]s.

pub mod activity;
pub mod channel;
pub mod config;
pub mod filter;
pub mod session;
pub mod speech;
pub mod status;
pub mod token;
pub mod transcript;

pub use config::SessionConfig;
pub use session::{ConversationSession, SessionDeps, SessionEvent, SessionHandle, SessionHost};
pub use status::{SessionStatus, VoiceActivity};
