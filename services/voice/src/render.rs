//! Plain-text rendering of session events for the terminal.

use copilot_voice_core::{
    SessionEvent, SessionStatus,
    transcript::{Message, Origin},
};

pub const TYPING_INDICATOR: &str = "bot is typing...";

pub fn message_line(message: &Message) -> String {
    let speaker = match message.origin {
        Origin::User => "you",
        Origin::Bot => "bot",
    };
    format!("{speaker}> {}", message.text)
}

pub fn status_line(status: SessionStatus) -> String {
    let hint = match status {
        SessionStatus::NeedTokenUrl => " (set --token-url or COPILOT_PROXY_URL)",
        SessionStatus::DlError => " (could not connect to the bot; see the log)",
        SessionStatus::Ready(_) => " (type a message, /mic to talk, /quit to leave)",
        _ => "",
    };
    format!("[{}]{}", status.label(), hint)
}

/// The line to print for `event`, if any. Only the start of a reply wait is
/// shown; the reply itself ends it.
pub fn render(event: &SessionEvent) -> Option<String> {
    match event {
        SessionEvent::Status(status) => Some(status_line(*status)),
        SessionEvent::Message(message) => Some(message_line(message)),
        SessionEvent::AwaitingReply(true) => Some(TYPING_INDICATOR.to_string()),
        SessionEvent::AwaitingReply(false) => None,
        SessionEvent::Notice(notice) => Some(format!("! {notice}")),
    }
}
