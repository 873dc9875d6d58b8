//! Inbound activity filtering and text clean-up.

use crate::activity::{InboundActivity, MESSAGE_KIND};

/// Why an inbound activity did not become a transcript message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skip {
    NotAMessage,
    SelfOriginated,
    NoText,
    Echo,
}

/// Runs the inbound pipeline and returns the text to display, or the reason
/// the activity was dropped.
///
/// `user_id` is the local session user and `last_sent` the most recent text
/// the user posted.
pub fn bot_text(
    activity: &InboundActivity,
    user_id: &str,
    last_sent: &str,
) -> Result<String, Skip> {
    if activity.kind != MESSAGE_KIND {
        return Err(Skip::NotAMessage);
    }
    match &activity.from {
        Some(from) if from.id != user_id => {}
        _ => return Err(Skip::SelfOriginated),
    }

    let text = match activity.display_text() {
        Some(text) if !text.is_empty() => text,
        _ => return Err(Skip::NoText),
    };

    if is_echo(text, last_sent) {
        return Err(Skip::Echo);
    }

    Ok(strip_citations(text).to_string())
}

/// The channel can replay the user's own words from a different originator.
pub fn is_echo(text: &str, last_sent: &str) -> bool {
    text.trim() == last_sent.trim()
}

/// Drops everything from the first `[` on, which is where citation markers
/// like `[1][2]` start.
pub fn strip_citations(text: &str) -> &str {
    match text.find('[') {
        Some(idx) => text[..idx].trim_end(),
        None => text,
    }
}
