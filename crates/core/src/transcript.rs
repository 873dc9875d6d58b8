//! The append-only conversation transcript.

use serde::Serialize;
use std::fmt;

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    User,
    Bot,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::User => write!(f, "user"),
            Origin::Bot => write!(f, "bot"),
        }
    }
}

/// A single transcript entry. Never mutated once appended.
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: u64,
    pub origin: Origin,
    pub text: String,
}

/// Messages in arrival order. Ids increase monotonically within a session.
#[derive(Debug, Default)]
pub struct Transcript {
    messages: Vec<Message>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a message and returns a copy of the stored entry.
    pub fn push(&mut self, origin: Origin, text: impl Into<String>) -> Message {
        let message = Message {
            id: self.messages.len() as u64 + 1,
            origin,
            text: text.into(),
        };
        self.messages.push(message.clone());
        message
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn count(&self, origin: Origin) -> usize {
        self.messages.iter().filter(|m| m.origin == origin).count()
    }
}
