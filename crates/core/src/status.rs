//! Session Status State Machine
//!
//! The status of a conversation session is a closed type. Connection progress
//! is the outer state; voice activity (listening, speaking, capture failures)
//! only exists inside `Ready`, so a session that never connected cannot be
//! listening or speaking.

use serde::Serialize;
use std::fmt;

/// Voice activity layered on top of a connected session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum VoiceActivity {
    #[default]
    Quiet,
    Listening,
    Speaking,
    RecognitionError,
}

/// The lifecycle status of a single conversation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case", tag = "state", content = "voice")]
pub enum SessionStatus {
    #[default]
    Idle,
    FetchingToken,
    Connecting,
    Ready(VoiceActivity),
    NeedTokenUrl,
    DlError,
}

/// Everything that can move a session from one status to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEvent {
    BeginTokenFetch,
    TokenUrlMissing,
    TokenAcquired,
    ChannelOpened,
    ConnectFailed,
    /// The open channel stopped delivering activities.
    ChannelLost,
    CaptureStarted,
    CaptureStopped,
    CaptureFailed,
    SpeechStarted,
    SpeechEnded,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal status transition: {event:?} while {from}")]
pub struct StatusError {
    pub from: SessionStatus,
    pub event: StatusEvent,
}

impl SessionStatus {
    /// Applies `event` and returns the next status.
    ///
    /// Events that make no sense in the current status are rejected; the
    /// caller keeps its previous status in that case.
    pub fn transition(self, event: StatusEvent) -> Result<SessionStatus, StatusError> {
        use SessionStatus::*;
        use StatusEvent::*;
        use VoiceActivity::*;

        let next = match (self, event) {
            (Idle, BeginTokenFetch) => FetchingToken,
            (FetchingToken, TokenUrlMissing) => NeedTokenUrl,
            (FetchingToken, TokenAcquired) => Connecting,
            (FetchingToken | Connecting, ConnectFailed) => DlError,
            (Connecting, ChannelOpened) => Ready(Quiet),
            (Ready(_), ChannelLost) => DlError,

            (Ready(_), CaptureStarted) => Ready(Listening),
            // Stopping only clears an active capture; a reported failure stays visible.
            (Ready(Listening), CaptureStopped) => Ready(Quiet),
            (Ready(voice), CaptureStopped) => Ready(voice),
            (Ready(_), CaptureFailed) => Ready(RecognitionError),

            (Ready(_), SpeechStarted) => Ready(Speaking),
            (Ready(Speaking), SpeechEnded) => Ready(Quiet),
            (Ready(voice), SpeechEnded) => Ready(voice),

            (from, event) => return Err(StatusError { from, event }),
        };
        Ok(next)
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, SessionStatus::Ready(_))
    }

    /// The short label shown to the user.
    pub fn label(&self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::FetchingToken => "fetching-token",
            SessionStatus::Connecting => "connecting",
            SessionStatus::Ready(VoiceActivity::Quiet) => "ready",
            SessionStatus::Ready(VoiceActivity::Listening) => "listening",
            SessionStatus::Ready(VoiceActivity::Speaking) => "speaking",
            SessionStatus::Ready(VoiceActivity::RecognitionError) => "recognition-error",
            SessionStatus::NeedTokenUrl => "need-token-url",
            SessionStatus::DlError => "dl-error",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
