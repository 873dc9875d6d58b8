//! Speech capture and synthesis seams.
//!
//! The session only sees two traits. Concrete engines live in submodules:
//!
//! - `command`: speech-to-text through an external command.
//! - `espeak`: text-to-speech through `espeak-ng`.

pub mod command;
pub mod espeak;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Locale the speech engines use unless told otherwise.
pub const DEFAULT_LOCALE: &str = "en-US";

#[derive(Debug, thiserror::Error)]
pub enum SpeechError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("{0} exited with an error: {1}")]
    Failed(String, String),
    #[error("speech I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("capture is already running")]
    AlreadyCapturing,
}

/// Notifications from a running capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionEvent {
    /// A final transcript of what the user said.
    Result(String),
    /// Capture failed; no further results will arrive for this capture.
    Error(String),
    /// Capture finished (silence, timeout or an explicit stop).
    End,
}

/// Single-shot, non-interim speech-to-text.
pub trait SpeechRecognizer: Send {
    /// Starts one capture, reporting through `events`. Every capture gets a
    /// fresh sender; the caller stops listening to it once the capture ends.
    fn start(&mut self, events: mpsc::UnboundedSender<RecognitionEvent>) -> Result<(), SpeechError>;

    /// Stops the current capture, if any. Whatever the stopped capture still
    /// reports goes to its own sender and may be dropped.
    fn stop(&mut self);
}

/// Text-to-speech. The returned future resolves when the utterance has been
/// played; dropping it must silence the utterance.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn speak(&self, text: &str) -> Result<(), SpeechError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechEvent {
    Started,
    Ended,
}

/// Plays at most one utterance at a time. A new utterance cancels the one
/// in flight, which then reports nothing.
pub struct Speaker {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    events: mpsc::UnboundedSender<SpeechEvent>,
    current: Option<CancellationToken>,
}

impl Speaker {
    pub fn new(
        synthesizer: Arc<dyn SpeechSynthesizer>,
        events: mpsc::UnboundedSender<SpeechEvent>,
    ) -> Self {
        Self {
            synthesizer,
            events,
            current: None,
        }
    }

    pub fn speak(&mut self, text: &str) {
        self.cancel();
        if text.trim().is_empty() {
            return;
        }

        let token = CancellationToken::new();
        self.current = Some(token.clone());
        let synthesizer = self.synthesizer.clone();
        let events = self.events.clone();
        let text = text.to_string();

        tokio::spawn(async move {
            if token.is_cancelled() {
                return;
            }
            let _ = events.send(SpeechEvent::Started);
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Utterance preempted");
                }
                result = synthesizer.speak(&text) => {
                    if let Err(e) = result {
                        warn!(error = %e, "Speech synthesis failed");
                    }
                    let _ = events.send(SpeechEvent::Ended);
                }
            }
        });
    }

    /// Silences the utterance in flight, if any.
    pub fn cancel(&mut self) {
        if let Some(token) = self.current.take() {
            token.cancel();
        }
    }
}

impl Drop for Speaker {
    fn drop(&mut self) {
        self.cancel();
    }
}
