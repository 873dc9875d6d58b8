//! Text-to-speech through the system `espeak-ng` binary.

use super::{SpeechError, SpeechSynthesizer};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;

/// Longest text handed to the engine in one utterance.
const MAX_UTTERANCE_BYTES: usize = 4096;

pub struct EspeakSynthesizer {
    program: String,
    voice: String,
}

impl EspeakSynthesizer {
    /// Creates a synthesizer speaking with the voice matching `locale`
    /// (e.g. `en-US` selects `en-us`).
    pub fn new(locale: &str) -> Self {
        Self {
            program: "espeak-ng".to_string(),
            voice: voice_for_locale(locale),
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }
}

fn voice_for_locale(locale: &str) -> String {
    locale.trim().replace('_', "-").to_lowercase()
}

/// Cuts `text` to at most `max` bytes on a character boundary.
fn clamp(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[async_trait]
impl SpeechSynthesizer for EspeakSynthesizer {
    async fn speak(&self, text: &str) -> Result<(), SpeechError> {
        let child = Command::new(&self.program)
            .arg("-v")
            .arg(&self.voice)
            .arg("--")
            .arg(clamp(text, MAX_UTTERANCE_BYTES))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            // Dropping the future (a newer utterance) silences this one.
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SpeechError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(SpeechError::Failed(self.program.clone(), stderr));
        }
        Ok(())
    }
}
