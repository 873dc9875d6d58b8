//! Speech-to-text through an external command.
//!
//! The command records one utterance and prints the transcript on stdout.
//! Arguments may contain `{locale}`, which is replaced with the configured
//! locale before spawning.

use super::{RecognitionEvent, SpeechError, SpeechRecognizer};
use std::process::Stdio;
use tokio::{process::Command, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct CommandRecognizer {
    program: String,
    args: Vec<String>,
    locale: String,
    current: Option<CancellationToken>,
}

impl CommandRecognizer {
    pub fn new(program: impl Into<String>, args: Vec<String>, locale: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args,
            locale: locale.into(),
            current: None,
        }
    }

    /// Builds a recognizer from a whitespace separated command line.
    /// Returns `None` for an empty command line.
    pub fn from_command_line(command_line: &str, locale: impl Into<String>) -> Option<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect(), locale))
    }

    fn resolved_args(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| arg.replace("{locale}", &self.locale))
            .collect()
    }
}

/// The transcript is the first non-empty line the command prints.
fn first_transcript(stdout: &[u8]) -> Option<String> {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

impl SpeechRecognizer for CommandRecognizer {
    fn start(&mut self, events: mpsc::UnboundedSender<RecognitionEvent>) -> Result<(), SpeechError> {
        if self.current.as_ref().is_some_and(|t| !t.is_cancelled()) {
            return Err(SpeechError::AlreadyCapturing);
        }

        let child = Command::new(&self.program)
            .args(self.resolved_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SpeechError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        info!(program = %self.program, "Speech capture started");

        let token = CancellationToken::new();
        self.current = Some(token.clone());
        let program = self.program.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Speech capture stopped");
                }
                output = child.wait_with_output() => {
                    match output {
                        Ok(output) if output.status.success() => {
                            if let Some(text) = first_transcript(&output.stdout) {
                                let _ = events.send(RecognitionEvent::Result(text));
                            }
                        }
                        Ok(output) => {
                            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                            let _ = events.send(RecognitionEvent::Error(
                                SpeechError::Failed(program, stderr).to_string(),
                            ));
                        }
                        Err(e) => {
                            let _ = events.send(RecognitionEvent::Error(e.to_string()));
                        }
                    }
                }
            }
            token.cancel();
            let _ = events.send(RecognitionEvent::End);
        });
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(token) = self.current.take() {
            token.cancel();
        }
    }
}

impl Drop for CommandRecognizer {
    fn drop(&mut self) {
        self.stop();
    }
}
