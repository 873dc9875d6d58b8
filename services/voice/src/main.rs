//! Terminal front-end for a Copilot Studio bot.
//!
//! Mounts one conversation session, sends typed lines to the bot, toggles
//! speech capture with `/mic` and prints the transcript to stdout. Logs go to
//! stderr.

mod args;
mod input;
mod render;

use anyhow::Context;
use clap::Parser;
use copilot_voice_core::{
    ConversationSession, SessionDeps, SessionEvent, SessionHost,
    channel::directline::DirectLineConnector,
    speech::{
        SpeechRecognizer, SpeechSynthesizer, command::CommandRecognizer,
        espeak::EspeakSynthesizer,
    },
    token::ProxyTokenSource,
};
use std::{sync::Arc, time::Duration};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    args::Args,
    input::{Input, parse_line},
};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

fn build_deps(args: &Args) -> anyhow::Result<SessionDeps> {
    let locale = args.locale.as_str();
    let http = reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .context("Failed to build HTTP client")?;

    let mut connector = DirectLineConnector::new(http.clone());
    if let Some(domain) = &args.directline_domain {
        connector = connector.with_domain(domain.as_str());
    }

    let recognizer = match args.stt_command.as_deref() {
        Some(command_line) => {
            let recognizer = CommandRecognizer::from_command_line(command_line, locale)
                .context("--stt-command is empty")?;
            Some(Box::new(recognizer) as Box<dyn SpeechRecognizer>)
        }
        None => None,
    };

    let synthesizer = (!args.no_speech)
        .then(|| Arc::new(EspeakSynthesizer::new(locale)) as Arc<dyn SpeechSynthesizer>);

    Ok(SessionDeps {
        tokens: Arc::new(ProxyTokenSource::new(http, args.token_url.trim())),
        connector: Arc::new(connector),
        recognizer,
        synthesizer,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();

    let config = args.session_config();
    let deps = build_deps(&args)?;
    if deps.recognizer.is_none() {
        info!("No --stt-command configured; /mic is unavailable");
    }

    let (events_tx, mut events) = mpsc::unbounded_channel::<SessionEvent>();
    let session = ConversationSession::new(config, deps, events_tx);
    info!(user_id = %session.user_id(), "Mounting session");

    let mut host = SessionHost::new();
    host.mount(session).await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read from stdin")? else {
                    break;
                };
                let Some(handle) = host.live() else {
                    break;
                };
                let delivered = match parse_line(&line) {
                    Input::Send(text) => handle.send(text).await,
                    Input::ToggleCapture => handle.toggle_capture().await,
                    Input::Quit => break,
                    Input::Nothing => true,
                };
                if !delivered {
                    warn!("Session has stopped");
                    break;
                }
            }
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                if let Some(line) = render::render(&event) {
                    println!("{line}");
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    host.unmount().await;
    info!("Session closed");
    Ok(())
}
