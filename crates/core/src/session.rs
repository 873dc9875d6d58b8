//! Conversation Session Manager
//!
//! A `ConversationSession` owns everything a single conversation needs: the
//! local user identity, the bot channel, the transcript, speech capture and
//! speech playback. All of it is driven from one task by [`ConversationSession::run`],
//! so session state is never shared and needs no locks. The UI talks to the
//! running session through a [`SessionHandle`] and listens to [`SessionEvent`]s.

use crate::{
    activity::{InboundActivity, OutboundActivity},
    channel::{ActivitySubscription, BotChannel, ChannelConnection, ChannelConnector, ChannelError, InboundItem},
    config::SessionConfig,
    filter,
    speech::{RecognitionEvent, Speaker, SpeechEvent, SpeechRecognizer, SpeechSynthesizer},
    status::{SessionStatus, StatusError, StatusEvent},
    token::{TokenError, TokenSource},
    transcript::{Message, Origin, Transcript},
};
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

/// Shown in place of a bot reply when a message is sent without a channel.
pub const NOT_CONNECTED_TEXT: &str = "Sorry, bot not connected.";

pub const RECOGNITION_UNAVAILABLE_NOTICE: &str =
    "Speech recognition is not available. Configure a speech-to-text command to use the microphone.";

pub const NOT_READY_NOTICE: &str = "Speech capture is available once the bot is connected.";

const COMMAND_CAPACITY: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("token endpoint is not configured")]
    NeedTokenUrl,
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Status(#[from] StatusError),
    #[error("session was closed before it finished starting")]
    Cancelled,
}

/// Requests from the UI to a running session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    Send(String),
    ToggleCapture,
}

/// Everything the UI needs to render the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Status(SessionStatus),
    Message(Message),
    /// Typing indicator: a user message is out and no bot reply has arrived yet.
    AwaitingReply(bool),
    /// A user-visible notice that is not part of the transcript.
    Notice(String),
}

/// The collaborators a session is built from.
pub struct SessionDeps {
    pub tokens: Arc<dyn TokenSource>,
    pub connector: Arc<dyn ChannelConnector>,
    pub recognizer: Option<Box<dyn SpeechRecognizer>>,
    pub synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
}

/// Result of one asynchronous start-up step.
pub enum StartOutcome {
    Token(Result<String, TokenError>),
    Channel(Result<ChannelConnection, ChannelError>),
    Cancelled,
}

/// A pending start-up step. Each step observes the session's cancellation token.
pub type StartStep = BoxFuture<'static, StartOutcome>;

pub struct ConversationSession {
    config: SessionConfig,
    user_id: String,
    status: SessionStatus,
    transcript: Transcript,
    last_sent: String,
    awaiting_reply: bool,

    tokens: Arc<dyn TokenSource>,
    connector: Arc<dyn ChannelConnector>,
    channel: Option<Arc<dyn BotChannel>>,
    activities: Option<ActivitySubscription>,

    recognizer: Option<Box<dyn SpeechRecognizer>>,
    capturing: bool,
    /// Events of the current capture. Each capture gets its own channel, so
    /// late events from a stopped capture are never seen.
    recognition: Option<mpsc::UnboundedReceiver<RecognitionEvent>>,
    speaker: Option<Speaker>,
    speech_rx: mpsc::UnboundedReceiver<SpeechEvent>,

    events: mpsc::UnboundedSender<SessionEvent>,
    cancel: CancellationToken,
    closed: bool,
}

impl ConversationSession {
    pub fn new(
        config: SessionConfig,
        deps: SessionDeps,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let (speech_tx, speech_rx) = mpsc::unbounded_channel();
        let speaker = deps
            .synthesizer
            .map(|synthesizer| Speaker::new(synthesizer, speech_tx));

        Self {
            config,
            user_id: format!("user_{}", rand::random_range(0..1_000_000u32)),
            status: SessionStatus::default(),
            transcript: Transcript::new(),
            last_sent: String::new(),
            awaiting_reply: false,
            tokens: deps.tokens,
            connector: deps.connector,
            channel: None,
            activities: None,
            recognizer: deps.recognizer,
            capturing: false,
            recognition: None,
            speaker,
            speech_rx,
            events,
            cancel: CancellationToken::new(),
            closed: false,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Cancelling this token aborts a pending start and stops [`run`](Self::run).
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    // --- Start-up ---

    /// Acquires a token, opens the channel and subscribes to inbound activities.
    #[instrument(name = "session_start", skip_all, fields(user_id = %self.user_id))]
    pub async fn start(&mut self) -> Result<(), SessionError> {
        let mut step = self.begin_start()?;
        loop {
            let outcome = step.await;
            match self.advance_start(outcome)? {
                Some(next) => step = next,
                None => return Ok(()),
            }
        }
    }

    /// Moves to `fetching-token` and returns the token request, or stops at
    /// `need-token-url` when there is nowhere to ask.
    pub fn begin_start(&mut self) -> Result<StartStep, SessionError> {
        if self.closed {
            return Err(SessionError::Cancelled);
        }
        self.apply(StatusEvent::BeginTokenFetch)?;

        if !self.config.has_token_url() {
            error!(token_url = %self.config.token_url, "Token URL is not configured");
            self.apply(StatusEvent::TokenUrlMissing)?;
            return Err(SessionError::NeedTokenUrl);
        }

        let tokens = self.tokens.clone();
        let cancel = self.cancel.clone();
        Ok(Box::pin(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => StartOutcome::Cancelled,
                result = tokens.fetch_token() => StartOutcome::Token(result),
            }
        }))
    }

    /// Applies the outcome of a start-up step. Returns the next step, or
    /// `None` once the session is ready.
    pub fn advance_start(&mut self, outcome: StartOutcome) -> Result<Option<StartStep>, SessionError> {
        if self.closed {
            if let StartOutcome::Channel(Ok(connection)) = outcome {
                connection.channel.end();
            }
            return Err(SessionError::Cancelled);
        }

        match outcome {
            StartOutcome::Token(Ok(token)) => {
                self.apply(StatusEvent::TokenAcquired)?;
                let connector = self.connector.clone();
                let cancel = self.cancel.clone();
                Ok(Some(Box::pin(async move {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => StartOutcome::Cancelled,
                        result = connector.connect(&token) => StartOutcome::Channel(result),
                    }
                })))
            }
            StartOutcome::Channel(Ok(connection)) => {
                self.channel = Some(connection.channel);
                self.activities = Some(connection.activities);
                self.apply(StatusEvent::ChannelOpened)?;
                info!("Bot channel ready");
                Ok(None)
            }
            StartOutcome::Token(Err(e)) => {
                error!(error = %e, "Failed to acquire a session token");
                self.apply(StatusEvent::ConnectFailed)?;
                Err(e.into())
            }
            StartOutcome::Channel(Err(e)) => {
                error!(error = %e, "Failed to open the bot channel");
                self.apply(StatusEvent::ConnectFailed)?;
                Err(e.into())
            }
            StartOutcome::Cancelled => Err(SessionError::Cancelled),
        }
    }

    // --- Inbound ---

    /// Runs one inbound item through the filter pipeline. Errors only affect
    /// the item itself.
    pub fn handle_inbound(&mut self, item: InboundItem) {
        if self.closed {
            return;
        }
        let value = match item {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "Bot channel reported an error");
                return;
            }
        };
        let activity = match InboundActivity::from_value(value) {
            Ok(activity) => activity,
            Err(e) => {
                warn!(error = %e, "Skipping malformed activity");
                return;
            }
        };

        match filter::bot_text(&activity, &self.user_id, &self.last_sent) {
            Ok(text) => {
                self.append(Origin::Bot, text.clone());
                self.set_awaiting_reply(false);
                self.speak_text(&text);
            }
            Err(skip) => debug!(?skip, kind = %activity.kind, "Activity skipped"),
        }
    }

    // --- Outbound ---

    /// Appends the user's message and posts it to the bot. Without a channel
    /// the post is skipped and a canned reply is shown instead.
    pub fn post_user_message(&mut self, text: &str) {
        if self.closed || text.trim().is_empty() {
            return;
        }
        self.append(Origin::User, text);
        self.last_sent = text.to_string();

        let Some(channel) = self.channel.clone() else {
            warn!("Bot channel not connected; message not sent");
            self.append(Origin::Bot, NOT_CONNECTED_TEXT);
            return;
        };

        let activity = OutboundActivity::message(&self.user_id, &self.config.user_name, text);
        self.set_awaiting_reply(true);
        tokio::spawn(async move {
            match channel.post_activity(&activity).await {
                Ok(id) => debug!(activity_id = %id, "Activity posted"),
                Err(e) => error!(error = %e, "Failed to post activity"),
            }
        });
    }

    // --- Speech ---

    /// Starts or stops speech capture.
    pub fn toggle_capture(&mut self) {
        if self.closed {
            return;
        }
        if self.recognizer.is_none() {
            warn!("Speech recognition not available");
            self.notice(RECOGNITION_UNAVAILABLE_NOTICE);
            return;
        }

        if self.capturing {
            self.stop_capture();
            let _ = self.apply(StatusEvent::CaptureStopped);
            return;
        }

        if !self.status.is_ready() {
            self.notice(NOT_READY_NOTICE);
            return;
        }

        let (events, recognition) = mpsc::unbounded_channel();
        let started = match self.recognizer.as_mut() {
            Some(recognizer) => recognizer.start(events),
            None => return,
        };
        match started {
            Ok(()) => {
                self.capturing = true;
                self.recognition = Some(recognition);
                let _ = self.apply(StatusEvent::CaptureStarted);
            }
            Err(e) => {
                error!(error = %e, "Failed to start speech capture");
                self.capturing = false;
            }
        }
    }

    pub fn handle_recognition(&mut self, event: RecognitionEvent) {
        if self.closed {
            return;
        }
        match event {
            RecognitionEvent::Result(text) => self.post_user_message(&text),
            RecognitionEvent::Error(message) => {
                error!(error = %message, "Speech recognition error");
                self.stop_capture();
                let _ = self.apply(StatusEvent::CaptureFailed);
            }
            RecognitionEvent::End => self.capture_ended(),
        }
    }

    fn capture_ended(&mut self) {
        self.capturing = false;
        self.recognition = None;
        let _ = self.apply(StatusEvent::CaptureStopped);
    }

    /// Speaks `text`, cutting off anything still playing. Silent no-op
    /// without a synthesizer.
    pub fn speak_text(&mut self, text: &str) {
        match self.speaker.as_mut() {
            Some(speaker) => speaker.speak(text),
            None => debug!("Speech synthesis not available"),
        }
    }

    pub fn handle_speech(&mut self, event: SpeechEvent) {
        if self.closed {
            return;
        }
        let _ = match event {
            SpeechEvent::Started => self.apply(StatusEvent::SpeechStarted),
            SpeechEvent::Ended => self.apply(StatusEvent::SpeechEnded),
        };
    }

    /// The channel stopped delivering activities for good. Later messages
    /// get the disconnected reply.
    pub fn channel_lost(&mut self) {
        if self.closed {
            return;
        }
        warn!("Inbound activity stream ended");
        if let Some(mut activities) = self.activities.take() {
            activities.unsubscribe();
        }
        if let Some(channel) = self.channel.take() {
            channel.end();
        }
        self.stop_capture();
        self.set_awaiting_reply(false);
        let _ = self.apply(StatusEvent::ChannelLost);
    }

    // --- Teardown ---

    /// Tears the session down. Safe to call at any point and more than once.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.cancel.cancel();

        self.stop_capture();
        self.recognizer = None;

        if let Some(mut speaker) = self.speaker.take() {
            speaker.cancel();
        }
        if let Some(mut activities) = self.activities.take() {
            activities.unsubscribe();
        }
        if let Some(channel) = self.channel.take() {
            channel.end();
        }
        self.set_awaiting_reply(false);
        info!(user_id = %self.user_id, "Session closed");
    }

    // --- Event loop ---

    /// Starts the session and processes commands and inbound events until
    /// the command channel closes or the session is cancelled.
    pub async fn run(mut self, mut commands: mpsc::Receiver<SessionCommand>) {
        let mut pending = match self.begin_start() {
            Ok(step) => Some(step),
            Err(e) => {
                warn!(error = %e, "Session did not start");
                None
            }
        };

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                outcome = next_step(&mut pending) => {
                    pending = match self.advance_start(outcome) {
                        Ok(next) => next,
                        Err(e) => {
                            debug!(error = %e, "Session start ended without a channel");
                            None
                        }
                    };
                }
                command = commands.recv() => match command {
                    Some(SessionCommand::Send(text)) => self.post_user_message(&text),
                    Some(SessionCommand::ToggleCapture) => self.toggle_capture(),
                    None => break,
                },
                item = next_activity(&mut self.activities) => match item {
                    Some(item) => self.handle_inbound(item),
                    None => self.channel_lost(),
                },
                event = next_recognition(&mut self.recognition) => match event {
                    Some(event) => self.handle_recognition(event),
                    // The recognizer let go of the capture without saying so.
                    None => self.capture_ended(),
                },
                Some(event) = self.speech_rx.recv() => self.handle_speech(event),
            }
        }

        self.close();
    }

    /// Moves the session onto its own task.
    pub fn spawn(self) -> SessionHandle {
        let (commands, rx) = mpsc::channel(COMMAND_CAPACITY);
        let cancel = self.cancel.clone();
        let span = info_span!("conversation", user_id = %self.user_id);
        let task = tokio::spawn(self.run(rx).instrument(span));
        SessionHandle {
            commands,
            cancel,
            task: Some(task),
        }
    }

    // --- Helpers ---

    fn stop_capture(&mut self) {
        if self.capturing {
            if let Some(recognizer) = self.recognizer.as_mut() {
                recognizer.stop();
            }
        }
        self.capturing = false;
        self.recognition = None;
    }

    fn apply(&mut self, event: StatusEvent) -> Result<(), StatusError> {
        match self.status.transition(event) {
            Ok(next) => {
                if next != self.status {
                    debug!(from = %self.status, to = %next, "Status changed");
                    self.status = next;
                    self.emit(SessionEvent::Status(next));
                }
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Ignoring status event");
                Err(e)
            }
        }
    }

    fn append(&mut self, origin: Origin, text: impl Into<String>) {
        let message = self.transcript.push(origin, text);
        self.emit(SessionEvent::Message(message));
    }

    fn set_awaiting_reply(&mut self, awaiting: bool) {
        if self.awaiting_reply != awaiting {
            self.awaiting_reply = awaiting;
            self.emit(SessionEvent::AwaitingReply(awaiting));
        }
    }

    fn notice(&self, text: &str) {
        self.emit(SessionEvent::Notice(text.to_string()));
    }

    fn emit(&self, event: SessionEvent) {
        // The UI may already be gone during teardown.
        let _ = self.events.send(event);
    }
}

impl Drop for ConversationSession {
    fn drop(&mut self) {
        self.close();
    }
}

async fn next_step(pending: &mut Option<StartStep>) -> StartOutcome {
    match pending {
        Some(step) => step.await,
        None => std::future::pending().await,
    }
}

async fn next_recognition(
    recognition: &mut Option<mpsc::UnboundedReceiver<RecognitionEvent>>,
) -> Option<RecognitionEvent> {
    match recognition {
        Some(recognition) => recognition.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_activity(activities: &mut Option<ActivitySubscription>) -> Option<InboundItem> {
    match activities {
        Some(activities) => activities.next().await,
        None => std::future::pending().await,
    }
}

/// The UI's handle on a running session.
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    /// Queues a user message. Returns `false` once the session has stopped.
    pub async fn send(&self, text: impl Into<String>) -> bool {
        self.commands
            .send(SessionCommand::Send(text.into()))
            .await
            .is_ok()
    }

    pub async fn toggle_capture(&self) -> bool {
        self.commands.send(SessionCommand::ToggleCapture).await.is_ok()
    }

    pub fn is_live(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stops the session and waits for its teardown. Repeated calls return
    /// immediately.
    pub async fn unmount(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Session task did not shut down cleanly");
            }
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Holds the single live session of a front-end.
#[derive(Default)]
pub struct SessionHost {
    live: Option<SessionHandle>,
}

impl SessionHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts `session`, unmounting any session that is still live first.
    pub async fn mount(&mut self, session: ConversationSession) -> &SessionHandle {
        self.unmount().await;
        self.live.insert(session.spawn())
    }

    pub async fn unmount(&mut self) {
        if let Some(mut handle) = self.live.take() {
            handle.unmount().await;
        }
    }

    pub fn live(&self) -> Option<&SessionHandle> {
        self.live.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::{ActivityFeed, MockChannelConnector},
        speech::testing::{FakeRecognizer, RecordingSynthesizer},
        status::VoiceActivity,
        token::MockTokenSource,
    };
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Records posted activities and `end()` calls.
    struct FakeChannel {
        posted: mpsc::UnboundedSender<OutboundActivity>,
        ended: AtomicUsize,
    }

    #[async_trait]
    impl BotChannel for FakeChannel {
        async fn post_activity(&self, activity: &OutboundActivity) -> Result<String, ChannelError> {
            let _ = self.posted.send(activity.clone());
            Ok("activity-1".to_string())
        }

        fn end(&self) {
            self.ended.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// A token source that never answers.
    struct HangingTokens;

    #[async_trait]
    impl TokenSource for HangingTokens {
        async fn fetch_token(&self) -> Result<String, TokenError> {
            std::future::pending().await
        }
    }

    struct Harness {
        channel: Arc<FakeChannel>,
        posted: mpsc::UnboundedReceiver<OutboundActivity>,
        feed: Option<ActivityFeed>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        recognizer: FakeRecognizer,
        synthesizer: Arc<RecordingSynthesizer>,
    }

    impl Harness {
        fn drain(&mut self) -> Vec<SessionEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }
    }

    fn mocks_that_connect() -> (MockTokenSource, MockChannelConnector, Arc<FakeChannel>, mpsc::UnboundedReceiver<OutboundActivity>, ActivityFeed) {
        let (posted_tx, posted) = mpsc::unbounded_channel();
        let channel = Arc::new(FakeChannel {
            posted: posted_tx,
            ended: AtomicUsize::new(0),
        });
        let (feed, subscription) = ActivitySubscription::channel(16);

        let mut tokens = MockTokenSource::new();
        tokens
            .expect_fetch_token()
            .times(1)
            .returning(|| Ok("abc123".to_string()));

        let mut connector = MockChannelConnector::new();
        let connection = ChannelConnection {
            channel: channel.clone(),
            activities: subscription,
        };
        connector
            .expect_connect()
            .withf(|token| token.to_string() == "abc123")
            .times(1)
            .return_once(move |_| Ok(connection));

        (tokens, connector, channel, posted, feed)
    }

    fn build(
        config: SessionConfig,
        tokens: impl TokenSource + 'static,
        connector: impl ChannelConnector + 'static,
        with_recognizer: bool,
    ) -> (ConversationSession, mpsc::UnboundedReceiver<SessionEvent>, FakeRecognizer, Arc<RecordingSynthesizer>) {
        let recognizer = FakeRecognizer::default();
        let synthesizer = Arc::new(RecordingSynthesizer::default());
        let (events_tx, events) = mpsc::unbounded_channel();
        let deps = SessionDeps {
            tokens: Arc::new(tokens),
            connector: Arc::new(connector),
            recognizer: if with_recognizer {
                Some(Box::new(recognizer.clone()))
            } else {
                None
            },
            synthesizer: Some(synthesizer.clone()),
        };
        (
            ConversationSession::new(config, deps, events_tx),
            events,
            recognizer,
            synthesizer,
        )
    }

    async fn started_session() -> (ConversationSession, Harness) {
        let (tokens, connector, channel, posted, feed) = mocks_that_connect();
        let (mut session, events, recognizer, synthesizer) =
            build(SessionConfig::default(), tokens, connector, true);
        session.start().await.expect("session should start");
        let harness = Harness {
            channel,
            posted,
            feed: Some(feed),
            events,
            recognizer,
            synthesizer,
        };
        (session, harness)
    }

    fn bot_says(text: &str) -> InboundItem {
        Ok(json!({ "type": "message", "from": { "id": "copilot" }, "text": text }))
    }

    fn unused_tokens() -> MockTokenSource {
        let mut tokens = MockTokenSource::new();
        tokens.expect_fetch_token().never();
        tokens
    }

    fn unused_connector() -> MockChannelConnector {
        let mut connector = MockChannelConnector::new();
        connector.expect_connect().never();
        connector
    }

    #[tokio::test]
    async fn test_start_walks_to_ready() {
        let (session, mut harness) = started_session().await;

        assert_eq!(session.status(), SessionStatus::Ready(VoiceActivity::Quiet));
        assert!(session.is_connected());
        assert!(session.user_id().starts_with("user_"));
        assert_eq!(
            harness.drain(),
            vec![
                SessionEvent::Status(SessionStatus::FetchingToken),
                SessionEvent::Status(SessionStatus::Connecting),
                SessionEvent::Status(SessionStatus::Ready(VoiceActivity::Quiet)),
            ]
        );
    }

    #[tokio::test]
    async fn test_placeholder_token_url_needs_configuration() {
        let config = SessionConfig {
            token_url: "PASTE_YOUR_TOKEN_URL".to_string(),
            ..SessionConfig::default()
        };
        let (mut session, _events, _, _) = build(config, unused_tokens(), unused_connector(), true);

        let err = session.start().await.unwrap_err();
        assert!(matches!(err, SessionError::NeedTokenUrl));
        assert_eq!(session.status(), SessionStatus::NeedTokenUrl);
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_token_without_token_field_is_a_connect_failure() {
        let mut tokens = MockTokenSource::new();
        tokens
            .expect_fetch_token()
            .times(1)
            .returning(|| Err(TokenError::MissingToken("{}".to_string())));
        let (mut session, _events, _, _) =
            build(SessionConfig::default(), tokens, unused_connector(), true);

        let err = session.start().await.unwrap_err();
        assert!(matches!(err, SessionError::Token(TokenError::MissingToken(_))));
        assert_eq!(session.status(), SessionStatus::DlError);
    }

    #[tokio::test]
    async fn test_channel_open_failure_is_a_connect_failure() {
        let mut tokens = MockTokenSource::new();
        tokens
            .expect_fetch_token()
            .returning(|| Ok("abc123".to_string()));
        let mut connector = MockChannelConnector::new();
        connector
            .expect_connect()
            .times(1)
            .return_once(|_| Err(ChannelError::Closed));
        let (mut session, _events, _, _) = build(SessionConfig::default(), tokens, connector, true);

        assert!(matches!(
            session.start().await,
            Err(SessionError::Channel(ChannelError::Closed))
        ));
        assert_eq!(session.status(), SessionStatus::DlError);
    }

    #[tokio::test]
    async fn test_inbound_pipeline_appends_one_bot_message_per_eligible_activity() {
        let (mut session, _harness) = started_session().await;
        let own_id = session.user_id().to_string();

        session.handle_inbound(bot_says("Hello!"));
        session.handle_inbound(Ok(json!({ "type": "typing", "from": { "id": "copilot" } })));
        session.handle_inbound(Ok(json!({ "type": "message", "from": { "id": own_id }, "text": "me" })));
        session.handle_inbound(Ok(json!({ "text": "no type at all" })));
        session.handle_inbound(Err(ChannelError::Closed));
        session.handle_inbound(bot_says("Still here"));

        let texts: Vec<&str> = session
            .transcript()
            .messages()
            .iter()
            .map(|m| m.text.as_str())
            .collect();
        assert_eq!(texts, vec!["Hello!", "Still here"]);
        assert_eq!(session.transcript().count(Origin::Bot), 2);
    }

    #[tokio::test]
    async fn test_echo_of_last_sent_message_is_suppressed() {
        let (mut session, mut harness) = started_session().await;

        session.post_user_message("turn on the lights");
        session.handle_inbound(bot_says("turn on the lights"));

        let messages = session.transcript().messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].origin, Origin::User);

        let posted = harness.posted.recv().await.unwrap();
        assert_eq!(posted.text, "turn on the lights");
        assert_eq!(posted.from.id, session.user_id());
        assert_eq!(posted.from.name.as_deref(), Some("WebUser"));
    }

    #[tokio::test]
    async fn test_citations_are_stripped_before_display() {
        let (mut session, _harness) = started_session().await;
        session.handle_inbound(bot_says("The answer is 42 [1][2]"));
        assert_eq!(session.transcript().messages()[0].text, "The answer is 42");
    }

    #[tokio::test]
    async fn test_send_while_disconnected_shows_canned_reply() {
        let (mut session, mut events, _, _) =
            build(SessionConfig::default(), unused_tokens(), unused_connector(), true);

        session.post_user_message("hello?");

        let messages = session.transcript().messages();
        assert_eq!(messages.len(), 2);
        assert_eq!((messages[0].origin, messages[0].text.as_str()), (Origin::User, "hello?"));
        assert_eq!((messages[1].origin, messages[1].text.as_str()), (Origin::Bot, NOT_CONNECTED_TEXT));

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(!seen.contains(&SessionEvent::AwaitingReply(true)));
    }

    #[tokio::test]
    async fn test_blank_messages_are_ignored() {
        let (mut session, _harness) = started_session().await;
        session.post_user_message("   ");
        assert!(session.transcript().is_empty());
    }

    #[tokio::test]
    async fn test_typing_indicator_follows_reply() {
        let (mut session, mut harness) = started_session().await;
        harness.drain();

        session.post_user_message("what's the weather?");
        session.handle_inbound(bot_says("Sunny."));

        let indicator: Vec<SessionEvent> = harness
            .drain()
            .into_iter()
            .filter(|e| matches!(e, SessionEvent::AwaitingReply(_)))
            .collect();
        assert_eq!(
            indicator,
            vec![SessionEvent::AwaitingReply(true), SessionEvent::AwaitingReply(false)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_bot_messages_are_spoken() {
        let (mut session, harness) = started_session().await;
        session.handle_inbound(bot_says("Good morning [1]"));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(
            *harness.synthesizer.finished.lock().unwrap(),
            vec!["Good morning".to_string()]
        );
    }

    #[tokio::test]
    async fn test_speech_events_drive_status_overlay() {
        let (mut session, _harness) = started_session().await;
        session.handle_speech(SpeechEvent::Started);
        assert_eq!(session.status().label(), "speaking");
        session.handle_speech(SpeechEvent::Ended);
        assert_eq!(session.status().label(), "ready");
    }

    #[tokio::test]
    async fn test_toggle_capture_without_recognizer_shows_notice() {
        let (tokens, connector, _channel, _posted, _feed) = mocks_that_connect();
        let (mut session, mut events, _, _) = build(SessionConfig::default(), tokens, connector, false);
        session.start().await.unwrap();
        while events.try_recv().is_ok() {}

        session.toggle_capture();
        assert!(!session.is_capturing());
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::Notice(RECOGNITION_UNAVAILABLE_NOTICE.to_string())
        );
    }

    #[tokio::test]
    async fn test_toggle_capture_before_ready_is_refused() {
        let (mut session, mut events, recognizer, _) =
            build(SessionConfig::default(), unused_tokens(), unused_connector(), true);

        session.toggle_capture();
        assert!(!session.is_capturing());
        assert_eq!(*recognizer.starts.lock().unwrap(), 0);
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::Notice(NOT_READY_NOTICE.to_string())
        );
    }

    #[tokio::test]
    async fn test_capture_result_is_sent_like_typed_text() {
        let (mut session, mut harness) = started_session().await;

        session.toggle_capture();
        assert!(session.is_capturing());
        assert_eq!(session.status().label(), "listening");

        assert!(harness.recognizer.emit(RecognitionEvent::Result("book a table".to_string())));
        assert!(harness.recognizer.emit(RecognitionEvent::End));
        let result = next_recognition(&mut session.recognition).await.unwrap();
        session.handle_recognition(result);
        let end = next_recognition(&mut session.recognition).await.unwrap();
        session.handle_recognition(end);

        assert!(!session.is_capturing());
        assert_eq!(session.status().label(), "ready");
        assert_eq!(session.transcript().messages()[0].text, "book a table");
        assert_eq!(harness.posted.recv().await.unwrap().text, "book a table");
    }

    #[tokio::test]
    async fn test_capture_error_sets_recognition_error() {
        let (mut session, harness) = started_session().await;

        session.toggle_capture();
        session.handle_recognition(RecognitionEvent::Error("no-speech".to_string()));
        assert!(!session.is_capturing());
        assert_eq!(*harness.recognizer.stops.lock().unwrap(), 1);
        assert_eq!(session.status().label(), "recognition-error");

        // The end notification that follows keeps the error visible.
        session.handle_recognition(RecognitionEvent::End);
        assert_eq!(session.status().label(), "recognition-error");

        // Capture can be restarted by hand.
        session.toggle_capture();
        assert!(session.is_capturing());
        assert_eq!(session.status().label(), "listening");
    }

    #[tokio::test]
    async fn test_late_end_from_stopped_capture_is_ignored() {
        let (mut session, harness) = started_session().await;

        session.toggle_capture();
        let first_capture = harness.recognizer.sender.lock().unwrap().clone().unwrap();
        session.toggle_capture();
        session.toggle_capture();
        assert_eq!(*harness.recognizer.starts.lock().unwrap(), 2);

        // The first capture's end notification arrives after the restart.
        assert!(first_capture.send(RecognitionEvent::End).is_err());
        assert!(session.is_capturing());
        assert_eq!(session.status().label(), "listening");

        // The live capture can still be stopped.
        session.toggle_capture();
        assert!(!session.is_capturing());
        assert_eq!(*harness.recognizer.stops.lock().unwrap(), 2);
        assert_eq!(session.status().label(), "ready");
    }

    #[tokio::test]
    async fn test_running_session_ignores_late_end_from_stopped_capture() {
        let (tokens, connector, _channel, _posted, _feed) = mocks_that_connect();
        let (session, mut events, recognizer, _) = build(SessionConfig::default(), tokens, connector, true);
        let mut handle = session.spawn();
        loop {
            match events.recv().await.unwrap() {
                SessionEvent::Status(status) if status.is_ready() => break,
                _ => {}
            }
        }

        assert!(handle.toggle_capture().await);
        let listening = SessionEvent::Status(SessionStatus::Ready(VoiceActivity::Listening));
        let quiet = SessionEvent::Status(SessionStatus::Ready(VoiceActivity::Quiet));
        assert_eq!(events.recv().await.unwrap(), listening);
        let first_capture = recognizer.sender.lock().unwrap().clone().unwrap();

        assert!(handle.toggle_capture().await);
        assert_eq!(events.recv().await.unwrap(), quiet);
        assert!(handle.toggle_capture().await);
        assert_eq!(events.recv().await.unwrap(), listening);

        let _ = first_capture.send(RecognitionEvent::End);
        assert!(handle.toggle_capture().await);
        assert_eq!(events.recv().await.unwrap(), quiet);
        assert_eq!(*recognizer.starts.lock().unwrap(), 2);
        assert_eq!(*recognizer.stops.lock().unwrap(), 2);

        handle.unmount().await;
    }

    #[tokio::test]
    async fn test_lost_channel_reports_dl_error_and_disconnects() {
        let (mut session, mut harness) = started_session().await;
        session.toggle_capture();
        session.post_user_message("are you there?");
        harness.drain();

        session.channel_lost();

        assert_eq!(session.status(), SessionStatus::DlError);
        assert!(!session.is_connected());
        assert!(!session.is_capturing());
        assert_eq!(harness.channel.ended.load(Ordering::SeqCst), 1);
        assert_eq!(
            harness.drain(),
            vec![
                SessionEvent::AwaitingReply(false),
                SessionEvent::Status(SessionStatus::DlError),
            ]
        );

        session.post_user_message("hello?");
        let last = session.transcript().messages().last().unwrap();
        assert_eq!((last.origin, last.text.as_str()), (Origin::Bot, NOT_CONNECTED_TEXT));
    }

    #[tokio::test]
    async fn test_running_session_notices_when_the_feed_ends() {
        let (tokens, connector, _channel, _posted, feed) = mocks_that_connect();
        let (session, mut events, _, _) = build(SessionConfig::default(), tokens, connector, true);
        let mut handle = session.spawn();
        loop {
            match events.recv().await.unwrap() {
                SessionEvent::Status(status) if status.is_ready() => break,
                _ => {}
            }
        }

        drop(feed);
        loop {
            match events.recv().await.unwrap() {
                SessionEvent::Status(SessionStatus::DlError) => break,
                SessionEvent::Status(other) => panic!("unexpected status {other}"),
                _ => {}
            }
        }
        handle.unmount().await;
    }

    #[tokio::test]
    async fn test_empty_text_with_side_channel_text_is_shown() {
        let (mut session, _harness) = started_session().await;
        session.handle_inbound(Ok(json!({
            "type": "message",
            "from": { "id": "copilot" },
            "text": "",
            "channelData": { "text": "Side answer" }
        })));
        let messages = session.transcript().messages();
        assert_eq!(messages.len(), 1);
        assert_eq!((messages[0].origin, messages[0].text.as_str()), (Origin::Bot, "Side answer"));
    }

    #[tokio::test]
    async fn test_toggle_twice_stops_capture() {
        let (mut session, harness) = started_session().await;
        session.toggle_capture();
        session.toggle_capture();
        assert!(!session.is_capturing());
        assert_eq!(*harness.recognizer.starts.lock().unwrap(), 1);
        assert_eq!(*harness.recognizer.stops.lock().unwrap(), 1);
        assert_eq!(session.status().label(), "ready");
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_stops_capture() {
        let (mut session, mut harness) = started_session().await;
        session.toggle_capture();

        session.close();
        session.close();

        assert!(session.is_closed());
        assert!(!session.is_capturing());
        assert!(!session.is_connected());
        assert_eq!(*harness.recognizer.stops.lock().unwrap(), 1);
        assert_eq!(harness.channel.ended.load(Ordering::SeqCst), 1);
        // Recognition callbacks are detached.
        assert!(!harness.recognizer.emit(RecognitionEvent::End));
        // The inbound feed sees the unsubscription.
        let feed = harness.feed.take().unwrap();
        assert!(feed.is_cancelled());

        // Nothing is recorded after teardown.
        session.post_user_message("anyone?");
        session.handle_inbound(bot_says("late reply"));
        assert!(session.transcript().is_empty());
    }

    #[tokio::test]
    async fn test_close_before_ready_is_harmless() {
        let (mut session, _events, recognizer, _) =
            build(SessionConfig::default(), unused_tokens(), unused_connector(), true);
        session.close();
        session.close();
        assert!(session.is_closed());
        assert_eq!(*recognizer.stops.lock().unwrap(), 0);
        assert!(matches!(session.start().await, Err(SessionError::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancel_abandons_pending_token_fetch() {
        let (mut session, _events, _, _) =
            build(SessionConfig::default(), HangingTokens, unused_connector(), true);
        let cancel = session.cancel_token();

        let step = session.begin_start().unwrap();
        cancel.cancel();
        let outcome = step.await;

        assert!(matches!(
            session.advance_start(outcome),
            Err(SessionError::Cancelled)
        ));
        assert_eq!(session.status(), SessionStatus::FetchingToken);
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_running_session_round_trip() {
        let (tokens, connector, channel, mut posted, feed) = mocks_that_connect();
        let (session, mut events, _, _) = build(SessionConfig::default(), tokens, connector, true);
        let mut handle = session.spawn();

        // Wait for the channel to come up.
        loop {
            match events.recv().await.unwrap() {
                SessionEvent::Status(status) if status.is_ready() => break,
                _ => {}
            }
        }

        assert!(handle.send("hi bot").await);
        let activity = posted.recv().await.unwrap();
        assert_eq!(activity.text, "hi bot");

        assert!(feed.send(bot_says("hi human")).await);
        loop {
            match events.recv().await.unwrap() {
                SessionEvent::Message(message) if message.origin == Origin::Bot => {
                    assert_eq!(message.text, "hi human");
                    break;
                }
                _ => {}
            }
        }

        handle.unmount().await;
        handle.unmount().await;
        assert!(!handle.is_live());
        assert_eq!(channel.ended.load(Ordering::SeqCst), 1);
        assert!(!handle.send("too late").await);
    }

    #[tokio::test]
    async fn test_message_sent_while_connecting_gets_canned_reply() {
        let (session, mut events, _, _) =
            build(SessionConfig::default(), HangingTokens, unused_connector(), true);
        let mut handle = session.spawn();

        assert!(handle.send("are you there?").await);
        let mut messages = Vec::new();
        while messages.len() < 2 {
            if let SessionEvent::Message(message) = events.recv().await.unwrap() {
                messages.push(message);
            }
        }
        assert_eq!(messages[0].origin, Origin::User);
        assert_eq!(messages[1].text, NOT_CONNECTED_TEXT);

        handle.unmount().await;
    }

    #[tokio::test]
    async fn test_host_keeps_a_single_live_session() {
        let mut host = SessionHost::new();
        let (first, _first_events, _, _) =
            build(SessionConfig::default(), HangingTokens, unused_connector(), true);
        let (second, _second_events, _, _) =
            build(SessionConfig::default(), HangingTokens, unused_connector(), true);
        let first_cancel = first.cancel_token();

        host.mount(first).await;
        assert!(host.live().is_some());
        host.mount(second).await;
        assert!(first_cancel.is_cancelled());
        assert!(host.live().unwrap().is_live());

        host.unmount().await;
        host.unmount().await;
        assert!(host.live().is_none());
    }
}
