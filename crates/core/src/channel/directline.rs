//! Bot Framework Direct Line v3 transport.
//!
//! A conversation is started with the session token. Inbound activities are
//! read from the conversation's WebSocket stream when the service offers one,
//! and polled over HTTP otherwise. A dropped stream is resumed from the last
//! watermark, and polling takes over when it cannot be. The conversation
//! token is refreshed in the background for as long as the channel is open.

use super::{ActivityFeed, ActivitySubscription, BotChannel, ChannelConnection, ChannelConnector, ChannelError};
use crate::activity::OutboundActivity;
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tokio::{net::TcpStream, sync::watch, time::Instant};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::protocol::Message as WsMessage,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

pub const DEFAULT_DOMAIN: &str = "https://directline.botframework.com/v3/directline";

/// Consecutive token rejections after which polling gives up.
pub const MAX_REJECTED_POLLS: u32 = 5;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_TOKEN_REFRESH: Duration = Duration::from_secs(15 * 60);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const MAX_RECONNECT_ATTEMPTS: u32 = 3;
const FEED_CAPACITY: usize = 64;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct Conversation {
    conversation_id: String,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    stream_url: Option<String>,
}

#[derive(Deserialize, Debug)]
struct RefreshedToken {
    token: String,
}

#[derive(Deserialize, Debug)]
struct ActivitySet {
    #[serde(default)]
    activities: Vec<Value>,
    #[serde(default)]
    watermark: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ResourceResponse {
    id: String,
}

#[derive(Clone, Copy, Debug)]
struct Timing {
    poll_interval: Duration,
    retry_delay: Duration,
    token_refresh: Duration,
}

/// Opens Direct Line conversations.
pub struct DirectLineConnector {
    http: reqwest::Client,
    domain: String,
    web_socket: bool,
    timing: Timing,
}

impl DirectLineConnector {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            domain: DEFAULT_DOMAIN.to_string(),
            web_socket: true,
            timing: Timing {
                poll_interval: DEFAULT_POLL_INTERVAL,
                retry_delay: DEFAULT_RETRY_DELAY,
                token_refresh: DEFAULT_TOKEN_REFRESH,
            },
        }
    }

    /// Points the connector at a regional or private Direct Line endpoint.
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into().trim_end_matches('/').to_string();
        self
    }

    /// Disables the WebSocket stream and always polls.
    pub fn with_web_socket(mut self, enabled: bool) -> Self {
        self.web_socket = enabled;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.timing.poll_interval = interval;
        self
    }

    /// First delay before resuming a dropped stream; doubles per attempt.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.timing.retry_delay = delay;
        self
    }

    /// How often the conversation token is renewed.
    pub fn with_token_refresh(mut self, interval: Duration) -> Self {
        self.timing.token_refresh = interval;
        self
    }
}

#[async_trait]
impl ChannelConnector for DirectLineConnector {
    #[instrument(name = "directline_connect", skip_all, fields(domain = %self.domain))]
    async fn connect(&self, token: &str) -> Result<ChannelConnection, ChannelError> {
        let conversation: Conversation = self
            .http
            .post(format!("{}/conversations", self.domain))
            .bearer_auth(token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        info!(conversation_id = %conversation.conversation_id, "Direct Line conversation started");

        let (token_tx, token_rx) =
            watch::channel(conversation.token.unwrap_or_else(|| token.to_string()));
        let link = Arc::new(ConversationLink {
            http: self.http.clone(),
            domain: self.domain.clone(),
            conversation_id: conversation.conversation_id,
            token: token_rx,
        });
        let (feed, subscription) = ActivitySubscription::channel(FEED_CAPACITY);

        let socket = match conversation.stream_url.filter(|_| self.web_socket) {
            Some(stream_url) => match open_stream(&stream_url).await {
                Ok(socket) => Some(socket),
                Err(e) => {
                    warn!(error = %e, "Direct Line stream unavailable, falling back to polling");
                    None
                }
            },
            None => None,
        };

        tokio::spawn(refresh_token(
            link.clone(),
            token_tx,
            self.timing.token_refresh,
            subscription.cancel_token(),
        ));
        tokio::spawn(read_activities(link.clone(), socket, self.timing, feed));

        let channel = DirectLineChannel {
            link,
            reader: subscription.cancel_token(),
        };
        Ok(ChannelConnection {
            channel: Arc::new(channel),
            activities: subscription,
        })
    }
}

/// What every task of one conversation needs to reach it.
struct ConversationLink {
    http: reqwest::Client,
    domain: String,
    conversation_id: String,
    /// Latest conversation token; replaced on every refresh.
    token: watch::Receiver<String>,
}

impl ConversationLink {
    fn token(&self) -> String {
        self.token.borrow().clone()
    }

    fn conversation_url(&self) -> String {
        format!("{}/conversations/{}", self.domain, self.conversation_id)
    }

    fn activities_url(&self) -> String {
        format!("{}/activities", self.conversation_url())
    }

    async fn fetch_activities(&self, watermark: Option<&str>) -> Result<ActivitySet, ChannelError> {
        let mut request = self.http.get(self.activities_url()).bearer_auth(self.token());
        if let Some(watermark) = watermark {
            request = request.query(&[("watermark", watermark)]);
        }
        Ok(request.send().await?.error_for_status()?.json().await?)
    }

    /// Asks for a fresh stream URL that resumes after `watermark`.
    async fn resume_stream(&self, watermark: Option<&str>) -> Result<Socket, ChannelError> {
        let mut request = self.http.get(self.conversation_url()).bearer_auth(self.token());
        if let Some(watermark) = watermark {
            request = request.query(&[("watermark", watermark)]);
        }
        let conversation: Conversation = request.send().await?.error_for_status()?.json().await?;
        let stream_url = conversation.stream_url.ok_or(ChannelError::Closed)?;
        open_stream(&stream_url).await
    }

    async fn renew_token(&self) -> Result<String, ChannelError> {
        let refreshed: RefreshedToken = self
            .http
            .post(format!("{}/tokens/refresh", self.domain))
            .bearer_auth(self.token())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(refreshed.token)
    }
}

async fn open_stream(url: &str) -> Result<Socket, ChannelError> {
    let (socket, _) = connect_async(url).await?;
    debug!("Direct Line stream connected");
    Ok(socket)
}

/// The posting half of a Direct Line conversation.
pub struct DirectLineChannel {
    link: Arc<ConversationLink>,
    reader: CancellationToken,
}

#[async_trait]
impl BotChannel for DirectLineChannel {
    async fn post_activity(&self, activity: &OutboundActivity) -> Result<String, ChannelError> {
        if self.reader.is_cancelled() {
            return Err(ChannelError::Closed);
        }
        let response: ResourceResponse = self
            .link
            .http
            .post(self.link.activities_url())
            .bearer_auth(self.link.token())
            .json(activity)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.id)
    }

    fn end(&self) {
        self.reader.cancel();
    }
}

async fn refresh_token(
    link: Arc<ConversationLink>,
    token: watch::Sender<String>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match link.renew_token().await {
            Ok(fresh) => {
                token.send_replace(fresh);
                debug!("Direct Line token refreshed");
            }
            Err(e) => warn!(error = %e, "Direct Line token refresh failed"),
        }
    }
}

/// Forwards every activity of one `{activities, watermark}` payload and
/// records its watermark. Returns `false` when the subscriber has gone away.
async fn forward_set(feed: &ActivityFeed, payload: &str, watermark: &mut Option<String>) -> bool {
    // Empty frames are keep-alives.
    if payload.trim().is_empty() {
        return true;
    }
    match serde_json::from_str::<ActivitySet>(payload) {
        Ok(set) => deliver(feed, set, watermark).await,
        Err(e) => feed.send(Err(e.into())).await,
    }
}

async fn deliver(feed: &ActivityFeed, set: ActivitySet, watermark: &mut Option<String>) -> bool {
    if set.watermark.is_some() {
        *watermark = set.watermark;
    }
    for activity in set.activities {
        if !feed.send(Ok(activity)).await {
            return false;
        }
    }
    true
}

enum StreamEnd {
    /// The subscriber went away or the channel was ended.
    Stopped,
    /// The server closed the stream or it broke.
    Dropped,
}

async fn read_activities(
    link: Arc<ConversationLink>,
    socket: Option<Socket>,
    timing: Timing,
    feed: ActivityFeed,
) {
    let mut watermark = None;
    let mut socket = socket;
    while let Some(stream) = socket.take() {
        if let StreamEnd::Stopped = read_stream(stream, &feed, &mut watermark).await {
            return;
        }
        socket = reconnect(&link, watermark.as_deref(), timing.retry_delay, &feed).await;
        if feed.is_cancelled() {
            return;
        }
        if socket.is_none() {
            warn!("Direct Line stream could not be resumed, falling back to polling");
        }
    }
    poll_activities(&link, watermark, timing.poll_interval, &feed).await;
}

async fn read_stream(
    mut socket: Socket,
    feed: &ActivityFeed,
    watermark: &mut Option<String>,
) -> StreamEnd {
    loop {
        tokio::select! {
            _ = feed.cancelled() => {
                let _ = socket.close(None).await;
                return StreamEnd::Stopped;
            }
            frame = socket.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    if !forward_set(feed, &text, watermark).await {
                        let _ = socket.close(None).await;
                        return StreamEnd::Stopped;
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => {
                    info!("Direct Line stream closed by server");
                    return StreamEnd::Dropped;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "Direct Line stream failed");
                    return StreamEnd::Dropped;
                }
            }
        }
    }
}

async fn reconnect(
    link: &ConversationLink,
    watermark: Option<&str>,
    retry_delay: Duration,
    feed: &ActivityFeed,
) -> Option<Socket> {
    let mut delay = retry_delay;
    for attempt in 1..=MAX_RECONNECT_ATTEMPTS {
        tokio::select! {
            _ = feed.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }
        match link.resume_stream(watermark).await {
            Ok(socket) => {
                info!(attempt, "Direct Line stream resumed");
                return Some(socket);
            }
            Err(e) => warn!(attempt, error = %e, "Direct Line stream resume failed"),
        }
        delay = (delay * 2).min(MAX_BACKOFF);
    }
    None
}

/// Polls for activities until the subscriber goes away or the token keeps
/// being rejected. Failures back off exponentially; only the first failure
/// of a run is reported to the subscriber.
async fn poll_activities(
    link: &ConversationLink,
    mut watermark: Option<String>,
    interval: Duration,
    feed: &ActivityFeed,
) {
    debug!(?interval, "Polling Direct Line for activities");
    let mut delay = interval;
    let mut failures = 0u32;
    let mut rejections = 0u32;
    while !feed.is_cancelled() {
        match link.fetch_activities(watermark.as_deref()).await {
            Ok(set) => {
                failures = 0;
                rejections = 0;
                delay = interval;
                if !deliver(feed, set, &mut watermark).await {
                    return;
                }
            }
            Err(e) => {
                failures += 1;
                if e.is_token_rejected() {
                    rejections += 1;
                } else {
                    rejections = 0;
                }
                if rejections >= MAX_REJECTED_POLLS {
                    error!(error = %e, "Direct Line keeps rejecting the token, stopping");
                    return;
                }
                if failures == 1 {
                    warn!(error = %e, "Direct Line poll failed");
                    if !feed.send(Err(e)).await {
                        return;
                    }
                } else {
                    debug!(failures, error = %e, "Direct Line poll still failing");
                }
                delay = (delay * 2).min(MAX_BACKOFF);
            }
        }
        tokio::select! {
            _ = feed.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
