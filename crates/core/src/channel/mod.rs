//! Bidirectional transport to the bot backend.
//!
//! A connector turns a session token into a [`ChannelConnection`]: a shared
//! handle for posting activities plus a single-reader subscription of inbound
//! activities. Concrete transports live in submodules:
//!
//! - `directline`: Bot Framework Direct Line v3 over WebSocket or polling.

pub mod directline;

use crate::activity::OutboundActivity;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("channel stream failed: {0}")]
    Stream(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("malformed channel payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("channel is closed")]
    Closed,
}

impl ChannelError {
    /// `true` when the channel refused the token (401 or 403). Retrying with
    /// the same token will not help.
    pub fn is_token_rejected(&self) -> bool {
        match self {
            ChannelError::Request(e) => e.status().is_some_and(|status| {
                status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
            }),
            _ => false,
        }
    }
}

/// One item of the inbound stream. Raw activities are decoded by the session
/// so that a malformed payload only affects itself.
pub type InboundItem = Result<Value, ChannelError>;

/// The posting half of an open channel.
#[async_trait]
pub trait BotChannel: Send + Sync {
    /// Posts an activity and returns the id the channel assigned to it.
    async fn post_activity(&self, activity: &OutboundActivity) -> Result<String, ChannelError>;

    /// Closes the channel. Calling it more than once is harmless.
    fn end(&self);
}

/// Opens channels from session tokens.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn connect(&self, token: &str) -> Result<ChannelConnection, ChannelError>;
}

/// An open channel and its inbound activity subscription.
pub struct ChannelConnection {
    pub channel: Arc<dyn BotChannel>,
    pub activities: ActivitySubscription,
}

impl std::fmt::Debug for ChannelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelConnection").finish_non_exhaustive()
    }
}

/// Producer side of an [`ActivitySubscription`], held by transport tasks.
#[derive(Clone)]
pub struct ActivityFeed {
    tx: mpsc::Sender<InboundItem>,
    cancel: CancellationToken,
}

impl ActivityFeed {
    /// Delivers one item. Returns `false` once the subscriber is gone, which
    /// tells the transport task to stop.
    pub async fn send(&self, item: InboundItem) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.tx.send(item).await.is_ok()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }
}

/// A cancelable, ordered stream of inbound activities.
///
/// Dropping the subscription or calling [`unsubscribe`](Self::unsubscribe)
/// signals the producing task to stop.
pub struct ActivitySubscription {
    rx: mpsc::Receiver<InboundItem>,
    cancel: CancellationToken,
}

impl ActivitySubscription {
    /// Creates a connected feed/subscription pair with a bounded buffer.
    pub fn channel(capacity: usize) -> (ActivityFeed, ActivitySubscription) {
        let (tx, rx) = mpsc::channel(capacity);
        let cancel = CancellationToken::new();
        (
            ActivityFeed {
                tx,
                cancel: cancel.clone(),
            },
            ActivitySubscription { rx, cancel },
        )
    }

    /// Waits for the next inbound item; `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<InboundItem> {
        self.rx.recv().await
    }

    /// A token that is cancelled when this subscription is torn down.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn unsubscribe(&mut self) {
        self.cancel.cancel();
        self.rx.close();
    }
}

impl Drop for ActivitySubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
