//! Bot channel activity payloads.
//!
//! Only the fields this client reads or writes are modelled; everything else
//! the channel sends is ignored during decoding.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The only activity kind the session turns into transcript messages.
pub const MESSAGE_KIND: &str = "message";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChannelAccount {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// An activity received from the bot channel.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct InboundActivity {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub from: Option<ChannelAccount>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub channel_data: Option<Value>,
}

impl InboundActivity {
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// The displayable text: the primary `text` field, or `channelData.text`
    /// when the primary field is absent or empty.
    pub fn display_text(&self) -> Option<&str> {
        self.text.as_deref().filter(|text| !text.is_empty()).or_else(|| {
            self.channel_data
                .as_ref()
                .and_then(|data| data.get("text"))
                .and_then(Value::as_str)
        })
    }
}

/// A user message posted into the bot channel.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct OutboundActivity {
    pub from: ChannelAccount,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub text: String,
}

impl OutboundActivity {
    pub fn message(user_id: &str, user_name: &str, text: impl Into<String>) -> Self {
        Self {
            from: ChannelAccount {
                id: user_id.to_string(),
                name: Some(user_name.to_string()),
            },
            kind: MESSAGE_KIND,
            text: text.into(),
        }
    }
}
