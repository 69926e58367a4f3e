use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Inbound frame received from the server.
#[non_exhaustive]
#[derive(Debug, Clone, Deserialize)]
pub struct ServerMessage {
    /// Concrete topic the payload was published on
    #[serde(default)]
    pub topic: String,
    /// Control tag; absent on ordinary data frames
    #[serde(default)]
    pub action: Option<ServerAction>,
    /// Event-specific payload
    #[serde(default)]
    pub data: Value,
    /// Identity of the publishing peer, when the server forwards it
    #[serde(default, rename = "senderId", alias = "userId")]
    pub sender_id: Option<Value>,
    /// Publish time in Unix milliseconds
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerAction {
    /// Completes the logical connect handshake
    Connected,
    /// Carries a one-shot snapshot array for init handlers
    Init,
    #[serde(other)]
    Unknown,
}

/// `{code, detail}` body of `?dc`, `?er`, `.err` and `.clo` notices.
#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ErrorNotice {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub detail: String,
}

impl ErrorNotice {
    #[must_use]
    pub fn new<C: Into<String>, D: Into<String>>(code: C, detail: D) -> Self {
        Self {
            code: code.into(),
            detail: detail.into(),
        }
    }

    /// Read a notice out of a payload, tolerating missing or malformed fields.
    #[must_use]
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Object(_) => Self::deserialize(value).unwrap_or_default(),
            Value::String(detail) => Self::new("", detail.clone()),
            _ => Self::default(),
        }
    }
}

/// Payload on `{topic}.cre` answering a `channel_start`.
#[non_exhaustive]
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelCreateReply {
    #[serde(default, rename = "channelId")]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub error: Option<ErrorNotice>,
}

/// Payload on `?cr/...` announcing a server-initiated channel.
#[non_exhaustive]
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelAnnouncement {
    #[serde(default)]
    pub topic: Option<String>,
}

/// A payload delivered to a stream subscription, with the topic it was published on.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub data: Value,
}
