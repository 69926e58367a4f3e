use serde::Serialize;
use serde_json::Value;

/// Outbound frame sent to the server.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ClientMessage {
    pub action: ClientAction,
    pub topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ClientMessage {
    fn new(action: ClientAction, topic: &str, data: Option<Value>) -> Self {
        Self {
            action,
            topic: topic.to_owned(),
            data,
        }
    }

    #[must_use]
    pub fn subscribe(topic: &str) -> Self {
        Self::new(ClientAction::Subscribe, topic, None)
    }

    #[must_use]
    pub fn unsubscribe(topic: &str) -> Self {
        Self::new(ClientAction::Unsubscribe, topic, None)
    }

    /// Heartbeat frame with an empty topic.
    #[must_use]
    pub fn ping() -> Self {
        Self::new(ClientAction::Ping, "", None)
    }

    /// Application message published on `topic`.
    #[must_use]
    pub fn msg(topic: &str, data: Option<Value>) -> Self {
        Self::new(ClientAction::Msg, topic, data)
    }

    /// Request a channel on `topic`.
    #[must_use]
    pub fn channel_start(topic: &str) -> Self {
        Self::new(ClientAction::ChannelStart, topic, None)
    }

    /// Data addressed to channel `id`.
    #[must_use]
    pub fn channel(id: &str, data: Value) -> Self {
        Self::new(ClientAction::Channel, id, Some(data))
    }

    #[must_use]
    pub fn channel_close(id: &str) -> Self {
        Self::new(ClientAction::ChannelClose, id, None)
    }
}

#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientAction {
    Subscribe,
    Unsubscribe,
    Ping,
    Msg,
    ChannelStart,
    Channel,
    ChannelClose,
}
