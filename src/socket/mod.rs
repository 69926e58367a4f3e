//! Topic-addressed pub/sub and channels over the shared websocket.
//!
//! [`Client`] is the entry point. Frames are routed to handlers by MQTT-style topic
//! patterns (see [`crate::topic`]), and [`Channel`]s provide ordered request/response
//! sub-streams multiplexed over the same connection.

pub mod channel;
pub mod client;
pub(crate) mod dispatch;
pub mod error;
pub mod subscription;
pub mod types;

pub use channel::Channel;
pub use client::Client;
pub use error::ChannelError;
pub use subscription::{Listener, Subscription};
pub use types::response::{ErrorNotice, Message};
