use std::sync::Arc;

use async_stream::stream;
use futures::Stream;
use secrecy::SecretString;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use super::channel::{Channel, ChannelOpenHandler, request_channel};
use super::subscription::{
    Handler, Listener, Registration, Subscription, SubscriptionRecord, UnsubscribeOnDrop,
};
use super::types::error_topic;
use super::types::request::ClientMessage;
use super::types::response::{ErrorNotice, Message};
use crate::Result;
use crate::error::Error;
use crate::ws::WsError;
use crate::ws::config::Config;
use crate::ws::connection::{Command, Connection, ConnectionState};
use crate::ws::traits::Adapter;
#[cfg(feature = "tungstenite")]
use crate::ws::tungstenite::TungsteniteAdapter;

/// Topic-addressed pub/sub client over a single websocket.
///
/// Every clone shares the same connection. The connection task keeps running while any
/// client, [`Subscription`] or [`Channel`] handle is alive.
///
/// # Examples
///
/// ```rust, no_run
/// use topic_socket::socket::Client;
/// use topic_socket::ws::config::Config;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let config = Config::builder().url("wss://example.com/ws").build();
///     let client = Client::native(config);
///     client.connect(Some("my-token")).await?;
///
///     let subscription = client.subscribe("room/+/msg", |data, topic| {
///         println!("{topic}: {data}");
///     })?;
///
///     client.send_message("room/1/msg", Some(&serde_json::json!({"text": "hello"})))?;
///
///     subscription.unsubscribe();
///     client.disconnect();
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    /// Configuration the connection was started with
    config: Config,
    /// Requests to the connection task
    commands: mpsc::UnboundedSender<Command>,
    /// Connection state published by the connection task
    state: watch::Receiver<ConnectionState>,
}

impl Client {
    /// Create a client driving `adapter`.
    ///
    /// Nothing is connected until [`Client::connect`] is called.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    pub fn new<A: Adapter>(adapter: A, config: Config) -> Self {
        let handle = Connection::spawn(adapter, config.clone());

        Self {
            inner: Arc::new(ClientInner {
                config,
                commands: handle.commands,
                state: handle.state,
            }),
        }
    }

    /// Create a client over the native `tokio-tungstenite` transport.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    #[cfg(feature = "tungstenite")]
    #[must_use]
    pub fn native(config: Config) -> Self {
        Self::new(TungsteniteAdapter::new(), config)
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Connect and wait for the server's `connected` handshake.
    ///
    /// `token` replaces the stored token; with `None` the last used (or configured)
    /// token is reused. Resolves immediately when already connected, and joins the
    /// in-flight attempt when one is running.
    pub async fn connect(&self, token: Option<&str>) -> Result<()> {
        let (reply, receiver) = oneshot::channel();
        self.send(Command::Connect {
            token: token.map(|token| SecretString::from(token.to_owned())),
            reply: Some(reply),
        })?;

        receiver.await.map_err(|_e| WsError::ConnectionClosed)?
    }

    /// Close the transport and stop reconnecting. Idempotent.
    ///
    /// Subscriptions are kept and resubscribed on the next [`Client::connect`].
    pub fn disconnect(&self) {
        // A missing connection task is already disconnected
        _ = self.inner.commands.send(Command::Disconnect);
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.clone()
    }

    /// Register `handler` for every frame whose topic matches `pattern`.
    ///
    /// `+` matches exactly one topic level and a trailing `#` matches any remainder.
    /// The first handler on a pattern subscribes on the wire; further handlers share it.
    pub fn subscribe<F>(&self, pattern: &str, handler: F) -> Result<Subscription>
    where
        F: Fn(&Value, &str) + Send + Sync + 'static,
    {
        self.subscribe_with(pattern, Listener::new(handler))
    }

    /// Register a [`Listener`] with optional error and init callbacks.
    ///
    /// An error callback is attached to the shadow pattern `{pattern}.err` and is
    /// removed together with the message handler. Patterns ending in `#` cannot carry
    /// an error callback, since `room/#.err` only matches that literal topic.
    pub fn subscribe_with(&self, pattern: &str, listener: Listener) -> Result<Subscription> {
        validate_pattern(pattern)?;
        if listener.on_error.is_some() && pattern.ends_with('#') {
            return Err(Error::validation(format!(
                "error callbacks need a pattern without a trailing `#`, got {pattern}"
            )));
        }

        let primary = SubscriptionRecord::handler(pattern, listener.on_message, listener.on_init);
        let owner = primary.id;
        let mut records = vec![primary];
        if let Some(on_error) = listener.on_error {
            let forward: Handler = Arc::new(move |data: &Value, _: &str| {
                on_error(&ErrorNotice::from_value(data));
            });
            records.push(
                SubscriptionRecord::handler(&error_topic(pattern), forward, None).owned_by(owner),
            );
        }

        let ids = records.iter().map(|record| record.id).collect();
        self.send(Command::Subscribe(records))?;

        Ok(Subscription::new(
            pattern,
            Registration::Records(ids),
            self.inner.commands.clone(),
        ))
    }

    /// Subscribe to `pattern` as a stream of [`Message`]s.
    ///
    /// Dropping the stream unsubscribes.
    pub fn subscribe_stream(&self, pattern: &str) -> Result<impl Stream<Item = Message>> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(pattern, move |data, topic| {
            _ = tx.send(Message {
                topic: topic.to_owned(),
                data: data.clone(),
            });
        })?;
        let guard = UnsubscribeOnDrop::new(subscription);

        Ok(stream! {
            let _guard = guard;
            while let Some(message) = rx.recv().await {
                yield message;
            }
        })
    }

    /// Remove `handler` from `pattern`, or every handler on `pattern` when `None`.
    ///
    /// Error callbacks registered with the removed handlers go too. The wire
    /// unsubscribe is sent once a pattern has no handlers left.
    pub fn unsubscribe(&self, pattern: &str, handler: Option<&Handler>) -> Result<()> {
        self.send(Command::Unsubscribe {
            pattern: pattern.to_owned(),
            handler: handler.map(Arc::clone),
        })
    }

    /// Remove every user handler.
    pub fn unsubscribe_all(&self) -> Result<()> {
        self.send(Command::UnsubscribeAll)
    }

    /// Number of registered handlers, including `{pattern}.err` error callbacks.
    pub async fn subscription_count(&self) -> Result<usize> {
        let (reply, receiver) = oneshot::channel();
        self.send(Command::CountHandlers(reply))?;
        Ok(receiver.await.map_err(|_e| WsError::ConnectionClosed)?)
    }

    /// Publish `data` on `topic`.
    pub fn send_message<T: Serialize + ?Sized>(&self, topic: &str, data: Option<&T>) -> Result<()> {
        if topic.is_empty() {
            return Err(Error::validation("topic must not be empty"));
        }
        if !self.is_connected() {
            return Err(WsError::NotConnected.into());
        }

        let data = data.map(serde_json::to_value).transpose()?;
        self.send(Command::Transmit(ClientMessage::msg(topic, data)))
    }

    /// Open a channel on `topic` and wait for the server to assign its id.
    ///
    /// Fails immediately when the client is not connected.
    pub async fn create_channel(&self, topic: &str) -> Result<Channel> {
        if topic.is_empty() {
            return Err(Error::validation("channel topic must not be empty"));
        }

        request_channel(&self.inner.commands, topic, &self.inner.config.channel).await
    }

    /// Accept server-initiated channels whose topic matches `pattern`.
    ///
    /// `handler` receives each channel once its open handshake completed. When several
    /// patterns match, the earliest registration wins.
    pub fn register_channel_open<F>(&self, pattern: &str, handler: F) -> Result<Subscription>
    where
        F: Fn(Channel) + Send + Sync + 'static,
    {
        validate_pattern(pattern)?;

        let id = Uuid::new_v4();
        let handler: ChannelOpenHandler = Arc::new(handler);
        self.send(Command::RegisterChannelOpen {
            id,
            pattern: pattern.to_owned(),
            handler,
        })?;

        Ok(Subscription::new(
            pattern,
            Registration::ChannelListener(id),
            self.inner.commands.clone(),
        ))
    }

    fn send(&self, command: Command) -> Result<()> {
        self.inner
            .commands
            .send(command)
            .map_err(|_e| WsError::ConnectionClosed)?;
        Ok(())
    }
}

fn validate_pattern(pattern: &str) -> Result<()> {
    if pattern.is_empty() {
        return Err(Error::validation("subscription pattern must not be empty"));
    }
    Ok(())
}
