//! Bidirectional sub-streams multiplexed over the shared socket.
//!
//! A channel is opened with a `channel_start` frame for a topic. The server answers on
//! `{topic}.cre` with either a `channelId` or an error. Once an id is assigned, data
//! flows on `{channelId}`, mid-stream errors on `{channelId}.err`, and the close notice
//! on `{channelId}.clo`.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use uuid::Uuid;

use super::dispatch::isolate;
use super::error::ChannelError;
use super::subscription::ErrorHandler;
use super::types::request::ClientMessage;
use super::types::response::ErrorNotice;
use crate::Result;
use crate::topic;
use crate::ws::WsError;
use crate::ws::config::ChannelConfig;
use crate::ws::connection::Command;

/// Called once when a channel closes; receives the server's notice when there is one.
pub type ChannelCloseHandler = Arc<dyn Fn(Option<&ErrorNotice>) + Send + Sync>;
/// Receives channels opened in response to a server announcement.
pub type ChannelOpenHandler = Arc<dyn Fn(Channel) + Send + Sync>;

type Waiter = oneshot::Sender<std::result::Result<Value, ChannelError>>;

/// Buffered payloads and pending readers. At most one of the two is non-empty.
#[derive(Default)]
struct Mailbox {
    queue: VecDeque<Value>,
    waiters: VecDeque<Waiter>,
    closed: bool,
    close_handlers: Vec<ChannelCloseHandler>,
    error_handler: Option<ErrorHandler>,
}

pub(crate) struct ChannelShared {
    id: String,
    topic: String,
    mailbox: Mutex<Mailbox>,
}

impl ChannelShared {
    pub(crate) fn new(id: &str, topic: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_owned(),
            topic: topic.to_owned(),
            mailbox: Mutex::new(Mailbox::default()),
        })
    }

    // A panicking handler never runs while the lock is held, so a poisoned mailbox
    // is still consistent.
    fn mailbox(&self) -> std::sync::MutexGuard<'_, Mailbox> {
        self.mailbox.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand `data` to the oldest live reader, or queue it.
    pub(crate) fn push(&self, data: Value) {
        let mut mailbox = self.mailbox();
        if mailbox.closed {
            return;
        }

        let mut data = data;
        while let Some(waiter) = mailbox.waiters.pop_front() {
            match waiter.send(Ok(data)) {
                Ok(()) => return,
                // Reader was dropped before the payload arrived
                Err(returned) => {
                    data = match returned {
                        Ok(value) => value,
                        Err(_) => return,
                    };
                }
            }
        }
        mailbox.queue.push_back(data);
    }

    /// Deliver a mid-stream error notice without closing the channel.
    pub(crate) fn report_error(&self, notice: &ErrorNotice) {
        let handler = self.mailbox().error_handler.clone();
        match handler {
            Some(handler) => isolate(&self.id, || handler(notice)),
            None => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    channel = %self.id,
                    code = %notice.code,
                    detail = %notice.detail,
                    "Channel reported an error"
                );
            }
        }
    }

    /// Run the close path. Returns `false` when the channel was already closed.
    pub(crate) fn close(&self, reason: Option<&ErrorNotice>) -> bool {
        let (waiters, handlers) = {
            let mut mailbox = self.mailbox();
            if mailbox.closed {
                return false;
            }
            mailbox.closed = true;
            mailbox.queue.clear();
            (
                std::mem::take(&mut mailbox.waiters),
                std::mem::take(&mut mailbox.close_handlers),
            )
        };

        for waiter in waiters {
            _ = waiter.send(Err(ChannelError::Closed));
        }
        for handler in handlers {
            isolate(&self.id, || handler(reason));
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(channel = %self.id, topic = %self.topic, "Channel closed");
        true
    }

    fn is_closed(&self) -> bool {
        self.mailbox().closed
    }
}

/// A bidirectional sub-stream identified by a server-issued id.
///
/// Cloning a `Channel` yields another handle to the same stream.
///
/// # Example
///
/// ```rust, no_run
/// use topic_socket::socket::Client;
/// use topic_socket::ws::config::Config;
///
/// # async fn example() -> topic_socket::Result<()> {
/// let client = Client::native(Config::builder().url("wss://example.com/ws").build());
/// client.connect(Some("token")).await?;
///
/// let channel = client.create_channel("files/upload").await?;
/// channel.send(&serde_json::json!({"name": "report.pdf"}))?;
/// let ack = channel.read().await?;
/// println!("server said {ack}");
/// channel.close()?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Channel {
    shared: Arc<ChannelShared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Channel {
    pub(crate) fn new(shared: Arc<ChannelShared>, commands: mpsc::UnboundedSender<Command>) -> Self {
        Self { shared, commands }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.shared.topic
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Send `data` to the peer as a `channel` frame.
    pub fn send<T: Serialize + ?Sized>(&self, data: &T) -> Result<()> {
        if self.is_closed() {
            return Err(ChannelError::Closed.into());
        }

        let frame = ClientMessage::channel(self.id(), serde_json::to_value(data)?);
        self.commands
            .send(Command::Transmit(frame))
            .map_err(|_e| WsError::ConnectionClosed)?;
        Ok(())
    }

    /// Receive the next payload.
    ///
    /// Returns immediately when a payload is buffered; otherwise waits until one arrives
    /// or the channel closes, in which case the read fails with [`ChannelError::Closed`].
    pub async fn read(&self) -> Result<Value> {
        let receiver = {
            let mut mailbox = self.shared.mailbox();
            if let Some(data) = mailbox.queue.pop_front() {
                return Ok(data);
            }
            if mailbox.closed {
                return Err(ChannelError::Closed.into());
            }

            let (waiter, receiver) = oneshot::channel();
            mailbox.waiters.push_back(waiter);
            receiver
        };

        match receiver.await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ChannelError::Closed.into()),
        }
    }

    /// Receive the next payload and deserialize it into `T`.
    pub async fn read_as<T: DeserializeOwned>(&self) -> Result<T> {
        let data = self.read().await?;
        Ok(serde_json::from_value(data)?)
    }

    /// Close the channel.
    ///
    /// Pending and later reads fail immediately. The server's `.clo` acknowledgement
    /// releases the channel's subscriptions, or the next transport close when the
    /// acknowledgement never arrives. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        if !self.shared.close(None) {
            return Ok(());
        }

        self.commands
            .send(Command::Transmit(ClientMessage::channel_close(self.id())))
            .map_err(|_e| WsError::ConnectionClosed)?;
        Ok(())
    }

    /// Register a handler run once when the channel closes.
    ///
    /// Runs immediately when the channel is already closed.
    pub fn on_close<F>(&self, handler: F)
    where
        F: Fn(Option<&ErrorNotice>) + Send + Sync + 'static,
    {
        let handler: ChannelCloseHandler = Arc::new(handler);
        {
            let mut mailbox = self.shared.mailbox();
            if !mailbox.closed {
                mailbox.close_handlers.push(handler);
                return;
            }
        }
        isolate(self.id(), || handler(None));
    }

    /// Register the handler for mid-stream `.err` notices, replacing any previous one.
    ///
    /// Errors do not close the channel.
    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&ErrorNotice) + Send + Sync + 'static,
    {
        self.shared.mailbox().error_handler = Some(Arc::new(handler));
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.shared.id)
            .field("topic", &self.shared.topic)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A `channel_start` waiting for its `.cre` reply.
pub(crate) struct PendingOpen {
    pub(crate) ticket: Uuid,
    /// Reply-topic record to release once the reply arrives
    pub(crate) record: Uuid,
    pub(crate) reply: oneshot::Sender<Result<Channel>>,
}

pub(crate) struct OpenChannel {
    pub(crate) shared: Arc<ChannelShared>,
    /// Data, error and close records scoped to this channel
    pub(crate) records: Vec<Uuid>,
}

struct ChannelListener {
    id: Uuid,
    pattern: String,
    handler: ChannelOpenHandler,
}

/// Channels owned by the connection: pending opens, open channels and listeners for
/// server-initiated channels.
#[derive(Default)]
pub(crate) struct ChannelTable {
    pending: HashMap<String, VecDeque<PendingOpen>>,
    open: HashMap<String, OpenChannel>,
    listeners: Vec<ChannelListener>,
}

impl ChannelTable {
    pub(crate) fn await_reply(&mut self, topic: &str, pending: PendingOpen) {
        self.pending
            .entry(topic.to_owned())
            .or_default()
            .push_back(pending);
    }

    /// The oldest open request on `topic`.
    pub(crate) fn take_pending(&mut self, topic: &str) -> Option<PendingOpen> {
        let queue = self.pending.get_mut(topic)?;
        let pending = queue.pop_front();
        if queue.is_empty() {
            self.pending.remove(topic);
        }
        pending
    }

    /// Drop the open request identified by `ticket`.
    pub(crate) fn abandon(&mut self, topic: &str, ticket: Uuid) -> Option<PendingOpen> {
        let queue = self.pending.get_mut(topic)?;
        let position = queue.iter().position(|pending| pending.ticket == ticket)?;
        let pending = queue.remove(position);
        if queue.is_empty() {
            self.pending.remove(topic);
        }
        pending
    }

    pub(crate) fn insert(&mut self, shared: Arc<ChannelShared>, records: Vec<Uuid>) {
        self.open
            .insert(shared.id.clone(), OpenChannel { shared, records });
    }

    pub(crate) fn get(&self, id: &str) -> Option<&Arc<ChannelShared>> {
        self.open.get(id).map(|open| &open.shared)
    }

    pub(crate) fn remove(&mut self, id: &str) -> Option<OpenChannel> {
        self.open.remove(id)
    }

    /// Take every channel that was closed locally or whose handles are all gone.
    pub(crate) fn take_released(&mut self) -> Vec<OpenChannel> {
        let released: Vec<String> = self
            .open
            .iter()
            .filter(|(_, open)| open.shared.is_closed() || Arc::strong_count(&open.shared) == 1)
            .map(|(id, _)| id.clone())
            .collect();

        released
            .iter()
            .filter_map(|id| self.open.remove(id))
            .collect()
    }

    #[cfg(feature = "tracing")]
    pub(crate) fn len(&self) -> usize {
        self.open.len()
    }

    pub(crate) fn add_listener(&mut self, id: Uuid, pattern: &str, handler: ChannelOpenHandler) {
        self.listeners.push(ChannelListener {
            id,
            pattern: pattern.to_owned(),
            handler,
        });
    }

    pub(crate) fn remove_listener(&mut self, id: Uuid) {
        self.listeners.retain(|listener| listener.id != id);
    }

    /// The first listener, in registration order, whose pattern matches `topic`.
    pub(crate) fn listener_for(&self, topic: &str) -> Option<ChannelOpenHandler> {
        self.listeners
            .iter()
            .find(|listener| topic::matches(&listener.pattern, topic))
            .map(|listener| Arc::clone(&listener.handler))
    }
}

/// Ask the connection to open a channel on `topic` and wait for the server's reply.
///
/// The wait is bounded by [`ChannelConfig::open_timeout`]; on expiry the request is
/// withdrawn and the call fails with [`ChannelError::Timeout`].
pub(crate) async fn request_channel(
    commands: &mpsc::UnboundedSender<Command>,
    topic: &str,
    config: &ChannelConfig,
) -> Result<Channel> {
    let ticket = Uuid::new_v4();
    let (reply, receiver) = oneshot::channel();
    commands
        .send(Command::OpenChannel {
            topic: topic.to_owned(),
            ticket,
            reply,
        })
        .map_err(|_e| WsError::ConnectionClosed)?;

    let after = config.open_timeout();
    match timeout(after, receiver).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(WsError::ConnectionClosed.into()),
        Err(_) => {
            _ = commands.send(Command::AbandonChannelOpen {
                topic: topic.to_owned(),
                ticket,
            });
            Err(ChannelError::Timeout { after }.into())
        }
    }
}
