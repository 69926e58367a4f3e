#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::fmt;
use std::future::pending;
use std::mem;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff as _;
use secrecy::{ExposeSecret as _, SecretString};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Interval, MissedTickBehavior, Sleep, interval_at, sleep};
use url::Url;
use uuid::Uuid;

use super::config::Config;
use super::error::WsError;
use super::traits::{Adapter, AdapterEvent, RawFrame, ReadyState};
use crate::Result;
use crate::error::Error;
use crate::socket::channel::{
    Channel, ChannelOpenHandler, ChannelShared, ChannelTable, PendingOpen, request_channel,
};
use crate::socket::dispatch::{self, Routed, isolate};
use crate::socket::error::ChannelError;
use crate::socket::subscription::{Control, Handler, Registry, SubscriptionRecord};
use crate::socket::types::request::ClientMessage;
use crate::socket::types::response::{
    ChannelAnnouncement, ChannelCreateReply, ErrorNotice, ServerMessage,
};
use crate::socket::types::{
    CHANNEL_ANNOUNCE_PATTERN, CHANNEL_ANNOUNCE_PREFIX, DISCONNECT_TOPIC, ERROR_TOPIC,
    TOKEN_EXPIRED, close_topic, error_topic, reply_topic,
};

const NORMAL_CLOSURE: u16 = 1000;
const ABNORMAL_CLOSURE: u16 = 1006;

/// Connection state tracking.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionState {
    /// Not connected; initial state and the state after a manual disconnect
    Disconnected,
    /// Transport opening or waiting for the server's `connected` frame
    Connecting,
    /// Logically connected
    Connected {
        /// When the connection was established
        since: Instant,
    },
    /// Waiting to retry after the transport closed
    Reconnecting {
        /// Current reconnection attempt number
        attempt: u32,
        /// Delay before this attempt starts
        delay: Duration,
    },
    /// The transport reported a failure
    Error,
}

impl ConnectionState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected { .. })
    }
}

type ConnectReply = oneshot::Sender<Result<()>>;

/// Requests from client handles to the connection task.
pub(crate) enum Command {
    Connect {
        token: Option<SecretString>,
        reply: Option<ConnectReply>,
    },
    Disconnect,
    /// A token refresh finished; ignored when a disconnect happened since it started
    Refreshed {
        token: SecretString,
        generation: u64,
    },
    Subscribe(Vec<SubscriptionRecord>),
    RemoveRecords(Vec<Uuid>),
    Unsubscribe {
        pattern: String,
        handler: Option<Handler>,
    },
    UnsubscribeAll,
    Transmit(ClientMessage),
    OpenChannel {
        topic: String,
        ticket: Uuid,
        reply: oneshot::Sender<Result<Channel>>,
    },
    AbandonChannelOpen {
        topic: String,
        ticket: Uuid,
    },
    RegisterChannelOpen {
        id: Uuid,
        pattern: String,
        handler: ChannelOpenHandler,
    },
    UnregisterChannelOpen(Uuid),
    CountHandlers(oneshot::Sender<usize>),
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect { token, .. } => f
                .debug_struct("Connect")
                .field("token", token)
                .finish_non_exhaustive(),
            Self::Disconnect => f.write_str("Disconnect"),
            Self::Refreshed { generation, .. } => f
                .debug_struct("Refreshed")
                .field("generation", generation)
                .finish_non_exhaustive(),
            Self::Subscribe(records) => {
                let patterns: Vec<&str> = records.iter().map(|record| record.pattern.as_str()).collect();
                f.debug_tuple("Subscribe").field(&patterns).finish()
            }
            Self::RemoveRecords(ids) => f.debug_tuple("RemoveRecords").field(ids).finish(),
            Self::Unsubscribe { pattern, handler } => f
                .debug_struct("Unsubscribe")
                .field("pattern", pattern)
                .field("handler", &handler.is_some())
                .finish(),
            Self::UnsubscribeAll => f.write_str("UnsubscribeAll"),
            Self::Transmit(frame) => f.debug_tuple("Transmit").field(frame).finish(),
            Self::OpenChannel { topic, ticket, .. } => f
                .debug_struct("OpenChannel")
                .field("topic", topic)
                .field("ticket", ticket)
                .finish_non_exhaustive(),
            Self::AbandonChannelOpen { topic, ticket } => f
                .debug_struct("AbandonChannelOpen")
                .field("topic", topic)
                .field("ticket", ticket)
                .finish(),
            Self::RegisterChannelOpen { id, pattern, .. } => f
                .debug_struct("RegisterChannelOpen")
                .field("id", id)
                .field("pattern", pattern)
                .finish_non_exhaustive(),
            Self::UnregisterChannelOpen(id) => {
                f.debug_tuple("UnregisterChannelOpen").field(id).finish()
            }
            Self::CountHandlers(_) => f.write_str("CountHandlers"),
        }
    }
}

/// What a client handle keeps of a spawned connection.
pub(crate) struct Handle {
    pub(crate) commands: mpsc::UnboundedSender<Command>,
    pub(crate) state: watch::Receiver<ConnectionState>,
}

/// The connection state machine.
///
/// A single task owns the adapter, the subscription registry, the channel table and
/// the backoff counter. Client handles talk to it over an unbounded command channel
/// and the adapter reports through a per-connection event channel, so every mutation
/// happens inside one of this task's turns:
///
/// - `connect` registers the reserved control subscriptions and opens the transport
/// - adapter `Open` resets backoff, starts the heartbeat and resubscribes every pattern
/// - an inbound `connected` frame completes the handshake (`Connected`)
/// - adapter `Close` schedules a reconnect with exponential backoff unless the
///   disconnect was manual
pub(crate) struct Connection<A: Adapter> {
    adapter: A,
    config: Config,
    commands: mpsc::UnboundedReceiver<Command>,
    /// Used to hand out command senders without keeping the task alive on our own
    handle: mpsc::WeakUnboundedSender<Command>,
    state: watch::Sender<ConnectionState>,
    events: Option<mpsc::UnboundedReceiver<AdapterEvent>>,
    registry: Registry,
    channels: ChannelTable,
    /// Patterns first subscribed between transport-open and the `connected` frame
    deferred: Vec<String>,
    backoff: ExponentialBackoff,
    attempt: u32,
    token: Option<SecretString>,
    manual_disconnect: bool,
    /// Bumped by every disconnect
    generation: u64,
    transport_open: bool,
    pending: Vec<ConnectReply>,
    heartbeat: Option<Interval>,
    reconnect: Option<Pin<Box<Sleep>>>,
}

impl<A: Adapter> Connection<A> {
    /// Start the connection task. Must be called within a tokio runtime.
    pub(crate) fn spawn(adapter: A, config: Config) -> Handle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let connection = Self {
            adapter,
            backoff: config.reconnect.clone().into(),
            token: config.token.clone(),
            config,
            commands: commands_rx,
            handle: commands_tx.downgrade(),
            state: state_tx,
            events: None,
            registry: Registry::default(),
            channels: ChannelTable::default(),
            deferred: Vec::new(),
            attempt: 0,
            manual_disconnect: false,
            generation: 0,
            transport_open: false,
            pending: Vec::new(),
            heartbeat: None,
            reconnect: None,
        };

        tokio::spawn(connection.run());

        Handle {
            commands: commands_tx,
            state: state_rx,
        }
    }

    /// Main event loop. Ends once every client handle is gone.
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    self.handle_command(command).await;
                }

                event = next_event(&mut self.events) => {
                    match event {
                        Some(event) => self.handle_event(event),
                        None => {
                            // Adapter dropped its sender without reporting a close
                            self.events = None;
                            if self.transport_open {
                                self.on_close(ABNORMAL_CLOSURE, "transport dropped");
                            }
                        }
                    }
                }

                () = tick(&mut self.heartbeat) => {
                    self.send_ping();
                }

                () = elapsed(&mut self.reconnect) => {
                    self.reconnect = None;
                    #[cfg(feature = "tracing")]
                    tracing::debug!(attempt = self.attempt, "Attempting to reconnect");
                    self.connect(None, None).await;
                }
            }
        }

        // Cleanup
        self.disconnect();
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { token, reply } => self.connect(token, reply).await,
            Command::Disconnect => self.disconnect(),
            Command::Refreshed { token, generation } => {
                if generation == self.generation {
                    self.connect(Some(token), None).await;
                } else {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("Discarding refreshed token after a later disconnect");
                }
            }
            Command::Subscribe(records) => {
                for record in records {
                    self.track(record);
                }
            }
            Command::RemoveRecords(ids) => {
                for id in ids {
                    self.untrack(id);
                }
            }
            Command::Unsubscribe { pattern, handler } => {
                for emptied in self.registry.remove_handler(&pattern, handler.as_ref()) {
                    self.release(&emptied);
                }
                #[cfg(feature = "tracing")]
                tracing::debug!(%pattern, "Unsubscribed from pattern");
            }
            Command::UnsubscribeAll => {
                for pattern in self.registry.clear_handlers() {
                    self.release(&pattern);
                }
                #[cfg(feature = "tracing")]
                tracing::debug!("Unsubscribed from all patterns");
            }
            Command::Transmit(frame) => self.transmit(&frame),
            Command::OpenChannel {
                topic,
                ticket,
                reply,
            } => self.open_channel(&topic, ticket, reply),
            Command::AbandonChannelOpen { topic, ticket } => {
                if let Some(pending) = self.channels.abandon(&topic, ticket) {
                    self.untrack(pending.record);
                }
            }
            Command::RegisterChannelOpen {
                id,
                pattern,
                handler,
            } => self.channels.add_listener(id, &pattern, handler),
            Command::UnregisterChannelOpen(id) => self.channels.remove_listener(id),
            Command::CountHandlers(reply) => {
                _ = reply.send(self.registry.handler_count());
            }
        }
    }

    fn handle_event(&mut self, event: AdapterEvent) {
        match event {
            AdapterEvent::Open => self.on_open(),
            AdapterEvent::Message(frame) => self.on_frame(&frame),
            AdapterEvent::Close { code, reason } => self.on_close(code, &reason),
            AdapterEvent::Error(reason) => self.on_error(&reason),
        }
    }

    fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn is_connected(&self) -> bool {
        self.current_state().is_connected()
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });

        #[cfg(feature = "tracing")]
        if changed {
            tracing::debug!(%state, "Connection state changed");
        }
        #[cfg(not(feature = "tracing"))]
        let _ = changed;
    }

    async fn connect(&mut self, token: Option<SecretString>, reply: Option<ConnectReply>) {
        match self.current_state() {
            ConnectionState::Connected { .. } => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Already connected");
                respond(reply, Ok(()));
                return;
            }
            ConnectionState::Connecting => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Already connecting");
                self.pending.extend(reply);
                return;
            }
            _ => {}
        }

        let url = match self.endpoint(token) {
            Ok(url) => url,
            Err(e) => {
                respond(reply, Err(e));
                return;
            }
        };

        self.manual_disconnect = false;
        self.reconnect = None;
        self.register_controls();
        self.set_state(ConnectionState::Connecting);
        self.pending.extend(reply);

        // A fresh event channel per attempt: events of an older transport are dropped
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.events = Some(events_rx);

        if let Err(e) = self.adapter.connect(&url, events_tx).await {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %e, "Unable to connect");
            self.events = None;
            self.on_error(&e.to_string());
            self.schedule_reconnect();
        }
    }

    /// Resolve the token and build the URL for the next connection attempt.
    fn endpoint(&mut self, token: Option<SecretString>) -> Result<Url> {
        let token = token
            .filter(|token| !token.expose_secret().is_empty())
            .or_else(|| self.token.clone())
            .filter(|token| !token.expose_secret().is_empty())
            .ok_or(WsError::MissingToken)?;

        let base = self
            .config
            .url
            .as_deref()
            .filter(|url| !url.is_empty())
            .ok_or(WsError::MissingUrl)?;

        let mut url = Url::parse(base).map_err(WsError::InvalidUrl)?;
        url.query_pairs_mut()
            .append_pair("token", token.expose_secret());

        self.token = Some(token);
        Ok(url)
    }

    fn register_controls(&mut self) {
        let controls = [
            (DISCONNECT_TOPIC, Control::ForcedDisconnect),
            (ERROR_TOPIC, Control::ErrorNotice),
            (CHANNEL_ANNOUNCE_PATTERN, Control::ChannelAnnounce),
        ];

        for (pattern, control) in controls {
            if !self.registry.has_control(pattern, &control) {
                self.track(SubscriptionRecord::control(pattern, control));
            }
        }
    }

    fn disconnect(&mut self) {
        self.manual_disconnect = true;
        self.generation = self.generation.wrapping_add(1);
        self.reconnect = None;
        self.heartbeat = None;

        if self.adapter.ready_state() != ReadyState::Closed {
            self.adapter.close(NORMAL_CLOSURE, "Manual disconnect");
        }

        self.events = None;
        self.transport_open = false;
        self.deferred.clear();
        self.release_channels();
        self.set_state(ConnectionState::Disconnected);
        self.reject_pending(|| WsError::Disconnected.into());
    }

    fn on_open(&mut self) {
        #[cfg(feature = "tracing")]
        tracing::info!("WebSocket transport open");

        self.transport_open = true;
        self.backoff.reset();
        self.start_heartbeat();

        let patterns: Vec<String> = self.registry.patterns().map(str::to_owned).collect();
        #[cfg(feature = "tracing")]
        tracing::debug!(count = patterns.len(), "Re-subscribing to tracked patterns");
        for pattern in &patterns {
            self.transmit(&ClientMessage::subscribe(pattern));
        }
    }

    fn on_handshake(&mut self) {
        if self.is_connected() {
            return;
        }

        self.backoff.reset();
        self.attempt = 0;
        self.set_state(ConnectionState::Connected {
            since: Instant::now(),
        });

        for pattern in mem::take(&mut self.deferred) {
            if self.registry.contains_pattern(&pattern) {
                self.transmit(&ClientMessage::subscribe(&pattern));
            }
        }

        for reply in self.pending.drain(..) {
            _ = reply.send(Ok(()));
        }
    }

    fn on_close(&mut self, code: u16, reason: &str) {
        #[cfg(feature = "tracing")]
        tracing::info!(code, reason, "WebSocket closed");
        #[cfg(not(feature = "tracing"))]
        let _ = (code, reason);

        self.transport_open = false;
        self.events = None;
        self.heartbeat = None;
        self.deferred.clear();
        self.release_channels();
        self.set_state(ConnectionState::Disconnected);
        self.reject_pending(|| WsError::ConnectionClosed.into());

        if !self.manual_disconnect {
            self.schedule_reconnect();
        }
    }

    fn on_error(&mut self, reason: &str) {
        #[cfg(feature = "tracing")]
        tracing::warn!(reason, "WebSocket error");

        self.set_state(ConnectionState::Error);
        self.reject_pending(|| WsError::Transport(reason.to_owned()).into());
    }

    fn reject_pending<F: Fn() -> Error>(&mut self, error: F) {
        for reply in self.pending.drain(..) {
            _ = reply.send(Err(error()));
        }
    }

    fn schedule_reconnect(&mut self) {
        if self.manual_disconnect {
            return;
        }

        if let Some(max) = self.config.reconnect.max_attempts
            && self.attempt >= max
        {
            #[cfg(feature = "tracing")]
            tracing::warn!(max, "Max reconnect attempts reached");
            self.set_state(ConnectionState::Disconnected);
            return;
        }

        self.attempt = self.attempt.saturating_add(1);
        let delay = self
            .backoff
            .next_backoff()
            .unwrap_or(self.config.reconnect.max_backoff);

        #[cfg(feature = "tracing")]
        tracing::debug!(attempt = self.attempt, ?delay, "Scheduling reconnect");

        self.set_state(ConnectionState::Reconnecting {
            attempt: self.attempt,
            delay,
        });
        self.reconnect = Some(Box::pin(sleep(delay)));
    }

    fn start_heartbeat(&mut self) {
        let period = self.config.heartbeat_interval;
        let mut heartbeat = interval_at(tokio::time::Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.heartbeat = Some(heartbeat);
    }

    fn send_ping(&mut self) {
        if self.adapter.ready_state() == ReadyState::Open {
            self.transmit(&ClientMessage::ping());
        }
    }

    /// Record `record` and subscribe on the wire when it is the pattern's first.
    fn track(&mut self, record: SubscriptionRecord) {
        let pattern = record.pattern.clone();
        if !self.registry.insert(record) {
            #[cfg(feature = "tracing")]
            tracing::debug!(%pattern, "Pattern already subscribed, multiplexing");
            return;
        }

        if self.is_connected() {
            self.transmit(&ClientMessage::subscribe(&pattern));
        } else if self.transport_open {
            self.deferred.push(pattern);
        }
    }

    fn untrack(&mut self, id: Uuid) {
        for pattern in self.registry.remove_id(id) {
            self.release(&pattern);
        }
    }

    /// Unsubscribe on the wire after `pattern` lost its last record.
    fn release(&mut self, pattern: &str) {
        if let Some(position) = self.deferred.iter().position(|deferred| deferred == pattern) {
            // Never subscribed on the wire
            self.deferred.remove(position);
            return;
        }
        self.transmit(&ClientMessage::unsubscribe(pattern));
    }

    fn transmit(&mut self, frame: &ClientMessage) {
        if self.adapter.ready_state() != ReadyState::Open {
            #[cfg(feature = "tracing")]
            tracing::debug!(action = ?frame.action, topic = %frame.topic, "Cannot send frame: transport not open");
            return;
        }

        let json = match serde_json::to_string(frame) {
            Ok(json) => json,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %e, "Failed to encode frame");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                return;
            }
        };

        #[cfg(feature = "tracing")]
        if self.config.debug {
            tracing::debug!(%json, "Sent frame");
        }

        if let Err(e) = self.adapter.send(json) {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %e, "Failed to send frame");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
        }
    }

    fn on_frame(&mut self, frame: &RawFrame) {
        let message = match dispatch::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %e, "Dropping unparsable frame");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                return;
            }
        };

        #[cfg(feature = "tracing")]
        if self.config.debug {
            tracing::debug!(topic = %message.topic, action = ?message.action, data = %message.data, "Received frame");
        }

        match dispatch::route(&self.registry, &message) {
            Routed::Handshake => self.on_handshake(),
            Routed::Controls(controls) => {
                for control in controls {
                    self.on_control(control, &message);
                }
            }
        }
    }

    fn on_control(&mut self, control: Control, message: &ServerMessage) {
        match control {
            Control::ForcedDisconnect => {
                self.on_forced_disconnect(&ErrorNotice::from_value(&message.data));
            }
            Control::ErrorNotice => {
                let notice = ErrorNotice::from_value(&message.data);
                match &self.config.error_handler {
                    Some(handler) => isolate(ERROR_TOPIC, || handler(&notice)),
                    None => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(code = %notice.code, detail = %notice.detail, "Server error notice");
                    }
                }
            }
            Control::ChannelAnnounce => self.on_channel_announce(message),
            Control::ChannelReply { topic } => self.on_channel_reply(&topic, &message.data),
            Control::ChannelData { id } => {
                if let Some(channel) = self.channels.get(&id) {
                    channel.push(message.data.clone());
                }
            }
            Control::ChannelError { id } => {
                if let Some(channel) = self.channels.get(&id) {
                    channel.report_error(&ErrorNotice::from_value(&message.data));
                }
            }
            Control::ChannelClose { id } => self.on_channel_close(&id, &message.data),
        }
    }

    fn on_forced_disconnect(&mut self, notice: &ErrorNotice) {
        #[cfg(feature = "tracing")]
        tracing::warn!(code = %notice.code, detail = %notice.detail, "Server requested disconnect");

        if notice.code != TOKEN_EXPIRED {
            return;
        }

        self.disconnect();

        let Some(refresher) = self.config.refresh_token.clone() else {
            #[cfg(feature = "tracing")]
            tracing::warn!("Token expired and no refresh callback is configured");
            return;
        };

        let handle = self.handle.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            match refresher.refresh().await {
                Ok(token) if !token.is_empty() => {
                    if let Some(commands) = handle.upgrade() {
                        _ = commands.send(Command::Refreshed {
                            token: SecretString::from(token),
                            generation,
                        });
                    }
                }
                Ok(_) => {
                    #[cfg(feature = "tracing")]
                    tracing::info!("Token refresh returned no token, staying disconnected");
                }
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %e, "Token refresh failed");
                    #[cfg(not(feature = "tracing"))]
                    let _ = &e;
                }
            }
        });
    }

    /// Subscribe to the reply topic, then ask the server for a channel.
    fn open_channel(&mut self, topic: &str, ticket: Uuid, reply: oneshot::Sender<Result<Channel>>) {
        if !self.is_connected() {
            _ = reply.send(Err(WsError::NotConnected.into()));
            return;
        }

        let record = SubscriptionRecord::control(
            &reply_topic(topic),
            Control::ChannelReply {
                topic: topic.to_owned(),
            },
        );
        self.channels.await_reply(
            topic,
            PendingOpen {
                ticket,
                record: record.id,
                reply,
            },
        );
        self.track(record);
        self.transmit(&ClientMessage::channel_start(topic));
    }

    fn on_channel_reply(&mut self, topic: &str, data: &Value) {
        let Some(pending) = self.channels.take_pending(topic) else {
            return;
        };
        self.untrack(pending.record);

        let reply: ChannelCreateReply = serde_json::from_value(data.clone()).unwrap_or_default();
        let result = match (reply.channel_id, reply.error) {
            (Some(id), _) if !id.is_empty() => self.establish_channel(&id, topic),
            (_, Some(error)) => Err(ChannelError::Rejected {
                code: error.code,
                detail: error.detail,
            }
            .into()),
            _ => Err(WsError::InvalidMessage(format!(
                "channel reply carries neither channelId nor error: {data}"
            ))
            .into()),
        };

        // The requester gave up in the meantime; release the server-side channel
        if let Err(Ok(channel)) = pending.reply.send(result) {
            _ = channel.close();
        }
    }

    fn establish_channel(&mut self, id: &str, topic: &str) -> Result<Channel> {
        let commands = self.handle.upgrade().ok_or(WsError::ConnectionClosed)?;

        let records = vec![
            SubscriptionRecord::control(id, Control::ChannelData { id: id.to_owned() }),
            SubscriptionRecord::control(
                &error_topic(id),
                Control::ChannelError { id: id.to_owned() },
            ),
            SubscriptionRecord::control(
                &close_topic(id),
                Control::ChannelClose { id: id.to_owned() },
            ),
        ];
        let ids = records.iter().map(|record| record.id).collect();
        for record in records {
            self.track(record);
        }

        let shared = ChannelShared::new(id, topic);
        self.channels.insert(Arc::clone(&shared), ids);

        #[cfg(feature = "tracing")]
        tracing::debug!(channel = id, topic, open = self.channels.len(), "Channel opened");

        Ok(Channel::new(shared, commands))
    }

    fn on_channel_close(&mut self, id: &str, data: &Value) {
        let Some(open) = self.channels.remove(id) else {
            return;
        };

        let notice = (!data.is_null()).then(|| ErrorNotice::from_value(data));
        open.shared.close(notice.as_ref());
        for record in open.records {
            self.untrack(record);
        }
    }

    /// Drop channels whose `.clo` acknowledgement can no longer arrive, along with
    /// channels nobody holds a handle to.
    fn release_channels(&mut self) {
        for open in self.channels.take_released() {
            open.shared.close(None);
            for record in open.records {
                self.untrack(record);
            }
        }
    }

    /// Accept a server-initiated channel by running the open handshake as responder.
    fn on_channel_announce(&mut self, message: &ServerMessage) {
        let announced = serde_json::from_value::<ChannelAnnouncement>(message.data.clone())
            .ok()
            .and_then(|announcement| announcement.topic)
            .or_else(|| {
                message
                    .topic
                    .strip_prefix(CHANNEL_ANNOUNCE_PREFIX)
                    .map(str::to_owned)
            });

        let Some(topic) = announced.filter(|topic| !topic.is_empty()) else {
            #[cfg(feature = "tracing")]
            tracing::warn!(topic = %message.topic, "Channel announcement without a topic");
            return;
        };

        let Some(handler) = self.channels.listener_for(&topic) else {
            #[cfg(feature = "tracing")]
            tracing::debug!(%topic, "No listener for announced channel");
            return;
        };

        let Some(commands) = self.handle.upgrade() else {
            return;
        };
        let config = self.config.channel.clone();

        tokio::spawn(async move {
            match request_channel(&commands, &topic, &config).await {
                Ok(channel) => isolate(&topic, || handler(channel)),
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(%topic, error = %e, "Failed to accept server channel");
                    #[cfg(not(feature = "tracing"))]
                    let _ = &e;
                }
            }
        });
    }
}

fn respond(reply: Option<ConnectReply>, result: Result<()>) {
    if let Some(reply) = reply {
        _ = reply.send(result);
    }
}

async fn next_event(
    events: &mut Option<mpsc::UnboundedReceiver<AdapterEvent>>,
) -> Option<AdapterEvent> {
    match events {
        Some(events) => events.recv().await,
        None => pending().await,
    }
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(heartbeat) => {
            heartbeat.tick().await;
        }
        None => pending::<()>().await,
    }
}

async fn elapsed(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(timer) => timer.as_mut().await,
        None => pending::<()>().await,
    }
}
