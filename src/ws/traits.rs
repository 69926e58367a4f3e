//! Core traits for the pluggable transport layer.

use std::future::Future;

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

use crate::Result;

/// Transport readiness, numbered like the browser `WebSocket.readyState`.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ReadyState {
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// A raw inbound frame as delivered by the transport.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawFrame {
    Text(String),
    Binary(Vec<u8>),
}

impl RawFrame {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }
}

/// Lifecycle events reported by an [`Adapter`].
///
/// These replace per-instance `onOpen`/`onMessage`/`onClose`/`onError` callback slots
/// with a single tagged stream consumed by the connection event loop.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterEvent {
    /// The transport finished its opening handshake
    Open,
    /// A frame arrived
    Message(RawFrame),
    /// The transport closed; no further events follow
    Close { code: u16, reason: String },
    /// The transport failed; a `Close` event is expected to follow
    Error(String),
}

/// Uniform contract over a raw bidirectional socket.
///
/// Implementations report lifecycle changes through the `events` sender handed to
/// [`Adapter::connect`]. A new sender is supplied for every connection attempt, so
/// events from a previous transport are never observed by the client.
///
/// # Example
///
/// ```ignore
/// struct LoopbackAdapter { events: Option<mpsc::UnboundedSender<AdapterEvent>> }
///
/// #[async_trait]
/// impl Adapter for LoopbackAdapter {
///     async fn connect(&mut self, _url: &Url, events: mpsc::UnboundedSender<AdapterEvent>) -> Result<()> {
///         _ = events.send(AdapterEvent::Open);
///         self.events = Some(events);
///         Ok(())
///     }
///     // ...
/// }
/// ```
#[async_trait]
pub trait Adapter: Send + 'static {
    /// Open a transport to `url`.
    ///
    /// On success the adapter must emit [`AdapterEvent::Open`] once the transport is
    /// writable. On failure it returns the error and emits nothing.
    async fn connect(&mut self, url: &Url, events: mpsc::UnboundedSender<AdapterEvent>)
    -> Result<()>;

    /// Write a text frame.
    fn send(&mut self, data: String) -> Result<()>;

    /// Begin closing the transport.
    fn close(&mut self, code: u16, reason: &str);

    /// Current readiness of the transport.
    fn ready_state(&self) -> ReadyState;
}

/// Produces a fresh token after the server reports `TOKEN_EXPIRED`.
///
/// An empty token means "do not reconnect". Implemented for any async closure:
///
/// ```
/// use std::sync::Arc;
///
/// use topic_socket::error::Error;
/// use topic_socket::ws::config::Config;
///
/// let config = Config::builder()
///     .refresh_token(Arc::new(|| async { Ok::<_, Error>("fresh-token".to_owned()) }))
///     .build();
/// # let _ = config;
/// ```
#[async_trait]
pub trait RefreshToken: Send + Sync + 'static {
    async fn refresh(&self) -> Result<String>;
}

#[async_trait]
impl<F, Fut> RefreshToken for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String>> + Send + 'static,
{
    async fn refresh(&self) -> Result<String> {
        self().await
    }
}
