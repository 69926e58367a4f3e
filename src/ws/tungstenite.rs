//! [`Adapter`] implementation over `tokio-tungstenite`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;
use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use super::error::WsError;
use super::traits::{Adapter, AdapterEvent, RawFrame, ReadyState};
use crate::Result;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const NO_STATUS: u16 = 1005;
const ABNORMAL: u16 = 1006;

/// Native websocket transport.
///
/// Each connection gets its own I/O task; frames written through [`Adapter::send`]
/// are queued to that task, and everything it reads is reported as [`AdapterEvent`]s.
#[derive(Debug)]
pub struct TungsteniteAdapter {
    state: Arc<AtomicU8>,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    task: Option<JoinHandle<()>>,
}

impl Default for TungsteniteAdapter {
    fn default() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(ReadyState::Closed as u8)),
            outbound: None,
            task: None,
        }
    }
}

impl TungsteniteAdapter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn shutdown(&mut self) {
        self.outbound = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl Adapter for TungsteniteAdapter {
    async fn connect(
        &mut self,
        url: &Url,
        events: mpsc::UnboundedSender<AdapterEvent>,
    ) -> Result<()> {
        self.shutdown();

        // A stale I/O task keeps writing to its own state, never to the new one
        let state = Arc::new(AtomicU8::new(ReadyState::Connecting as u8));
        self.state = Arc::clone(&state);

        let (stream, _) = match connect_async(url.as_str()).await {
            Ok(connected) => connected,
            Err(e) => {
                state.store(ReadyState::Closed as u8, Ordering::Release);
                return Err(WsError::Connection(e).into());
            }
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(host = ?url.host_str(), "WebSocket transport connected");

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        self.outbound = Some(outbound_tx);
        state.store(ReadyState::Open as u8, Ordering::Release);

        _ = events.send(AdapterEvent::Open);
        self.task = Some(tokio::spawn(pump(stream, outbound_rx, events, state)));

        Ok(())
    }

    fn send(&mut self, data: String) -> Result<()> {
        let outbound = self.outbound.as_ref().ok_or(WsError::NotConnected)?;
        outbound
            .send(Message::Text(data.into()))
            .map_err(|_e| WsError::ConnectionClosed)?;
        Ok(())
    }

    fn close(&mut self, code: u16, reason: &str) {
        let Some(outbound) = self.outbound.take() else {
            return;
        };

        self.state
            .store(ReadyState::Closing as u8, Ordering::Release);
        _ = outbound.send(Message::Close(Some(CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_owned().into(),
        })));
    }

    fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.state.load(Ordering::Acquire))
    }
}

impl Drop for TungsteniteAdapter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Move frames between the socket and the connection until either side goes away.
async fn pump(
    stream: WsStream,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    events: mpsc::UnboundedSender<AdapterEvent>,
    state: Arc<AtomicU8>,
) {
    let (mut write, mut read) = stream.split();
    let mut writable = true;

    let (code, reason) = loop {
        tokio::select! {
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    _ = events.send(AdapterEvent::Message(RawFrame::Text(text.as_str().to_owned())));
                }
                Some(Ok(Message::Binary(data))) => {
                    _ = events.send(AdapterEvent::Message(RawFrame::Binary(data.to_vec())));
                }
                Some(Ok(Message::Close(frame))) => {
                    break frame.map_or_else(
                        || (NO_STATUS, String::new()),
                        |frame| (u16::from(frame.code), frame.reason.as_str().to_owned()),
                    );
                }
                Some(Ok(_)) => {
                    // Ping/pong control frames are answered by tungstenite
                }
                Some(Err(e)) => {
                    _ = events.send(AdapterEvent::Error(e.to_string()));
                    break (ABNORMAL, e.to_string());
                }
                None => break (ABNORMAL, "stream ended".to_owned()),
            },

            message = outbound.recv(), if writable => match message {
                Some(message) => {
                    if let Err(e) = write.send(message).await {
                        _ = events.send(AdapterEvent::Error(e.to_string()));
                        break (ABNORMAL, e.to_string());
                    }
                }
                // Adapter dropped or closed: our close frame is already queued
                None => {
                    writable = false;
                    _ = write.close().await;
                }
            },
        }
    };

    state.store(ReadyState::Closed as u8, Ordering::Release);
    _ = events.send(AdapterEvent::Close { code, reason });
}
