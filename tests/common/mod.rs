#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests, and https://github.com/rust-lang/rust-clippy/issues/13981"
)]
#![allow(
    unused,
    reason = "Helpers are shared between test crates that each use a subset"
)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::timeout;
use topic_socket::Result;
use topic_socket::socket::Client;
use topic_socket::ws::config::Config;
use topic_socket::ws::{Adapter, AdapterEvent, RawFrame, ReadyState, WsError};
use url::Url;

pub const URL: &str = "ws://socket.test/ws";
pub const TOKEN: &str = "token-1";

#[derive(Debug)]
struct Shared {
    ready: ReadyState,
    events: Option<mpsc::UnboundedSender<AdapterEvent>>,
    urls: Vec<Url>,
    closes: Vec<(u16, String)>,
    failures: usize,
}

/// In-memory transport. Opens synchronously unless told to fail.
#[derive(Debug)]
pub struct MockAdapter {
    shared: Arc<Mutex<Shared>>,
    sent: mpsc::UnboundedSender<Value>,
}

/// The server side of a [`MockAdapter`].
#[derive(Debug)]
pub struct Remote {
    shared: Arc<Mutex<Shared>>,
    sent: mpsc::UnboundedReceiver<Value>,
}

#[must_use]
pub fn mock() -> (MockAdapter, Remote) {
    let shared = Arc::new(Mutex::new(Shared {
        ready: ReadyState::Closed,
        events: None,
        urls: Vec::new(),
        closes: Vec::new(),
        failures: 0,
    }));
    let (sent_tx, sent_rx) = mpsc::unbounded_channel();

    (
        MockAdapter {
            shared: Arc::clone(&shared),
            sent: sent_tx,
        },
        Remote {
            shared,
            sent: sent_rx,
        },
    )
}

#[async_trait]
impl Adapter for MockAdapter {
    async fn connect(
        &mut self,
        url: &Url,
        events: mpsc::UnboundedSender<AdapterEvent>,
    ) -> Result<()> {
        let mut shared = self.shared.lock().unwrap();
        shared.urls.push(url.clone());

        if shared.failures > 0 {
            shared.failures -= 1;
            shared.ready = ReadyState::Closed;
            return Err(WsError::Transport("connection refused".to_owned()).into());
        }

        shared.ready = ReadyState::Open;
        events.send(AdapterEvent::Open).unwrap();
        shared.events = Some(events);
        Ok(())
    }

    fn send(&mut self, data: String) -> Result<()> {
        if self.shared.lock().unwrap().ready != ReadyState::Open {
            return Err(WsError::NotConnected.into());
        }
        self.sent.send(serde_json::from_str(&data)?).unwrap();
        Ok(())
    }

    fn close(&mut self, code: u16, reason: &str) {
        let mut shared = self.shared.lock().unwrap();
        shared.closes.push((code, reason.to_owned()));
        shared.ready = ReadyState::Closed;
        if let Some(events) = shared.events.take() {
            _ = events.send(AdapterEvent::Close {
                code,
                reason: reason.to_owned(),
            });
        }
    }

    fn ready_state(&self) -> ReadyState {
        self.shared.lock().unwrap().ready
    }
}

impl Remote {
    /// Number of connection attempts so far.
    #[must_use]
    pub fn connects(&self) -> usize {
        self.shared.lock().unwrap().urls.len()
    }

    #[must_use]
    pub fn urls(&self) -> Vec<Url> {
        self.shared.lock().unwrap().urls.clone()
    }

    /// Close frames the client initiated.
    #[must_use]
    pub fn closes(&self) -> Vec<(u16, String)> {
        self.shared.lock().unwrap().closes.clone()
    }

    /// Refuse the next `count` connection attempts.
    pub fn fail_next(&self, count: usize) {
        self.shared.lock().unwrap().failures = count;
    }

    fn emit(&self, event: AdapterEvent) {
        let shared = self.shared.lock().unwrap();
        let events = shared.events.as_ref().expect("transport is not open");
        events.send(event).unwrap();
    }

    pub fn frame(&self, frame: &Value) {
        self.emit(AdapterEvent::Message(RawFrame::Text(frame.to_string())));
    }

    pub fn publish(&self, topic: &str, data: &Value) {
        self.frame(&json!({"topic": topic, "data": data}));
    }

    /// Complete the logical connect.
    pub fn handshake(&self) {
        self.frame(&json!({"action": "connected"}));
    }

    /// Drop the transport from the server side.
    pub fn server_close(&self, code: u16) {
        let mut shared = self.shared.lock().unwrap();
        shared.ready = ReadyState::Closed;
        if let Some(events) = shared.events.take() {
            events
                .send(AdapterEvent::Close {
                    code,
                    reason: "server going away".to_owned(),
                })
                .unwrap();
        }
    }

    /// Next frame written by the client.
    pub async fn next_sent(&mut self) -> Value {
        timeout(Duration::from_secs(2), self.sent.recv())
            .await
            .expect("no frame was sent")
            .unwrap()
    }

    /// Every frame written so far that has not been consumed yet.
    pub fn drain_sent(&mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.sent.try_recv() {
            frames.push(frame);
        }
        frames
    }
}

/// Let the connection task process everything queued so far.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

#[must_use]
pub fn subscribe_frame(topic: &str) -> Value {
    json!({"action": "subscribe", "topic": topic})
}

#[must_use]
pub fn unsubscribe_frame(topic: &str) -> Value {
    json!({"action": "unsubscribe", "topic": topic})
}

#[must_use]
pub fn config() -> Config {
    Config::builder().url(URL).build()
}

/// Client connected through the full handshake, with its transport frames drained.
pub async fn connected(config: Config) -> anyhow::Result<(Client, Remote)> {
    let (adapter, mut remote) = mock();
    let client = Client::new(adapter, config);

    let connecting = {
        let client = client.clone();
        tokio::spawn(async move { client.connect(Some(TOKEN)).await })
    };
    settle().await;
    remote.handshake();
    connecting.await??;

    remote.drain_sent();
    Ok((client, remote))
}
