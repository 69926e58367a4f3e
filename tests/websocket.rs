#![cfg(feature = "tungstenite")]
#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt as _, StreamExt as _};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use topic_socket::socket::Client;
use topic_socket::ws::ConnectionState;
use topic_socket::ws::config::Config;

/// Mock WebSocket server speaking the topic protocol.
struct MockWsServer {
    addr: SocketAddr,
    /// Broadcast messages to ALL connected clients
    message_tx: broadcast::Sender<String>,
    /// Receives frames sent by clients
    frame_rx: mpsc::UnboundedReceiver<Value>,
    /// Request URIs of accepted connections
    requests: Arc<Mutex<Vec<String>>>,
    /// Tells every open connection to hang up
    kick_tx: broadcast::Sender<()>,
}

impl MockWsServer {
    /// Start a mock WebSocket server on a random port.
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (message_tx, _) = broadcast::channel::<String>(100);
        let (kick_tx, _) = broadcast::channel::<()>(4);
        let (frame_tx, frame_rx) = mpsc::unbounded_channel::<Value>();
        let requests = Arc::new(Mutex::new(Vec::new()));

        let broadcast_tx = message_tx.clone();
        let kick = kick_tx.clone();
        let seen = Arc::clone(&requests);

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };

                let seen = Arc::clone(&seen);
                let record = move |request: &Request,
                                   response: Response|
                      -> Result<Response, ErrorResponse> {
                    seen.lock().unwrap().push(request.uri().to_string());
                    Ok(response)
                };
                let Ok(ws_stream) = tokio_tungstenite::accept_hdr_async(stream, record).await
                else {
                    continue;
                };

                let (mut write, mut read) = ws_stream.split();
                let frames = frame_tx.clone();
                let mut msg_rx = broadcast_tx.subscribe();
                let mut kick_rx = kick.subscribe();

                tokio::spawn(async move {
                    let hello = json!({"action": "connected"}).to_string();
                    if write.send(Message::Text(hello.into())).await.is_err() {
                        return;
                    }

                    loop {
                        tokio::select! {
                            msg = read.next() => {
                                match msg {
                                    Some(Ok(Message::Text(text))) => {
                                        let frame: Value = serde_json::from_str(text.as_str()).unwrap();
                                        if frame["action"] != "ping" {
                                            drop(frames.send(frame));
                                        }
                                    }
                                    Some(Ok(_)) => {}
                                    _ => break,
                                }
                            }
                            msg = msg_rx.recv() => {
                                match msg {
                                    Ok(text) => {
                                        if write.send(Message::Text(text.into())).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(_) => break,
                                }
                            }
                            _ = kick_rx.recv() => {
                                drop(write.send(Message::Close(None)).await);
                                break;
                            }
                        }
                    }
                });
            }
        });

        Self {
            addr,
            message_tx,
            frame_rx,
            requests,
            kick_tx,
        }
    }

    fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    /// Send a frame to all connected clients.
    fn publish(&self, topic: &str, data: &Value) {
        let frame = json!({"topic": topic, "data": data, "timestamp": 1_700_000_000_000_u64});
        drop(self.message_tx.send(frame.to_string()));
    }

    /// Close every open connection from the server side.
    fn kick(&self) {
        drop(self.kick_tx.send(()));
    }

    fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    /// Receive the next frame whose topic is not reserved.
    async fn recv_frame(&mut self) -> Option<Value> {
        loop {
            let frame = timeout(Duration::from_secs(2), self.frame_rx.recv())
                .await
                .ok()
                .flatten()?;
            if !frame["topic"].as_str().is_some_and(|topic| topic.starts_with('?')) {
                return Some(frame);
            }
        }
    }
}

#[tokio::test]
async fn connect_subscribe_and_receive() -> anyhow::Result<()> {
    let mut server = MockWsServer::start().await;
    let config = Config::builder().url(server.ws_url("/ws")).build();
    let client = Client::native(config);

    client.connect(Some("secret")).await?;
    assert!(client.is_connected());
    assert_eq!(server.requests(), vec!["/ws?token=secret".to_owned()]);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _room = client.subscribe("room/+/msg", move |data, topic| {
        drop(tx.send((topic.to_owned(), data.clone())));
    })?;

    let frame = server.recv_frame().await.unwrap();
    assert_eq!(frame, json!({"action": "subscribe", "topic": "room/+/msg"}));

    server.publish("room/42/msg", &json!({"text": "hello"}));
    let (topic, data) = timeout(Duration::from_secs(2), rx.recv()).await?.unwrap();
    assert_eq!(topic, "room/42/msg");
    assert_eq!(data, json!({"text": "hello"}));

    client.send_message("room/42/msg", Some(&json!({"text": "hi back"})))?;
    let frame = server.recv_frame().await.unwrap();
    assert_eq!(
        frame,
        json!({"action": "msg", "topic": "room/42/msg", "data": {"text": "hi back"}})
    );

    client.disconnect();
    Ok(())
}

#[tokio::test]
async fn reconnects_and_resubscribes_after_server_close() -> anyhow::Result<()> {
    let mut server = MockWsServer::start().await;
    let config = Config::builder()
        .url(server.ws_url("/ws"))
        .token("secret".to_owned())
        .build();
    let client = Client::native(config);

    client.connect(None).await?;
    let _feed = client.subscribe("feed/#", |_, _| {})?;
    assert_eq!(
        server.recv_frame().await.unwrap(),
        json!({"action": "subscribe", "topic": "feed/#"})
    );

    let mut states = client.state_receiver();
    server.kick();

    // Wait for the reconnect to complete its handshake
    timeout(Duration::from_secs(5), async {
        loop {
            states.changed().await.unwrap();
            if matches!(*states.borrow_and_update(), ConnectionState::Reconnecting { .. }) {
                break;
            }
        }
        loop {
            states.changed().await.unwrap();
            if states.borrow_and_update().is_connected() {
                break;
            }
        }
    })
    .await?;

    assert_eq!(
        server.recv_frame().await.unwrap(),
        json!({"action": "subscribe", "topic": "feed/#"})
    );
    assert_eq!(server.requests().len(), 2);

    client.disconnect();
    Ok(())
}

#[tokio::test]
async fn channel_round_trip() -> anyhow::Result<()> {
    let mut server = MockWsServer::start().await;
    let config = Config::builder().url(server.ws_url("/ws")).build();
    let client = Client::native(config);
    client.connect(Some("secret")).await?;

    let opening = {
        let client = client.clone();
        tokio::spawn(async move { client.create_channel("files").await })
    };

    assert_eq!(
        server.recv_frame().await.unwrap(),
        json!({"action": "subscribe", "topic": "files.cre"})
    );
    assert_eq!(
        server.recv_frame().await.unwrap(),
        json!({"action": "channel_start", "topic": "files"})
    );
    server.publish("files.cre", &json!({"channelId": "c-1"}));

    let channel = opening.await??;
    assert_eq!(channel.id(), "c-1");

    server.publish("c-1", &json!({"chunk": 1}));
    assert_eq!(
        timeout(Duration::from_secs(2), channel.read()).await??,
        json!({"chunk": 1})
    );

    client.disconnect();
    Ok(())
}
