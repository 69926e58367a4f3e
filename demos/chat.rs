//! Chat room walkthrough.
//!
//! This example exercises the client end to end by:
//! 1. Connecting with a token and watching state transitions
//! 2. Subscribing to a room with a callback and a stream
//! 3. Publishing a message
//! 4. Opening a channel and reading one reply
//!
//! Run with tracing enabled:
//! ```sh
//! SOCKET_URL=wss://example.com/ws SOCKET_TOKEN=... RUST_LOG=info cargo run --example chat --features tracing
//! ```

use std::env;
use std::time::Duration;

use futures::StreamExt as _;
use serde_json::json;
use tokio::time::timeout;
use topic_socket::socket::Client;
use topic_socket::ws::config::Config;
use tracing::{debug, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let url = env::var("SOCKET_URL")?;
    let token = env::var("SOCKET_TOKEN")?;

    let config = Config::builder()
        .url(url)
        .token(token)
        .heartbeat_interval(Duration::from_secs(15))
        .build();
    let client = Client::native(config);

    let mut states = client.state_receiver();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            info!(endpoint = "state", %state);
        }
    });

    client.connect(None).await?;

    let subscription = client.subscribe("room/+/msg", |data, topic| {
        info!(stream = "callback", %topic, %data);
    })?;
    let mut stream = Box::pin(client.subscribe_stream("room/#")?);

    client.send_message("room/lobby/msg", Some(&json!({"text": "hello from rust"})))?;

    let mut received = 0;
    while let Ok(Some(message)) = timeout(Duration::from_secs(5), stream.next()).await {
        info!(stream = "room/#", topic = %message.topic, data = %message.data);
        received += 1;
        if received >= 5 {
            break;
        }
    }
    info!(stream = "room/#", received);

    match client.create_channel("room/lobby/history").await {
        Ok(channel) => {
            channel.on_close(|notice| debug!(?notice, "history channel closed"));
            channel.send(&json!({"limit": 10}))?;
            match timeout(Duration::from_secs(5), channel.read()).await {
                Ok(Ok(page)) => info!(channel = channel.id(), %page),
                Ok(Err(e)) => warn!(error = %e),
                Err(_) => warn!("no history reply"),
            }
            channel.close()?;
        }
        Err(e) => warn!(endpoint = "create_channel", error = %e),
    }

    let handlers = client.subscription_count().await?;
    info!(handlers);

    subscription.unsubscribe();
    drop(stream);
    client.disconnect();

    Ok(())
}
