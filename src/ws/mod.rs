//! Core WebSocket infrastructure.
//!
//! This module provides the transport-independent connection state machine. The actual
//! socket is supplied through the [`Adapter`] trait, so the same client runs over
//! `tokio-tungstenite`, an in-memory mock, or any other bidirectional text transport.
//!
//! # Architecture
//!
//! - [`Adapter`]: Uniform contract over a raw socket, reporting [`AdapterEvent`]s
//! - [`ConnectionState`]: Lifecycle published by the connection task
//! - [`config::Config`]: Endpoint, token, heartbeat and reconnection settings
//!
//! # Example
//!
//! ```ignore
//! let config = Config::builder().url("wss://example.com/ws").build();
//! let client = Client::new(MyAdapter::default(), config);
//! client.connect(Some("token")).await?;
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod traits;
#[cfg(feature = "tungstenite")]
pub mod tungstenite;

pub use connection::ConnectionState;
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
pub use traits::*;
#[cfg(feature = "tungstenite")]
pub use tungstenite::TungsteniteAdapter;
