#![expect(
    clippy::module_name_repetitions,
    reason = "Error types include the module name to indicate their scope"
)]

use std::error::Error as StdError;
use std::fmt;

use crate::error::{Error, Kind};

/// WebSocket error variants.
#[non_exhaustive]
#[derive(Debug)]
pub enum WsError {
    /// Error connecting to or communicating with the WebSocket server
    #[cfg(feature = "tungstenite")]
    Connection(tokio_tungstenite::tungstenite::Error),
    /// Adapter-reported transport failure
    Transport(String),
    /// `connect` was called without a token and none is stored
    MissingToken,
    /// No URL is configured
    MissingUrl,
    /// The configured URL could not be parsed
    InvalidUrl(url::ParseError),
    /// WebSocket connection was closed
    ConnectionClosed,
    /// The client was disconnected before the operation completed
    Disconnected,
    /// The operation requires a logically connected client
    NotConnected,
    /// Error parsing a WebSocket message
    MessageParse(serde_json::Error),
    /// Received an invalid or unexpected message
    InvalidMessage(String),
}

impl fmt::Display for WsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            #[cfg(feature = "tungstenite")]
            Self::Connection(e) => write!(f, "WebSocket connection error: {e}"),
            Self::Transport(reason) => write!(f, "WebSocket transport failed: {reason}"),
            Self::MissingToken => write!(f, "Token is required for WebSocket connection"),
            Self::MissingUrl => write!(f, "WebSocket URL is required"),
            Self::InvalidUrl(e) => write!(f, "Invalid WebSocket URL: {e}"),
            Self::ConnectionClosed => write!(f, "WebSocket connection closed"),
            Self::Disconnected => write!(f, "WebSocket client disconnected"),
            Self::NotConnected => write!(f, "WebSocket client is not connected"),
            Self::MessageParse(e) => write!(f, "Failed to parse WebSocket message: {e}"),
            Self::InvalidMessage(msg) => write!(f, "Invalid WebSocket message: {msg}"),
        }
    }
}

impl StdError for WsError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            #[cfg(feature = "tungstenite")]
            Self::Connection(e) => Some(e),
            Self::InvalidUrl(e) => Some(e),
            Self::MessageParse(e) => Some(e),
            _ => None,
        }
    }
}

impl WsError {
    const fn kind(&self) -> Kind {
        match self {
            Self::MessageParse(_) | Self::InvalidMessage(_) => Kind::Protocol,
            _ => Kind::Connection,
        }
    }
}

// Integration with main Error type
impl From<WsError> for Error {
    fn from(e: WsError) -> Self {
        Error::with_source(e.kind(), e)
    }
}

#[cfg(feature = "tungstenite")]
impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::with_source(Kind::Connection, WsError::Connection(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_failures_are_protocol_errors() {
        let error: Error = WsError::InvalidMessage("not an object".to_owned()).into();
        assert_eq!(error.kind(), Kind::Protocol);
    }

    #[test]
    fn missing_token_is_connection_error() {
        let error: Error = WsError::MissingToken.into();

        assert_eq!(error.kind(), Kind::Connection);
        assert!(matches!(
            error.downcast_ref::<WsError>(),
            Some(WsError::MissingToken)
        ));
    }

    #[test]
    fn unparsable_url_is_connection_error() {
        let parse = url::Url::parse("not a url").unwrap_err();
        let error: Error = WsError::InvalidUrl(parse).into();

        assert_eq!(error.kind(), Kind::Connection);
        assert!(error.downcast_ref::<WsError>().is_some());
    }
}
