use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use crate::error::{Error, Kind};

/// Channel error variants.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The server refused to open the channel
    Rejected { code: String, detail: String },
    /// The channel is closed; no further reads or writes are possible
    Closed,
    /// No reply to `channel_start` arrived within the attempt budget
    Timeout { after: Duration },
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected { code, detail } => {
                write!(f, "channel rejected by server: {code} {detail}")
            }
            Self::Closed => write!(f, "channel is closed"),
            Self::Timeout { after } => write!(f, "channel open timed out after {after:?}"),
        }
    }
}

impl StdError for ChannelError {}

impl From<ChannelError> for Error {
    fn from(e: ChannelError) -> Self {
        let kind = match e {
            ChannelError::Timeout { .. } => Kind::Timeout,
            _ => Kind::Channel,
        };
        Error::with_source(kind, e)
    }
}
