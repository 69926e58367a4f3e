#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use bon::Builder;
use secrecy::SecretString;

use super::traits::RefreshToken;
use crate::socket::subscription::ErrorHandler;

const DEFAULT_HEARTBEAT_INTERVAL_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_INITIAL_BACKOFF_DURATION: Duration = Duration::from_millis(500);
const DEFAULT_MAX_BACKOFF_DURATION: Duration = Duration::from_secs(16);
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
const DEFAULT_CHANNEL_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_CHANNEL_OPEN_ATTEMPTS: u32 = 50;

/// Configuration for the socket client.
///
/// ```
/// use std::time::Duration;
///
/// use topic_socket::ws::config::Config;
///
/// let config = Config::builder()
///     .url("wss://example.com/ws")
///     .token("secret-token".to_owned())
///     .heartbeat_interval(Duration::from_secs(10))
///     .build();
///
/// assert!(config.url.is_some());
/// ```
#[non_exhaustive]
#[derive(Clone, Builder)]
pub struct Config {
    /// Base websocket URL; the token is appended as the `token` query parameter
    #[builder(into)]
    pub url: Option<String>,
    /// Token used when `connect` is called without one
    #[builder(into)]
    pub token: Option<SecretString>,
    /// Interval between `ping` frames while the transport is open
    #[builder(default = DEFAULT_HEARTBEAT_INTERVAL_DURATION)]
    pub heartbeat_interval: Duration,
    /// Log every inbound and outbound frame at debug level
    #[builder(default)]
    pub debug: bool,
    /// Reconnection strategy configuration
    #[builder(default)]
    pub reconnect: ReconnectConfig,
    /// Channel-open handshake budget
    #[builder(default)]
    pub channel: ChannelConfig,
    /// Called when the server reports an expired token
    pub refresh_token: Option<Arc<dyn RefreshToken>>,
    /// Receives out-of-band error notices published on `?er`
    pub error_handler: Option<ErrorHandler>,
}

impl Default for Config {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("url", &self.url)
            .field("token", &self.token)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("debug", &self.debug)
            .field("reconnect", &self.reconnect)
            .field("channel", &self.channel)
            .field("refresh_token", &self.refresh_token.is_some())
            .field("error_handler", &self.error_handler.is_some())
            .finish()
    }
}

/// Configuration for automatic reconnection behavior.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts before giving up.
    /// `None` means infinite retries.
    pub max_attempts: Option<u32>,
    /// Initial backoff duration for first reconnection attempt
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None, // Infinite reconnection by default
            initial_backoff: DEFAULT_INITIAL_BACKOFF_DURATION,
            max_backoff: DEFAULT_MAX_BACKOFF_DURATION,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl ReconnectConfig {
    /// Give up after `max_attempts` consecutive failed reconnects.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

impl From<ReconnectConfig> for ExponentialBackoff {
    fn from(config: ReconnectConfig) -> Self {
        ExponentialBackoffBuilder::default()
            .with_initial_interval(config.initial_backoff)
            .with_max_interval(config.max_backoff)
            .with_multiplier(config.backoff_multiplier)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None) // We handle max attempts separately
            .build()
    }
}

/// Budget for the channel-open handshake.
///
/// The handshake waits at most `poll_interval * max_attempts` for the server's
/// reply before failing with a timeout.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub poll_interval: Duration,
    pub max_attempts: u32,
}

impl ChannelConfig {
    #[must_use]
    pub fn new(poll_interval: Duration, max_attempts: u32) -> Self {
        Self {
            poll_interval,
            max_attempts,
        }
    }

    /// Total time allowed for a channel-open reply.
    #[must_use]
    pub fn open_timeout(&self) -> Duration {
        self.poll_interval.saturating_mul(self.max_attempts)
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_POLL_INTERVAL, DEFAULT_CHANNEL_OPEN_ATTEMPTS)
    }
}

#[cfg(test)]
mod tests {
    use backoff::backoff::Backoff as _;

    use super::*;

    #[test]
    fn backoff_doubles_from_base() {
        let mut backoff: ExponentialBackoff = ReconnectConfig::default().into();

        let delays: Vec<u128> = (0..6)
            .map(|_| backoff.next_backoff().unwrap().as_millis())
            .collect();

        assert_eq!(delays, vec![500, 1000, 2000, 4000, 8000, 16000]);
    }

    #[test]
    fn backoff_respects_max() {
        let mut backoff: ExponentialBackoff = ReconnectConfig::default().into();

        for _ in 0..20 {
            let delay = backoff.next_backoff().unwrap();
            assert!(delay >= Duration::from_millis(500), "below base: {delay:?}");
            assert!(delay <= Duration::from_secs(16), "above max: {delay:?}");
        }

        assert_eq!(backoff.current_interval, Duration::from_secs(16));
    }

    #[test]
    fn backoff_reset_returns_to_base() {
        let mut backoff: ExponentialBackoff = ReconnectConfig::default().into();

        for _ in 0..4 {
            let _next = backoff.next_backoff();
        }
        backoff.reset();

        assert_eq!(backoff.current_interval, Duration::from_millis(500));
        assert_eq!(backoff.next_backoff().unwrap().as_millis(), 500);
    }

    #[test]
    fn default_heartbeat_is_thirty_seconds() {
        let config = Config::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert!(!config.debug);
        assert!(config.url.is_none());
    }

    #[test]
    fn channel_open_timeout_is_attempt_budget() {
        let config = ChannelConfig::default();
        assert_eq!(config.open_timeout(), Duration::from_secs(5));

        let config = ChannelConfig::new(Duration::from_millis(100), 30);
        assert_eq!(config.open_timeout(), Duration::from_secs(3));
    }
}
