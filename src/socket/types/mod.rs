pub mod request;
pub mod response;

/// Topic carrying forced-disconnect notices (`{code, detail}`).
pub const DISCONNECT_TOPIC: &str = "?dc";
/// Topic carrying out-of-band error notices (`{code, detail}`).
pub const ERROR_TOPIC: &str = "?er";
/// Pattern covering server-initiated channel announcements.
pub const CHANNEL_ANNOUNCE_PATTERN: &str = "?cr/#";
/// Prefix of announcement topics; the remainder names the announced channel topic.
pub const CHANNEL_ANNOUNCE_PREFIX: &str = "?cr/";
/// Code carried on [`DISCONNECT_TOPIC`] when the session token expired.
pub const TOKEN_EXPIRED: &str = "TOKEN_EXPIRED";

/// Topic on which the server answers a `channel_start` for `topic`.
#[must_use]
pub fn reply_topic(topic: &str) -> String {
    format!("{topic}.cre")
}

/// Topic carrying error notices for `key` (a channel id or subscription pattern).
#[must_use]
pub fn error_topic(key: &str) -> String {
    format!("{key}.err")
}

/// Topic carrying the close notice for channel `id`.
#[must_use]
pub fn close_topic(id: &str) -> String {
    format!("{id}.clo")
}
