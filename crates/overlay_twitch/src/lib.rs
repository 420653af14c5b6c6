#![forbid(unsafe_code)]

pub mod eventsub;
pub mod helix;
pub mod reader;

use std::fmt;
use std::time::SystemTime;

use overlay_domain::BroadcasterId;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Wrapper that redacts in logs.
#[derive(Clone)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

/// Domain event decoded from one upstream notification frame.
///
/// Immutable once constructed; consumed by zero or more subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
	pub broadcaster_id: BroadcasterId,

	pub broadcaster_user_name: String,

	/// Reader receipt timestamp (not for ordering).
	pub received_at: SystemTime,

	pub payload: EventPayload,
}

/// Per-category event payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
	ChatMessage(ChatMessageEvent),
	Ban(BanEvent),
	Unban(UnbanEvent),
}

/// A chat message posted in the broadcaster's channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessageEvent {
	pub chatter_user_name: String,
	pub text: String,

	/// Chatter's display color, empty when unset.
	#[serde(default)]
	pub color: String,
}

/// A ban or timeout issued by a moderator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanEvent {
	pub moderator_user_login: String,
	pub user_login: String,

	pub is_permanent: bool,
	pub banned_at: Option<SystemTime>,
	/// Timeout expiry; `None` for permanent bans.
	pub ends_at: Option<SystemTime>,
	pub reason: Option<String>,
}

/// A ban lifted by a moderator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnbanEvent {
	pub moderator_user_login: String,
	pub user_login: String,
}

/// Helper types for wiring readers to the multiplexer.
pub type EventTx = mpsc::Sender<Event>;
pub type EventRx = mpsc::Receiver<Event>;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn secret_string_redacts_in_logs() {
		let secret = SecretString::new("oauth-token-value");
		assert_eq!(format!("{secret}"), "<redacted>");
		assert_eq!(format!("{secret:?}"), "SecretString(<redacted>)");
		assert_eq!(secret.expose(), "oauth-token-value");
	}

	#[test]
	fn event_payload_serializes_tagged() {
		let payload = EventPayload::Unban(UnbanEvent {
			moderator_user_login: "mod".to_string(),
			user_login: "viewer".to_string(),
		});
		let json = serde_json::to_value(&payload).unwrap();
		assert_eq!(json["type"], "unban");
		assert_eq!(json["user_login"], "viewer");
	}
}
