#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Upstream identifier of a broadcaster channel.
///
/// This is the unit of event routing: one upstream reader and one fan-out
/// set exist per `BroadcasterId`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BroadcasterId(String);

impl BroadcasterId {
	/// Create a non-empty `BroadcasterId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for BroadcasterId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for BroadcasterId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		BroadcasterId::new(s.to_string())
	}
}

/// Upstream identifier of an authenticated user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
	/// Create a non-empty `UserId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for UserId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		UserId::new(s.to_string())
	}
}

/// Subscription key: `(broadcaster, acting user)`.
///
/// Serializes to the upstream subscription-condition object. The
/// broadcaster half alone is the multiplexer channel key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Condition {
	pub broadcaster_user_id: BroadcasterId,
	pub user_id: UserId,
}

impl Condition {
	/// Construct a `Condition`.
	pub fn new(broadcaster_user_id: BroadcasterId, user_id: UserId) -> Self {
		Self {
			broadcaster_user_id,
			user_id,
		}
	}

	/// The channel this condition subscribes to.
	pub fn channel_key(&self) -> &BroadcasterId {
		&self.broadcaster_user_id
	}
}

impl fmt::Display for Condition {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}@{}", self.user_id, self.broadcaster_user_id)
	}
}

/// Server-side session identifier (128-bit random token).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
	/// Create a new random session id.
	pub fn random() -> Self {
		Self(Uuid::new_v4())
	}

	/// Parse a session id from its cookie-value form.
	pub fn parse(s: &str) -> Result<Self, ParseIdError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		let id = Uuid::parse_str(s).map_err(|_| ParseIdError::InvalidFormat("expected uuid".into()))?;
		Ok(Self(id))
	}
}

impl fmt::Display for SessionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for SessionId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		SessionId::parse(s)
	}
}

/// Identifier of one fan-out registration, unique per join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
	/// Create a new random subscriber id.
	pub fn random() -> Self {
		Self(Uuid::new_v4())
	}
}

impl fmt::Display for SubscriberId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn condition_display_and_key() {
		let cond = Condition::new(
			BroadcasterId::new("141981764").unwrap(),
			UserId::new("527115020").unwrap(),
		);
		assert_eq!(cond.to_string(), "527115020@141981764");
		assert_eq!(cond.channel_key().as_str(), "141981764");
	}

	#[test]
	fn session_id_parse_roundtrip() {
		let id = SessionId::random();
		let parsed = SessionId::parse(&id.to_string()).unwrap();
		assert_eq!(parsed, id);
	}

	#[test]
	fn session_ids_are_unique() {
		assert_ne!(SessionId::random(), SessionId::random());
		assert_ne!(SubscriberId::random(), SubscriberId::random());
	}

	#[test]
	fn rejects_empty_ids() {
		assert!(BroadcasterId::new("").is_err());
		assert!(UserId::new("   ").is_err());
		assert_eq!(SessionId::parse(""), Err(ParseIdError::Empty));
	}

	#[test]
	fn rejects_malformed_session_id() {
		assert!(matches!(
			SessionId::parse("not-a-uuid"),
			Err(ParseIdError::InvalidFormat(_))
		));
	}

	mod props {
		use proptest::prelude::*;

		use super::super::*;

		proptest! {
			#[test]
			fn session_id_parse_never_panics(s in ".{0,64}") {
				let _ = SessionId::parse(&s);
			}

			#[test]
			fn broadcaster_id_accepts_all_non_blank(s in "[a-z0-9_]{1,25}") {
				let id = BroadcasterId::new(s.clone()).unwrap();
				prop_assert_eq!(id.as_str(), s.as_str());
			}
		}
	}
}
