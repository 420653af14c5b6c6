#![forbid(unsafe_code)]

use std::time::SystemTime;

use anyhow::Context;
use overlay_domain::BroadcasterId;

use serde::Deserialize;

use crate::{BanEvent, ChatMessageEvent, Event, EventPayload, UnbanEvent};

/// EventSub metadata (present on all WebSocket frames).
#[allow(dead_code)]
#[derive(Debug, Deserialize)]
pub(crate) struct EventSubMetadata {
	pub(crate) message_id: String,
	pub(crate) message_type: String,
	pub(crate) message_timestamp: String,

	#[serde(default)]
	pub(crate) subscription_type: Option<String>,
	#[serde(default)]
	pub(crate) subscription_version: Option<String>,
}

/// A lightweight peek struct to cheaply inspect message_type/subscription_type.
#[derive(Debug, Deserialize)]
pub(crate) struct EventSubMetadataPeek {
	pub(crate) metadata: EventSubMetadataPeekInner,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubMetadataPeekInner {
	pub(crate) message_type: String,
	#[serde(default)]
	pub(crate) subscription_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubWelcomeMessage {
	#[allow(dead_code)]
	pub(crate) metadata: EventSubMetadata,
	pub(crate) payload: EventSubWelcomePayload,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubWelcomePayload {
	pub(crate) session: EventSubWelcomeSession,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubWelcomeSession {
	pub(crate) id: String,

	#[allow(dead_code)]
	#[serde(default)]
	pub(crate) status: Option<String>,

	#[allow(dead_code)]
	#[serde(default)]
	pub(crate) keepalive_timeout_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubNotification<TEvent> {
	#[allow(dead_code)]
	pub(crate) metadata: EventSubMetadata,
	pub(crate) payload: EventSubNotificationPayload<TEvent>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubNotificationPayload<TEvent> {
	#[allow(dead_code)]
	pub(crate) subscription: EventSubSubscription,
	pub(crate) event: TEvent,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubSubscription {
	#[allow(dead_code)]
	pub(crate) id: String,

	#[serde(rename = "type")]
	#[allow(dead_code)]
	pub(crate) r#type: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChannelChatMessageEvent {
	pub(crate) broadcaster_user_id: String,
	#[allow(dead_code)]
	pub(crate) broadcaster_user_login: String,
	pub(crate) broadcaster_user_name: String,

	pub(crate) chatter_user_name: String,

	pub(crate) message: ChannelChatMessageContent,

	#[serde(default)]
	pub(crate) color: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChannelChatMessageContent {
	pub(crate) text: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChannelBanEvent {
	pub(crate) broadcaster_user_id: String,
	pub(crate) broadcaster_user_name: String,

	pub(crate) user_login: String,
	pub(crate) moderator_user_login: String,

	#[serde(default)]
	pub(crate) reason: Option<String>,

	pub(crate) banned_at: String,

	/// RFC3339 timestamp if timeout; null if permanent ban.
	#[serde(default)]
	pub(crate) ends_at: Option<String>,

	pub(crate) is_permanent: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChannelUnbanEvent {
	pub(crate) broadcaster_user_id: String,
	pub(crate) broadcaster_user_name: String,

	pub(crate) user_login: String,
	pub(crate) moderator_user_login: String,
}

/// Extract `metadata.message_type` from a raw EventSub WS JSON string.
pub(crate) fn peek_message_type(raw_json: &str) -> anyhow::Result<String> {
	let peek: EventSubMetadataPeek = serde_json::from_str(raw_json).context("parse EventSub metadata peek")?;
	Ok(peek.metadata.message_type)
}

/// Parse a raw WS message as `session_welcome`.
pub(crate) fn parse_welcome(raw_json: &str) -> anyhow::Result<EventSubWelcomeMessage> {
	serde_json::from_str(raw_json).context("parse session_welcome")
}

/// Convert an RFC3339 timestamp into `SystemTime`.
///
/// EventSub timestamps are RFC3339 with fractional seconds and Zulu (UTC).
pub(crate) fn parse_rfc3339_system_time(ts: &str) -> anyhow::Result<SystemTime> {
	let dt = chrono::DateTime::parse_from_rfc3339(ts).context("parse EventSub RFC3339 timestamp")?;
	Ok(SystemTime::from(dt.with_timezone(&chrono::Utc)))
}

/// Decode a `notification` frame into a domain [`Event`].
///
/// Returns `Ok(None)` for non-notification frames and for subscription
/// types this reader does not track. Malformed JSON is an error; the
/// caller terminates rather than deliver partial data.
pub(crate) fn event_from_notification(raw_json: &str, received_at: SystemTime) -> anyhow::Result<Option<Event>> {
	let peek: EventSubMetadataPeek = serde_json::from_str(raw_json).context("parse EventSub metadata peek")?;

	if peek.metadata.message_type != "notification" {
		return Ok(None);
	}

	match peek.metadata.subscription_type.as_deref() {
		Some("channel.chat.message") => {
			let msg: EventSubNotification<ChannelChatMessageEvent> =
				serde_json::from_str(raw_json).context("parse channel.chat.message notification")?;
			let ev = msg.payload.event;

			Ok(Some(Event {
				broadcaster_id: BroadcasterId::new(ev.broadcaster_user_id)
					.context("construct BroadcasterId from broadcaster_user_id")?,
				broadcaster_user_name: ev.broadcaster_user_name,
				received_at,
				payload: EventPayload::ChatMessage(ChatMessageEvent {
					chatter_user_name: ev.chatter_user_name,
					text: ev.message.text,
					color: ev.color,
				}),
			}))
		}

		Some("channel.ban") => {
			let msg: EventSubNotification<ChannelBanEvent> =
				serde_json::from_str(raw_json).context("parse channel.ban notification")?;
			let ev = msg.payload.event;

			let banned_at = Some(parse_rfc3339_system_time(&ev.banned_at).context("parse channel.ban banned_at")?);
			let ends_at = match ev.ends_at.as_deref() {
				None => None,
				Some(ts) => Some(parse_rfc3339_system_time(ts).context("parse channel.ban ends_at")?),
			};

			Ok(Some(Event {
				broadcaster_id: BroadcasterId::new(ev.broadcaster_user_id)
					.context("construct BroadcasterId from broadcaster_user_id")?,
				broadcaster_user_name: ev.broadcaster_user_name,
				received_at,
				payload: EventPayload::Ban(BanEvent {
					moderator_user_login: ev.moderator_user_login,
					user_login: ev.user_login,
					is_permanent: ev.is_permanent,
					banned_at,
					ends_at,
					reason: ev.reason,
				}),
			}))
		}

		Some("channel.unban") => {
			let msg: EventSubNotification<ChannelUnbanEvent> =
				serde_json::from_str(raw_json).context("parse channel.unban notification")?;
			let ev = msg.payload.event;

			Ok(Some(Event {
				broadcaster_id: BroadcasterId::new(ev.broadcaster_user_id)
					.context("construct BroadcasterId from broadcaster_user_id")?,
				broadcaster_user_name: ev.broadcaster_user_name,
				received_at,
				payload: EventPayload::Unban(UnbanEvent {
					moderator_user_login: ev.moderator_user_login,
					user_login: ev.user_login,
				}),
			}))
		}

		_ => Ok(None),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const WELCOME: &str = r#"{
		"metadata": {
			"message_id": "96a3f3b5-5dec-4eed-908e-e11ee657416c",
			"message_type": "session_welcome",
			"message_timestamp": "2024-07-19T14:56:51.634234626Z"
		},
		"payload": {
			"session": {
				"id": "AQoQILE98gtqShGmLD7AM6yJThAB",
				"status": "connected",
				"connected_at": "2024-07-19T14:56:51.616329898Z",
				"keepalive_timeout_seconds": 10,
				"reconnect_url": null
			}
		}
	}"#;

	const CHAT_NOTIFICATION: &str = r##"{
		"metadata": {
			"message_id": "befa7b53-d79d-478f-86b9-120f112b044e",
			"message_type": "notification",
			"message_timestamp": "2024-07-19T14:56:51.634234626Z",
			"subscription_type": "channel.chat.message",
			"subscription_version": "1"
		},
		"payload": {
			"subscription": {
				"id": "f1c2a387-161a-49f9-a165-0f21d7a4e1c4",
				"status": "enabled",
				"type": "channel.chat.message",
				"version": "1",
				"condition": {"broadcaster_user_id": "1971641", "user_id": "2914196"},
				"transport": {"method": "websocket", "session_id": "AQoQILE98gtqShGmLD7AM6yJThAB"},
				"created_at": "2024-07-19T14:56:51.368838757Z"
			},
			"event": {
				"broadcaster_user_id": "1971641",
				"broadcaster_user_login": "streamerfan",
				"broadcaster_user_name": "StreamerFan",
				"chatter_user_id": "4145994",
				"chatter_user_login": "viewer32",
				"chatter_user_name": "viewer32",
				"message_id": "cc106a89-1814-919d-454c-f4f2f970aae7",
				"message": {"text": "Hi chat"},
				"color": "#00FF7F"
			}
		}
	}"##;

	const BAN_NOTIFICATION: &str = r#"{
		"metadata": {
			"message_id": "84c1e79a-2521-4f85-93b2-3dc88cd64e2b",
			"message_type": "notification",
			"message_timestamp": "2024-07-19T18:15:11.634234626Z",
			"subscription_type": "channel.ban",
			"subscription_version": "1"
		},
		"payload": {
			"subscription": {
				"id": "4bc2a387-161a-49f9-a165-0f21d7a4e1c4",
				"status": "enabled",
				"type": "channel.ban",
				"version": "1",
				"condition": {"broadcaster_user_id": "1337", "user_id": "2914196"},
				"transport": {"method": "websocket", "session_id": "AQoQILE98gtqShGmLD7AM6yJThAB"},
				"created_at": "2024-07-19T14:56:51.368838757Z"
			},
			"event": {
				"user_id": "1234",
				"user_login": "cool_user",
				"user_name": "Cool_User",
				"broadcaster_user_id": "1337",
				"broadcaster_user_login": "cooler_user",
				"broadcaster_user_name": "Cooler_User",
				"moderator_user_id": "1339",
				"moderator_user_login": "mod_user",
				"moderator_user_name": "Mod_User",
				"reason": "Offensive language",
				"banned_at": "2024-07-19T18:15:11.17106713Z",
				"ends_at": "2024-07-19T18:16:11.17106713Z",
				"is_permanent": false
			}
		}
	}"#;

	const UNBAN_NOTIFICATION: &str = r#"{
		"metadata": {
			"message_id": "9932c09b-1bb4-4db8-8dde-35c1b42b4f67",
			"message_type": "notification",
			"message_timestamp": "2024-07-19T19:02:51.634234626Z",
			"subscription_type": "channel.unban",
			"subscription_version": "1"
		},
		"payload": {
			"subscription": {
				"id": "8df2a387-161a-49f9-a165-0f21d7a4e1c4",
				"status": "enabled",
				"type": "channel.unban",
				"version": "1",
				"condition": {"broadcaster_user_id": "1337", "user_id": "2914196"},
				"transport": {"method": "websocket", "session_id": "AQoQILE98gtqShGmLD7AM6yJThAB"},
				"created_at": "2024-07-19T14:56:51.368838757Z"
			},
			"event": {
				"user_id": "1234",
				"user_login": "cool_user",
				"user_name": "Cool_User",
				"broadcaster_user_id": "1337",
				"broadcaster_user_login": "cooler_user",
				"broadcaster_user_name": "Cooler_User",
				"moderator_user_id": "1339",
				"moderator_user_login": "mod_user",
				"moderator_user_name": "Mod_User"
			}
		}
	}"#;

	const RECONNECT: &str = r#"{
		"metadata": {
			"message_id": "84c1e79a-2521-4f85-93b2-3dc88cd64e2b",
			"message_type": "session_reconnect",
			"message_timestamp": "2024-07-19T20:11:12.634234626Z"
		},
		"payload": {
			"session": {
				"id": "AQoQexAWVYKSTIu4ec_2VAxyuhAB",
				"status": "reconnecting",
				"keepalive_timeout_seconds": null,
				"reconnect_url": "wss://eventsub.wss.twitch.tv/ws?challenge=reconnect"
			}
		}
	}"#;

	const REVOCATION: &str = r#"{
		"metadata": {
			"message_id": "84c1e79a-2521-4f85-93b2-3dc88cd64e2b",
			"message_type": "revocation",
			"message_timestamp": "2024-07-19T21:00:00.634234626Z",
			"subscription_type": "channel.chat.message",
			"subscription_version": "1"
		},
		"payload": {
			"subscription": {
				"id": "f1c2a387-161a-49f9-a165-0f21d7a4e1c4",
				"status": "authorization_revoked",
				"type": "channel.chat.message",
				"version": "1",
				"condition": {"broadcaster_user_id": "1971641", "user_id": "2914196"},
				"transport": {"method": "websocket", "session_id": "AQoQILE98gtqShGmLD7AM6yJThAB"},
				"created_at": "2024-07-19T14:56:51.368838757Z"
			}
		}
	}"#;

	#[test]
	fn parses_welcome_session_id() {
		assert_eq!(peek_message_type(WELCOME).unwrap(), "session_welcome");

		let welcome = parse_welcome(WELCOME).unwrap();
		assert_eq!(welcome.payload.session.id, "AQoQILE98gtqShGmLD7AM6yJThAB");
		assert_eq!(welcome.payload.session.keepalive_timeout_seconds, Some(10));
	}

	#[test]
	fn normalizes_chat_message_notification() {
		let now = SystemTime::now();
		let ev = event_from_notification(CHAT_NOTIFICATION, now).unwrap().unwrap();

		assert_eq!(ev.broadcaster_id.as_str(), "1971641");
		assert_eq!(ev.broadcaster_user_name, "StreamerFan");
		assert_eq!(ev.received_at, now);

		match ev.payload {
			EventPayload::ChatMessage(m) => {
				assert_eq!(m.chatter_user_name, "viewer32");
				assert_eq!(m.text, "Hi chat");
				assert_eq!(m.color, "#00FF7F");
			}
			other => panic!("expected ChatMessage payload, got: {other:?}"),
		}
	}

	#[test]
	fn normalizes_timeout_ban_notification() {
		let ev = event_from_notification(BAN_NOTIFICATION, SystemTime::now()).unwrap().unwrap();

		assert_eq!(ev.broadcaster_id.as_str(), "1337");

		match ev.payload {
			EventPayload::Ban(b) => {
				assert_eq!(b.moderator_user_login, "mod_user");
				assert_eq!(b.user_login, "cool_user");
				assert!(!b.is_permanent);
				assert!(b.banned_at.is_some());
				assert!(b.ends_at.is_some());
				assert_eq!(b.reason.as_deref(), Some("Offensive language"));
			}
			other => panic!("expected Ban payload, got: {other:?}"),
		}
	}

	#[test]
	fn normalizes_permanent_ban_without_ends_at() {
		let raw = BAN_NOTIFICATION
			.replace("\"ends_at\": \"2024-07-19T18:16:11.17106713Z\"", "\"ends_at\": null")
			.replace("\"is_permanent\": false", "\"is_permanent\": true");

		let ev = event_from_notification(&raw, SystemTime::now()).unwrap().unwrap();
		match ev.payload {
			EventPayload::Ban(b) => {
				assert!(b.is_permanent);
				assert!(b.ends_at.is_none());
			}
			other => panic!("expected Ban payload, got: {other:?}"),
		}
	}

	#[test]
	fn normalizes_unban_notification() {
		let ev = event_from_notification(UNBAN_NOTIFICATION, SystemTime::now())
			.unwrap()
			.unwrap();

		match ev.payload {
			EventPayload::Unban(u) => {
				assert_eq!(u.moderator_user_login, "mod_user");
				assert_eq!(u.user_login, "cool_user");
			}
			other => panic!("expected Unban payload, got: {other:?}"),
		}
	}

	#[test]
	fn recognizes_reconnect_and_revocation_frames() {
		assert_eq!(peek_message_type(RECONNECT).unwrap(), "session_reconnect");
		assert_eq!(peek_message_type(REVOCATION).unwrap(), "revocation");

		// Neither frame is a notification, so neither yields an event.
		assert!(event_from_notification(RECONNECT, SystemTime::now()).unwrap().is_none());
		assert!(event_from_notification(REVOCATION, SystemTime::now()).unwrap().is_none());
	}

	#[test]
	fn unknown_subscription_type_yields_no_event() {
		let raw = CHAT_NOTIFICATION.replace("channel.chat.message", "channel.follow");
		assert!(event_from_notification(&raw, SystemTime::now()).unwrap().is_none());
	}

	#[test]
	fn malformed_frames_are_errors() {
		assert!(peek_message_type("not json").is_err());
		assert!(event_from_notification("{\"metadata\":{}}", SystemTime::now()).is_err());

		let truncated = &CHAT_NOTIFICATION[..CHAT_NOTIFICATION.len() / 2];
		assert!(event_from_notification(truncated, SystemTime::now()).is_err());
	}
}
