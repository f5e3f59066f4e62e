#![forbid(unsafe_code)]

//! Wire types and parsers for the upstream EventSub-style websocket
//! protocol. Notifications are normalized into [`InboundEvent`]s with
//! the raw event object kept as JSON; per-topic decoding happens in the
//! handlers, not here.

use std::time::SystemTime;

use anyhow::Context;
use serde::Deserialize;
use siren_domain::{TenantId, TopicType};

use crate::InboundEvent;

/// Metadata present on every websocket message.
#[allow(dead_code)]
#[derive(Debug, Deserialize)]
pub struct EventSubMetadata {
	pub message_id: String,
	pub message_type: String,
	pub message_timestamp: String,

	#[serde(default)]
	pub subscription_type: Option<String>,
	#[serde(default)]
	pub subscription_version: Option<String>,
}

/// A lightweight peek struct to cheaply inspect message_type/subscription_type.
#[derive(Debug, Deserialize)]
struct EventSubMetadataPeek {
	metadata: EventSubMetadataPeekInner,
}

#[derive(Debug, Deserialize)]
struct EventSubMetadataPeekInner {
	message_type: String,
	#[serde(default)]
	subscription_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EventSubWelcomeMessage {
	#[allow(dead_code)]
	pub metadata: EventSubMetadata,
	pub payload: EventSubWelcomePayload,
}

#[derive(Debug, Deserialize)]
pub struct EventSubWelcomePayload {
	pub session: EventSubWelcomeSession,
}

#[derive(Debug, Deserialize)]
pub struct EventSubWelcomeSession {
	pub id: String,

	#[allow(dead_code)]
	pub status: String,
	#[allow(dead_code)]
	pub connected_at: String,

	#[serde(default)]
	pub keepalive_timeout_seconds: Option<u64>,

	#[allow(dead_code)]
	#[serde(default)]
	pub reconnect_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EventSubReconnectMessage {
	#[allow(dead_code)]
	pub metadata: EventSubMetadata,
	pub payload: EventSubReconnectPayload,
}

#[derive(Debug, Deserialize)]
pub struct EventSubReconnectPayload {
	pub session: EventSubReconnectSession,
}

#[derive(Debug, Deserialize)]
pub struct EventSubReconnectSession {
	#[allow(dead_code)]
	pub id: String,
	#[allow(dead_code)]
	pub status: String,

	pub reconnect_url: String,

	#[allow(dead_code)]
	pub connected_at: String,
}

#[derive(Debug, Deserialize)]
pub struct EventSubRevocationMessage {
	#[allow(dead_code)]
	pub metadata: EventSubMetadata,
	pub payload: EventSubRevocationPayload,
}

#[derive(Debug, Deserialize)]
pub struct EventSubRevocationPayload {
	pub subscription: EventSubSubscription,
}

#[derive(Debug, Deserialize)]
pub struct EventSubNotificationMessage {
	pub metadata: EventSubMetadata,
	pub payload: EventSubNotificationPayload,
}

#[derive(Debug, Deserialize)]
pub struct EventSubNotificationPayload {
	pub subscription: EventSubSubscription,
	pub event: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct EventSubSubscription {
	#[allow(dead_code)]
	pub id: String,

	pub status: String,
	#[serde(rename = "type")]
	pub r#type: String,
}

/// Extract `metadata.message_type` from a raw WS JSON string.
pub fn peek_message_type(raw_json: &str) -> anyhow::Result<String> {
	let peek: EventSubMetadataPeek = serde_json::from_str(raw_json).context("parse EventSub metadata peek")?;
	Ok(peek.metadata.message_type)
}

/// Parse a raw WS message as `session_welcome`.
pub fn parse_welcome(raw_json: &str) -> anyhow::Result<EventSubWelcomeMessage> {
	serde_json::from_str(raw_json).context("parse session_welcome")
}

/// Parse a raw WS message as `session_reconnect`.
pub fn parse_reconnect(raw_json: &str) -> anyhow::Result<EventSubReconnectMessage> {
	serde_json::from_str(raw_json).context("parse session_reconnect")
}

/// Parse a raw WS message as `revocation`.
pub fn parse_revocation(raw_json: &str) -> anyhow::Result<EventSubRevocationMessage> {
	serde_json::from_str(raw_json).context("parse revocation")
}

/// Parse a raw WS message as `notification`.
pub fn parse_notification(raw_json: &str) -> anyhow::Result<EventSubNotificationMessage> {
	serde_json::from_str(raw_json).context("parse notification")
}

/// Convert a `metadata.message_timestamp` RFC3339 timestamp into `SystemTime`.
///
/// EventSub timestamps are RFC3339 with fractional seconds and Zulu (UTC).
pub fn parse_message_timestamp_system_time(ts: &str) -> anyhow::Result<SystemTime> {
	let dt = chrono::DateTime::parse_from_rfc3339(ts).context("parse EventSub RFC3339 timestamp")?;
	Ok(SystemTime::from(dt.with_timezone(&chrono::Utc)))
}

/// Normalize a raw WS message into an [`InboundEvent`].
///
/// Returns `Ok(None)` when the message is not a `notification` (welcome,
/// keepalive, reconnect and revocation frames are handled by the session
/// loop itself).
pub fn try_normalize_notification(raw_json: &str) -> anyhow::Result<Option<InboundEvent>> {
	let peek: EventSubMetadataPeek = serde_json::from_str(raw_json).context("parse EventSub metadata peek")?;
	if peek.metadata.message_type != "notification" {
		return Ok(None);
	}

	let msg = parse_notification(raw_json)?;

	let topic_raw = msg
		.metadata
		.subscription_type
		.unwrap_or_else(|| msg.payload.subscription.r#type.clone());
	let topic = TopicType::new(topic_raw).context("construct TopicType from subscription_type")?;

	let platform_time = parse_message_timestamp_system_time(&msg.metadata.message_timestamp).ok();
	let tenant_hint = extract_tenant_hint(&msg.payload.event);

	Ok(Some(InboundEvent {
		topic,
		tenant_hint,
		payload: msg.payload.event,
		platform_time,
		received_at: SystemTime::now(),
	}))
}

/// Best-effort tenant extraction from the event object.
///
/// Most topics carry `broadcaster_user_id`; raids target
/// `to_broadcaster_user_id`. Handlers re-derive the tenant from their
/// decoded payloads, the hint only serves logging and metrics.
fn extract_tenant_hint(event: &serde_json::Value) -> Option<TenantId> {
	let id = event
		.get("broadcaster_user_id")
		.or_else(|| event.get("to_broadcaster_user_id"))?
		.as_str()?;
	TenantId::new(id).ok()
}

#[cfg(test)]
mod tests {
	use proptest::prelude::*;

	use super::*;

	fn follow_notification() -> String {
		serde_json::json!({
			"metadata": {
				"message_id": "befa7b53-d79d-478f-86b9-120f112b044e",
				"message_type": "notification",
				"message_timestamp": "2026-08-12T19:16:27.123Z",
				"subscription_type": "channel.follow",
				"subscription_version": "2"
			},
			"payload": {
				"subscription": {
					"id": "f1c2a387-161a-49f9-a165-0f21d7a4e1c4",
					"status": "enabled",
					"type": "channel.follow"
				},
				"event": {
					"user_id": "1234",
					"user_login": "cool_user",
					"user_name": "Cool_User",
					"broadcaster_user_id": "1337",
					"broadcaster_user_login": "cooler_user",
					"broadcaster_user_name": "Cooler_User",
					"followed_at": "2026-08-12T19:16:27.0Z"
				}
			}
		})
		.to_string()
	}

	#[test]
	fn normalizes_follow_notification() {
		let ev = try_normalize_notification(&follow_notification())
			.expect("parse")
			.expect("is a notification");
		assert_eq!(ev.topic.as_str(), "channel.follow");
		assert_eq!(ev.tenant_hint.as_ref().map(|t| t.as_str()), Some("1337"));
		assert_eq!(ev.payload["user_login"], "cool_user");
		assert!(ev.platform_time.is_some());
	}

	#[test]
	fn keepalive_is_not_a_notification() {
		let raw = serde_json::json!({
			"metadata": {
				"message_id": "84c1e79a-2a4b-4c13-ba0b-4312293e9308",
				"message_type": "session_keepalive",
				"message_timestamp": "2026-08-12T19:16:27.123Z"
			},
			"payload": {}
		})
		.to_string();
		assert!(try_normalize_notification(&raw).expect("parse").is_none());
	}

	#[test]
	fn raid_tenant_hint_uses_target_broadcaster() {
		let raw = serde_json::json!({
			"metadata": {
				"message_id": "x",
				"message_type": "notification",
				"message_timestamp": "2026-08-12T19:16:27.123Z",
				"subscription_type": "channel.raid"
			},
			"payload": {
				"subscription": {"id": "s", "status": "enabled", "type": "channel.raid"},
				"event": {
					"from_broadcaster_user_id": "9001",
					"to_broadcaster_user_id": "1337",
					"viewers": 42
				}
			}
		})
		.to_string();
		let ev = try_normalize_notification(&raw).expect("parse").expect("notification");
		assert_eq!(ev.tenant_hint.as_ref().map(|t| t.as_str()), Some("1337"));
	}

	#[test]
	fn parses_welcome_session_fields() {
		let raw = serde_json::json!({
			"metadata": {
				"message_id": "w",
				"message_type": "session_welcome",
				"message_timestamp": "2026-08-12T19:16:27.123Z"
			},
			"payload": {
				"session": {
					"id": "AgoQgttm",
					"status": "connected",
					"connected_at": "2026-08-12T19:16:27.0Z",
					"keepalive_timeout_seconds": 10,
					"reconnect_url": null
				}
			}
		})
		.to_string();
		let welcome = parse_welcome(&raw).expect("welcome");
		assert_eq!(welcome.payload.session.id, "AgoQgttm");
		assert_eq!(welcome.payload.session.keepalive_timeout_seconds, Some(10));
	}

	proptest! {
		#[test]
		fn peek_never_panics_on_arbitrary_input(raw in ".*") {
			let _ = peek_message_type(&raw);
			let _ = try_normalize_notification(&raw);
		}

		#[test]
		fn timestamp_parser_never_panics(raw in ".*") {
			let _ = parse_message_timestamp_system_time(&raw);
		}
	}
}
