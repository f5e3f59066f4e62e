#![forbid(unsafe_code)]

pub mod discord;
pub mod eventsub;
pub mod provider;
pub mod registrar;
pub mod session;

use std::fmt;
use std::time::SystemTime;

use anyhow::anyhow;
use siren_domain::{TenantId, TopicType};
use tokio::sync::mpsc;

/// Server → session control message.
#[derive(Debug)]
pub enum SessionControl {
	/// Request a graceful shutdown.
	Stop,
}

/// Session → server event message.
#[derive(Debug, Clone)]
pub enum SessionEvent {
	/// Normalized inbound platform event.
	Inbound(Box<InboundEvent>),

	/// Session lifecycle update.
	Status(SessionStatus),
}

/// Connection lifecycle states for the ingestion session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
	Disconnected,
	Connecting,
	Connected,
	Reconnecting,
	Closed,
}

impl SessionState {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Disconnected => "disconnected",
			Self::Connecting => "connecting",
			Self::Connected => "connected",
			Self::Reconnecting => "reconnecting",
			Self::Closed => "closed",
		}
	}
}

impl fmt::Display for SessionState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Session status event.
#[derive(Debug, Clone)]
pub struct SessionStatus {
	pub state: SessionState,

	/// Upstream-assigned websocket session id, present once welcomed.
	pub session_id: Option<String>,

	pub detail: String,
	pub last_error: Option<String>,
	pub time: SystemTime,
}

/// Normalized inbound event envelope.
#[derive(Debug, Clone)]
pub struct InboundEvent {
	pub topic: TopicType,

	/// Tenant the event belongs to, when the payload carries one.
	pub tenant_hint: Option<TenantId>,

	/// Raw event object as delivered by the platform.
	pub payload: serde_json::Value,

	/// Platform-side event timestamp (not for ordering).
	pub platform_time: Option<SystemTime>,

	/// Local receipt timestamp.
	pub received_at: SystemTime,
}

impl InboundEvent {
	pub fn new(topic: TopicType, payload: serde_json::Value) -> Self {
		Self {
			topic,
			tenant_hint: None,
			payload,
			platform_time: None,
			received_at: SystemTime::now(),
		}
	}
}

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

impl serde::Serialize for SecretString {
	fn serialize<S>(&self, serializer: S) -> Result<<S as serde::Serializer>::Ok, <S as serde::Serializer>::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_str("")
	}
}

impl<'de> serde::Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}

/// Helper types for wiring the ingestion session.
pub type SessionControlTx = mpsc::Sender<SessionControl>;
pub type SessionControlRx = mpsc::Receiver<SessionControl>;
pub type SessionEventTx = mpsc::Sender<SessionEvent>;
pub type SessionEventRx = mpsc::Receiver<SessionEvent>;

/// Build a standard bounded channel pair.
pub fn bounded_session_channels(
	control_capacity: usize,
	events_capacity: usize,
) -> (SessionControlTx, SessionControlRx, SessionEventTx, SessionEventRx) {
	let (control_tx, control_rx) = mpsc::channel(control_capacity);
	let (events_tx, events_rx) = mpsc::channel(events_capacity);
	(control_tx, control_rx, events_tx, events_rx)
}

/// Build a status event.
pub fn status(state: SessionState, session_id: Option<String>, detail: impl Into<String>) -> SessionEvent {
	SessionEvent::Status(SessionStatus {
		state,
		session_id,
		detail: detail.into(),
		last_error: None,
		time: SystemTime::now(),
	})
}

/// Build an error status event.
pub fn status_error(state: SessionState, detail: impl Into<String>, err: impl fmt::Display) -> SessionEvent {
	SessionEvent::Status(SessionStatus {
		state,
		session_id: None,
		detail: detail.into(),
		last_error: Some(err.to_string()),
		time: SystemTime::now(),
	})
}

/// Validate basic inbound-event invariants.
pub fn validate_inbound_event(ev: &InboundEvent) -> anyhow::Result<()> {
	if ev.topic.as_str().trim().is_empty() {
		return Err(anyhow!("inbound event topic must be non-empty"));
	}
	if !ev.payload.is_object() {
		return Err(anyhow!("inbound event payload must be a JSON object"));
	}
	Ok(())
}
