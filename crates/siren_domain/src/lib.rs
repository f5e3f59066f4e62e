#![forbid(unsafe_code)]

//! Core identifier and alert-mapping types shared by every siren crate.
//!
//! Everything here is deliberately plain data: newtypes over validated
//! strings plus the small enums that the ingestion, routing and command
//! layers all need to agree on.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Well-known upstream topic names.
pub mod topics {
	pub const CHANNEL_FOLLOW: &str = "channel.follow";
	pub const CHANNEL_SUBSCRIBE: &str = "channel.subscribe";
	pub const CHANNEL_CHEER: &str = "channel.cheer";
	pub const CHANNEL_RAID: &str = "channel.raid";
	pub const CHANNEL_CHAT_MESSAGE: &str = "channel.chat.message";
	pub const DONATION: &str = "donation";
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("identifier is empty")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
	#[error("unknown permission level: {0}")]
	UnknownPermission(String),
}

/// A tenant is one streamer channel. The id doubles as the upstream
/// broadcaster user id, so events carrying `broadcaster_user_id` map
/// onto tenants without a lookup table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
	pub fn new(raw: impl Into<String>) -> Result<Self, ParseIdError> {
		let raw = raw.into();
		if raw.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(raw))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for TenantId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for TenantId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::new(s)
	}
}

/// An upstream subscription topic such as `channel.follow`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TopicType(String);

impl TopicType {
	pub fn new(raw: impl Into<String>) -> Result<Self, ParseIdError> {
		let raw = raw.into();
		if raw.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(raw))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for TopicType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Provider-assigned transaction id for a donation. Uniqueness across
/// redeliveries is the whole point of this newtype.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(String);

impl TransactionId {
	pub fn new(raw: impl Into<String>) -> Result<Self, ParseIdError> {
		let raw = raw.into();
		if raw.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(raw))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for TransactionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Name of an overlay alert animation, e.g. `follow` or `raid`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlertKind(String);

impl AlertKind {
	pub fn new(raw: impl Into<String>) -> Result<Self, ParseIdError> {
		let raw = raw.into();
		if raw.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(raw))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for AlertKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// A tenant's configured mapping target for an event kind.
///
/// The literal string `none` (case-insensitive) is the suppression
/// sentinel: it means "no alert at all", not "an alert named none".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappedAlert {
	Suppress,
	Alert(AlertKind),
}

impl MappedAlert {
	pub fn parse(raw: &str) -> Result<Self, ParseIdError> {
		let trimmed = raw.trim();
		if trimmed.eq_ignore_ascii_case("none") {
			return Ok(Self::Suppress);
		}
		Ok(Self::Alert(AlertKind::new(trimmed)?))
	}
}

impl FromStr for MappedAlert {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::parse(s)
	}
}

impl fmt::Display for MappedAlert {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Suppress => f.write_str("none"),
			Self::Alert(kind) => f.write_str(kind.as_str()),
		}
	}
}

/// Chat permission tiers, ordered from least to most privileged so that
/// `chatter_level >= command_level` is a plain comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
	Viewer,
	Subscriber,
	Vip,
	Moderator,
	Broadcaster,
}

impl PermissionLevel {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Viewer => "viewer",
			Self::Subscriber => "subscriber",
			Self::Vip => "vip",
			Self::Moderator => "moderator",
			Self::Broadcaster => "broadcaster",
		}
	}
}

impl FromStr for PermissionLevel {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"viewer" | "everyone" => Ok(Self::Viewer),
			"subscriber" | "sub" => Ok(Self::Subscriber),
			"vip" => Ok(Self::Vip),
			"moderator" | "mod" => Ok(Self::Moderator),
			"broadcaster" | "streamer" => Ok(Self::Broadcaster),
			other => Err(ParseIdError::UnknownPermission(other.to_string())),
		}
	}
}

impl fmt::Display for PermissionLevel {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn tenant_id_rejects_empty() {
		assert_eq!(TenantId::new(""), Err(ParseIdError::Empty));
		assert_eq!(TenantId::new("   "), Err(ParseIdError::Empty));
		assert!(TenantId::new("141981764").is_ok());
	}

	#[test]
	fn topic_type_roundtrips() {
		let topic = TopicType::new(topics::CHANNEL_FOLLOW).expect("valid topic");
		assert_eq!(topic.as_str(), "channel.follow");
		assert_eq!(topic.to_string(), "channel.follow");
	}

	#[test]
	fn mapped_alert_none_is_suppression() {
		assert_eq!(MappedAlert::parse("none"), Ok(MappedAlert::Suppress));
		assert_eq!(MappedAlert::parse("NONE"), Ok(MappedAlert::Suppress));
		assert_eq!(MappedAlert::parse(" None "), Ok(MappedAlert::Suppress));
	}

	#[test]
	fn mapped_alert_other_strings_are_alert_kinds() {
		let mapped = MappedAlert::parse("confetti").expect("valid");
		assert_eq!(mapped, MappedAlert::Alert(AlertKind::new("confetti").expect("valid kind")));
	}

	#[test]
	fn mapped_alert_rejects_empty() {
		assert_eq!(MappedAlert::parse(""), Err(ParseIdError::Empty));
	}

	#[test]
	fn permission_levels_are_ordered() {
		assert!(PermissionLevel::Viewer < PermissionLevel::Subscriber);
		assert!(PermissionLevel::Subscriber < PermissionLevel::Vip);
		assert!(PermissionLevel::Vip < PermissionLevel::Moderator);
		assert!(PermissionLevel::Moderator < PermissionLevel::Broadcaster);
	}

	#[test]
	fn permission_level_parses_aliases() {
		assert_eq!("mod".parse::<PermissionLevel>(), Ok(PermissionLevel::Moderator));
		assert_eq!("Everyone".parse::<PermissionLevel>(), Ok(PermissionLevel::Viewer));
		assert!("owner".parse::<PermissionLevel>().is_err());
	}
}
