#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use siren_domain::{PermissionLevel, topics};
use siren_platform::InboundEvent;

use super::tenant_from_broadcaster;
use crate::server::commands::{ChatCommandProcessor, Chatter};
use crate::server::registry::EventHandler;

#[derive(Debug, Deserialize)]
struct ChatMessageEvent {
	broadcaster_user_id: String,
	chatter_user_id: String,
	chatter_user_login: String,
	message: ChatMessageContent,
	#[serde(default)]
	badges: Vec<ChatBadge>,
}

#[derive(Debug, Deserialize)]
struct ChatMessageContent {
	text: String,
}

#[derive(Debug, Deserialize)]
struct ChatBadge {
	set_id: String,
}

/// Map platform badge sets onto the command permission ladder.
fn permission_from_badges(badges: &[ChatBadge]) -> PermissionLevel {
	let mut level = PermissionLevel::Viewer;
	for badge in badges {
		let badge_level = match badge.set_id.as_str() {
			"broadcaster" => PermissionLevel::Broadcaster,
			"moderator" => PermissionLevel::Moderator,
			"vip" => PermissionLevel::Vip,
			"subscriber" | "founder" => PermissionLevel::Subscriber,
			_ => PermissionLevel::Viewer,
		};
		level = level.max(badge_level);
	}
	level
}

pub struct ChatMessageHandler {
	processor: Arc<ChatCommandProcessor>,
}

impl ChatMessageHandler {
	pub fn new(processor: Arc<ChatCommandProcessor>) -> Self {
		Self { processor }
	}
}

#[async_trait]
impl EventHandler for ChatMessageHandler {
	fn topic(&self) -> &str {
		topics::CHANNEL_CHAT_MESSAGE
	}

	async fn handle(&self, event: InboundEvent) -> anyhow::Result<()> {
		let ev: ChatMessageEvent = serde_json::from_value(event.payload).context("decode channel.chat.message event")?;
		let tenant = tenant_from_broadcaster(&ev.broadcaster_user_id)?;

		let chatter = Chatter {
			user_id: ev.chatter_user_id,
			login: ev.chatter_user_login,
			level: permission_from_badges(&ev.badges),
		};

		self.processor.process(&tenant, &chatter, &ev.message.text).await;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn badge(set_id: &str) -> ChatBadge {
		ChatBadge {
			set_id: set_id.to_string(),
		}
	}

	#[test]
	fn highest_badge_wins() {
		assert_eq!(permission_from_badges(&[]), PermissionLevel::Viewer);
		assert_eq!(permission_from_badges(&[badge("subscriber")]), PermissionLevel::Subscriber);
		assert_eq!(
			permission_from_badges(&[badge("subscriber"), badge("moderator")]),
			PermissionLevel::Moderator
		);
		assert_eq!(
			permission_from_badges(&[badge("broadcaster"), badge("subscriber")]),
			PermissionLevel::Broadcaster
		);
		assert_eq!(permission_from_badges(&[badge("artist")]), PermissionLevel::Viewer);
	}
}
