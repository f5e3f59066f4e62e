#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use siren_domain::{AlertKind, topics};
use siren_platform::InboundEvent;

use super::tenant_from_broadcaster;
use crate::server::alert_router::AlertRouter;
use crate::server::registry::EventHandler;

#[derive(Debug, Deserialize)]
struct RaidEvent {
	#[allow(dead_code)]
	from_broadcaster_user_id: String,
	from_broadcaster_user_login: String,
	from_broadcaster_user_name: String,
	to_broadcaster_user_id: String,
	viewers: u64,
}

pub struct RaidHandler {
	router: Arc<AlertRouter>,
}

impl RaidHandler {
	pub fn new(router: Arc<AlertRouter>) -> Self {
		Self { router }
	}
}

#[async_trait]
impl EventHandler for RaidHandler {
	fn topic(&self) -> &str {
		topics::CHANNEL_RAID
	}

	async fn handle(&self, event: InboundEvent) -> anyhow::Result<()> {
		let ev: RaidEvent = serde_json::from_value(event.payload).context("decode channel.raid event")?;
		// The raided channel is the tenant, not the raider.
		let tenant = tenant_from_broadcaster(&ev.to_broadcaster_user_id)?;

		let default_alert = AlertKind::new("raid")?;
		let payload = serde_json::json!({
			"user_login": ev.from_broadcaster_user_login,
			"user_name": ev.from_broadcaster_user_name,
			"viewers": ev.viewers,
		});
		self.router.route(&tenant, topics::CHANNEL_RAID, &default_alert, payload).await;

		Ok(())
	}
}
