#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use siren_domain::{AlertKind, topics};
use siren_platform::InboundEvent;

use super::tenant_from_broadcaster;
use crate::server::alert_router::AlertRouter;
use crate::server::overlay_hub::OverlayFrame;
use crate::server::registry::EventHandler;
use crate::server::stores::CounterStore;

#[derive(Debug, Deserialize)]
struct SubscribeEvent {
	broadcaster_user_id: String,
	user_login: String,
	user_name: String,
	tier: String,
	#[serde(default)]
	is_gift: bool,
}

pub struct SubscribeHandler {
	router: Arc<AlertRouter>,
	counters: Arc<dyn CounterStore>,
}

impl SubscribeHandler {
	pub fn new(router: Arc<AlertRouter>, counters: Arc<dyn CounterStore>) -> Self {
		Self { router, counters }
	}
}

#[async_trait]
impl EventHandler for SubscribeHandler {
	fn topic(&self) -> &str {
		topics::CHANNEL_SUBSCRIBE
	}

	async fn handle(&self, event: InboundEvent) -> anyhow::Result<()> {
		let ev: SubscribeEvent = serde_json::from_value(event.payload).context("decode channel.subscribe event")?;
		let tenant = tenant_from_broadcaster(&ev.broadcaster_user_id)?;

		let subs = self.counters.increment(&tenant, "subs", 1).await?;
		self.router
			.hub()
			.broadcast(
				&tenant,
				OverlayFrame::CounterUpdate {
					kind: "subs".to_string(),
					value: subs,
				},
			)
			.await;

		let default_alert = AlertKind::new("subscriber")?;
		let payload = serde_json::json!({
			"user_login": ev.user_login,
			"user_name": ev.user_name,
			"tier": ev.tier,
			"is_gift": ev.is_gift,
		});
		self.router
			.route(&tenant, topics::CHANNEL_SUBSCRIBE, &default_alert, payload)
			.await;

		Ok(())
	}
}
