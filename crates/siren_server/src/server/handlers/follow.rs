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
struct FollowEvent {
	broadcaster_user_id: String,
	#[allow(dead_code)]
	user_id: String,
	user_login: String,
	user_name: String,
}

pub struct FollowHandler {
	router: Arc<AlertRouter>,
	counters: Arc<dyn CounterStore>,
}

impl FollowHandler {
	pub fn new(router: Arc<AlertRouter>, counters: Arc<dyn CounterStore>) -> Self {
		Self { router, counters }
	}
}

#[async_trait]
impl EventHandler for FollowHandler {
	fn topic(&self) -> &str {
		topics::CHANNEL_FOLLOW
	}

	async fn handle(&self, event: InboundEvent) -> anyhow::Result<()> {
		let ev: FollowEvent = serde_json::from_value(event.payload).context("decode channel.follow event")?;
		let tenant = tenant_from_broadcaster(&ev.broadcaster_user_id)?;

		let follows = self.counters.increment(&tenant, "follows", 1).await?;
		self.router
			.hub()
			.broadcast(
				&tenant,
				OverlayFrame::CounterUpdate {
					kind: "follows".to_string(),
					value: follows,
				},
			)
			.await;

		let default_alert = AlertKind::new("follow")?;
		let payload = serde_json::json!({
			"user_login": ev.user_login,
			"user_name": ev.user_name,
		});
		self.router
			.route(&tenant, topics::CHANNEL_FOLLOW, &default_alert, payload)
			.await;

		Ok(())
	}
}
