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
struct CheerEvent {
	broadcaster_user_id: String,
	is_anonymous: bool,
	#[serde(default)]
	user_login: Option<String>,
	#[serde(default)]
	user_name: Option<String>,
	#[serde(default)]
	message: Option<String>,
	bits: i64,
}

pub struct CheerHandler {
	router: Arc<AlertRouter>,
	counters: Arc<dyn CounterStore>,
}

impl CheerHandler {
	pub fn new(router: Arc<AlertRouter>, counters: Arc<dyn CounterStore>) -> Self {
		Self { router, counters }
	}
}

#[async_trait]
impl EventHandler for CheerHandler {
	fn topic(&self) -> &str {
		topics::CHANNEL_CHEER
	}

	async fn handle(&self, event: InboundEvent) -> anyhow::Result<()> {
		let ev: CheerEvent = serde_json::from_value(event.payload).context("decode channel.cheer event")?;
		let tenant = tenant_from_broadcaster(&ev.broadcaster_user_id)?;

		let bits = self.counters.increment(&tenant, "bits", ev.bits.max(0)).await?;
		self.router
			.hub()
			.broadcast(
				&tenant,
				OverlayFrame::CounterUpdate {
					kind: "bits".to_string(),
					value: bits,
				},
			)
			.await;

		let default_alert = AlertKind::new("cheer")?;
		let payload = serde_json::json!({
			"user_login": ev.user_login,
			"user_name": ev.user_name,
			"is_anonymous": ev.is_anonymous,
			"bits": ev.bits,
			"message": ev.message,
		});
		self.router.route(&tenant, topics::CHANNEL_CHEER, &default_alert, payload).await;

		Ok(())
	}
}
