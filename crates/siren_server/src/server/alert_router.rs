#![forbid(unsafe_code)]

use std::sync::Arc;

use siren_domain::{AlertKind, MappedAlert, TenantId};
use siren_platform::discord::DiscordSink;
use tracing::{debug, warn};

use super::overlay_hub::{OverlayFrame, OverlayHub};
use super::stores::TenantConfigStore;

/// Maps raw events onto per-tenant alerts and fans them out.
///
/// Suppression is decided before any sink is touched: a tenant mapping
/// of `none` means neither the overlay nor Discord sees the event.
pub struct AlertRouter {
	tenants: Arc<dyn TenantConfigStore>,
	hub: OverlayHub,
	discord: Arc<dyn DiscordSink>,
}

impl AlertRouter {
	pub fn new(tenants: Arc<dyn TenantConfigStore>, hub: OverlayHub, discord: Arc<dyn DiscordSink>) -> Self {
		Self { tenants, hub, discord }
	}

	pub fn hub(&self) -> &OverlayHub {
		&self.hub
	}

	/// Route one event for one tenant.
	///
	/// `event_key` is the raw event kind the mapping is keyed by;
	/// `default_alert` applies when the tenant has no entry for it.
	pub async fn route(&self, tenant: &TenantId, event_key: &str, default_alert: &AlertKind, payload: serde_json::Value) {
		let mapping = match self.tenants.alert_mapping(tenant).await {
			Ok(m) => m,
			Err(e) => {
				warn!(%tenant, event_key, error = ?e, "failed to load alert mapping; using defaults");
				Default::default()
			}
		};

		let effective = match mapping.get(event_key) {
			Some(MappedAlert::Suppress) => {
				debug!(%tenant, event_key, "alert suppressed by tenant mapping");
				metrics::counter!("siren_alerts_suppressed_total").increment(1);
				return;
			}
			Some(MappedAlert::Alert(kind)) => kind.clone(),
			None => default_alert.clone(),
		};

		metrics::counter!("siren_alerts_routed_total").increment(1);

		self.hub
			.broadcast(
				tenant,
				OverlayFrame::Alert {
					alert: effective.as_str().to_string(),
					payload: payload.clone(),
				},
			)
			.await;

		match self.tenants.discord_webhook(tenant).await {
			Ok(Some(webhook_url)) => {
				// Fire and forget off the handler worker: a slow webhook
				// endpoint must not stall same-topic delivery for other
				// tenants.
				let line = render_discord_line(&effective, &payload);
				let discord = Arc::clone(&self.discord);
				let tenant = tenant.clone();
				let event_key = event_key.to_string();
				tokio::spawn(async move {
					if let Err(e) = discord.send(&webhook_url, &line).await {
						warn!(%tenant, event_key, error = ?e, "discord mirror failed");
					}
				});
			}
			Ok(None) => {}
			Err(e) => {
				warn!(%tenant, event_key, error = ?e, "failed to load discord webhook");
			}
		}
	}
}

/// Plain-text rendering for the Discord mirror.
fn render_discord_line(alert: &AlertKind, payload: &serde_json::Value) -> String {
	let who = payload
		.get("user_name")
		.or_else(|| payload.get("user_login"))
		.or_else(|| payload.get("payer_login"))
		.and_then(|v| v.as_str());

	match who {
		Some(name) => format!("[{alert}] {name}"),
		None => format!("[{alert}]"),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn discord_line_prefers_display_name() {
		let alert = AlertKind::new("follow").expect("kind");
		let line = render_discord_line(
			&alert,
			&serde_json::json!({"user_name": "Cool_User", "user_login": "cool_user"}),
		);
		assert_eq!(line, "[follow] Cool_User");
	}

	#[test]
	fn discord_line_without_user_is_bare() {
		let alert = AlertKind::new("raid").expect("kind");
		assert_eq!(render_discord_line(&alert, &serde_json::json!({})), "[raid]");
	}
}
