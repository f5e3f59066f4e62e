#![forbid(unsafe_code)]

//! Discord webhook delivery for mirrored alerts.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;

/// Outbound alert mirror. Delivery failures never block the overlay
/// path; the router logs and moves on.
#[async_trait]
pub trait DiscordSink: Send + Sync {
	async fn send(&self, webhook_url: &str, content: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
	content: &'a str,
}

/// Sink posting to per-tenant Discord webhook URLs.
#[derive(Clone)]
pub struct DiscordWebhookSink {
	http: reqwest::Client,
}

impl DiscordWebhookSink {
	pub fn new() -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.user_agent("siren/0.x (alert-pipeline)")
			.timeout(Duration::from_secs(10))
			.build()
			.context("build reqwest client")?;
		Ok(Self { http })
	}
}

#[async_trait]
impl DiscordSink for DiscordWebhookSink {
	async fn send(&self, webhook_url: &str, content: &str) -> anyhow::Result<()> {
		let resp = self
			.http
			.post(webhook_url)
			.json(&WebhookPayload { content })
			.send()
			.await
			.context("discord webhook send")?;

		let status = resp.status();
		if !status.is_success() {
			let body = resp.text().await.unwrap_or_default();
			anyhow::bail!("discord webhook failed: status={status} body={body}");
		}
		Ok(())
	}
}
