#![forbid(unsafe_code)]

//! Topic subscription registration against the provider API.
//!
//! Every fresh websocket session id needs its topic subscriptions
//! re-created; migrated sessions keep theirs, so registration only runs
//! when the session id actually changes.

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use siren_domain::TopicType;
use tracing::{debug, info};

use crate::provider::{ProviderClient, send_with_retry};

const SUBSCRIPTIONS_PATH: &str = "eventsub/subscriptions";

/// Registers topic interest for a live session id.
#[async_trait]
pub trait SubscriptionRegistrar: Send + Sync {
	async fn register(&self, session_id: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Serialize)]
struct WebsocketTransport<'a> {
	method: &'static str,
	session_id: &'a str,
}

#[derive(Debug, Serialize)]
struct BroadcasterCondition<'a> {
	broadcaster_user_id: &'a str,
}

#[derive(Debug, Serialize)]
struct CreateSubscriptionRequest<'a> {
	#[serde(rename = "type")]
	r#type: &'a str,
	version: &'static str,
	condition: BroadcasterCondition<'a>,
	transport: WebsocketTransport<'a>,
}

/// Registrar backed by the provider REST API.
///
/// Registers the cartesian product of configured tenants and topics.
pub struct HttpSubscriptionRegistrar {
	provider: ProviderClient,
	broadcaster_ids: Vec<String>,
	topics: Vec<TopicType>,
}

impl HttpSubscriptionRegistrar {
	pub fn new(provider: ProviderClient, broadcaster_ids: Vec<String>, topics: Vec<TopicType>) -> Self {
		Self {
			provider,
			broadcaster_ids,
			topics,
		}
	}

	async fn register_one(&self, session_id: &str, broadcaster_id: &str, topic: &TopicType) -> anyhow::Result<()> {
		let url = self.provider.url(SUBSCRIPTIONS_PATH)?;

		let req = CreateSubscriptionRequest {
			r#type: topic.as_str(),
			version: "1",
			condition: BroadcasterCondition {
				broadcaster_user_id: broadcaster_id,
			},
			transport: WebsocketTransport {
				method: "websocket",
				session_id,
			},
		};

		let resp = send_with_retry(
			self.provider.authed(self.provider.http().post(url)).json(&req),
			"POST eventsub/subscriptions",
		)
		.await
		.with_context(|| format!("create subscription (topic={topic}, broadcaster={broadcaster_id})"))?;

		let status = resp.status();

		// The provider answers 409 when the (session, topic, condition)
		// triple already exists, e.g. after a reconciliation pass.
		if status == StatusCode::CONFLICT {
			debug!(%topic, broadcaster_id, "subscription already exists");
			return Ok(());
		}

		let body = resp.text().await.context("create subscription read body")?;
		if !status.is_success() {
			anyhow::bail!("create subscription failed (topic={topic}): status={status} body={body}");
		}

		Ok(())
	}
}

#[async_trait]
impl SubscriptionRegistrar for HttpSubscriptionRegistrar {
	async fn register(&self, session_id: &str) -> anyhow::Result<()> {
		for broadcaster_id in &self.broadcaster_ids {
			for topic in &self.topics {
				self.register_one(session_id, broadcaster_id, topic).await?;
				metrics::counter!("siren_subscriptions_registered_total").increment(1);
			}
		}

		info!(
			session_id,
			tenants = self.broadcaster_ids.len(),
			topics = self.topics.len(),
			"registered topic subscriptions"
		);
		Ok(())
	}
}
