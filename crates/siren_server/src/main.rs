#![forbid(unsafe_code)]

mod config;
mod server;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use siren_domain::{TopicType, topics};
use siren_platform::provider::{ProviderClient, ProviderConfig};
use siren_platform::registrar::HttpSubscriptionRegistrar;
use siren_platform::session::{EventIngestionSession, SessionConfig};
use siren_platform::{SecretString, discord::DiscordWebhookSink};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::server::alert_router::AlertRouter;
use crate::server::commands::ChatCommandProcessor;
use crate::server::connection::run_overlay_listener;
use crate::server::dispatcher::spawn_dispatcher;
use crate::server::donations::{DonationLedger, DonationStore, ProviderDonationVerifier};
use crate::server::eligibility::{EligibilityCache, EligibilityService, ProviderModeratorProbe};
use crate::server::handlers::chat::ChatMessageHandler;
use crate::server::handlers::cheer::CheerHandler;
use crate::server::handlers::follow::FollowHandler;
use crate::server::handlers::raid::RaidHandler;
use crate::server::handlers::subscribe::SubscribeHandler;
use crate::server::http::{HealthState, spawn_http_server};
use crate::server::overlay_hub::{OverlayHub, OverlayHubConfig};
use crate::server::registry::{EventHandler, HandlerRegistry, HandlerRegistryConfig};
use crate::server::stores::{LoggingChatSink, MemoryCounterStore, MemoryTenantResolver, MemoryTenantStore};

const DEFAULT_API_BASE_URL: &str = "https://api.twitch.tv/helix/";
const DEFAULT_EVENTSUB_WS_URL: &str = "wss://eventsub.wss.twitch.tv/ws";

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,siren_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("siren_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

fn subscribed_topics() -> Vec<TopicType> {
	[
		topics::CHANNEL_FOLLOW,
		topics::CHANNEL_SUBSCRIBE,
		topics::CHANNEL_CHEER,
		topics::CHANNEL_RAID,
		topics::CHANNEL_CHAT_MESSAGE,
	]
	.iter()
	.filter_map(|t| TopicType::new(*t).ok())
	.collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let config_path = crate::config::default_config_path()?;
	let cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(cfg.server.metrics_bind.as_deref());

	let provider = ProviderClient::new(ProviderConfig {
		base_url: cfg
			.platform
			.api_base_url
			.clone()
			.unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string()),
		client_id: cfg.platform.client_id.clone().unwrap_or_default(),
		bearer_token: cfg
			.platform
			.token
			.clone()
			.unwrap_or_else(|| SecretString::new(String::new())),
	})?;

	// Seeded stores. Tenant settings and payer claims come straight
	// from the config file; counters live in memory until a tenant
	// enables persistence for them.
	let tenants = MemoryTenantStore::new();
	let resolver = MemoryTenantResolver::new();
	let counters = MemoryCounterStore::new();
	for (tenant, settings) in cfg.tenants.iter().cloned() {
		tenants.upsert(tenant, settings).await;
	}
	for (payer, tenant) in cfg.payer_claims.iter().cloned() {
		resolver.claim(payer, tenant).await;
	}
	info!(tenants = cfg.tenants.len(), payer_claims = cfg.payer_claims.len(), "tenant config seeded");

	let (donation_store, eligibility_cache) = if cfg.persistence.enabled {
		let database_url = cfg
			.persistence
			.database_url
			.as_deref()
			.context("persistence enabled but no database_url configured")?;
		(
			DonationStore::connect(database_url).await?,
			EligibilityCache::connect(database_url).await?,
		)
	} else {
		(DonationStore::in_memory(), EligibilityCache::in_memory())
	};

	let hub = OverlayHub::new(OverlayHubConfig::default());
	let discord = Arc::new(DiscordWebhookSink::new()?);
	let router = Arc::new(AlertRouter::new(tenants.clone(), hub.clone(), discord));

	let webhook_secret = cfg
		.donations
		.webhook_secret
		.clone()
		.unwrap_or_else(|| SecretString::new(String::new()));
	if webhook_secret.expose().is_empty() {
		warn!("donation config: no webhook_secret configured; signed webhooks will be rejected");
	}
	let verifier = Arc::new(ProviderDonationVerifier::new(provider.clone(), webhook_secret));
	let ledger = Arc::new(DonationLedger::new(
		donation_store,
		verifier,
		resolver.clone(),
		Arc::clone(&router),
	));

	let eligibility_ttl = Duration::from_secs(cfg.persistence.eligibility_ttl_secs.unwrap_or(300));
	let probe = Arc::new(ProviderModeratorProbe::new(provider.clone()));
	let eligibility = Arc::new(EligibilityService::new(eligibility_cache, probe, eligibility_ttl));

	let bot_user_id = cfg.platform.bot_user_id.clone().unwrap_or_default();
	if bot_user_id.is_empty() {
		warn!("platform config: no bot_user_id configured; chat replies stay disabled");
	}
	let processor = Arc::new(ChatCommandProcessor::new(
		tenants.clone(),
		counters.clone(),
		Arc::new(LoggingChatSink),
		Arc::clone(&eligibility),
		hub.clone(),
		bot_user_id,
	));

	let handlers: Vec<Arc<dyn EventHandler>> = vec![
		Arc::new(FollowHandler::new(Arc::clone(&router), counters.clone())),
		Arc::new(SubscribeHandler::new(Arc::clone(&router), counters.clone())),
		Arc::new(CheerHandler::new(Arc::clone(&router), counters.clone())),
		Arc::new(RaidHandler::new(Arc::clone(&router))),
		Arc::new(ChatMessageHandler::new(Arc::clone(&processor))),
	];
	let registry = Arc::new(HandlerRegistry::new(handlers, HandlerRegistryConfig::default())?);

	// Register subscriptions for every explicit broadcaster id plus
	// every tenant section; the tenant id doubles as broadcaster id.
	let mut broadcaster_ids = cfg.platform.broadcaster_ids.clone();
	for (tenant, _) in &cfg.tenants {
		if !broadcaster_ids.iter().any(|b| b == tenant.as_str()) {
			broadcaster_ids.push(tenant.as_str().to_string());
		}
	}
	let registrar = Arc::new(HttpSubscriptionRegistrar::new(
		provider.clone(),
		broadcaster_ids,
		subscribed_topics(),
	));

	let mut session_cfg = SessionConfig::new(
		cfg.platform
			.eventsub_ws_url
			.clone()
			.unwrap_or_else(|| DEFAULT_EVENTSUB_WS_URL.to_string()),
	);
	if let Some(min) = cfg.platform.reconnect_min_delay {
		session_cfg.reconnect_min_delay = min;
	}
	if let Some(max) = cfg.platform.reconnect_max_delay {
		session_cfg.reconnect_max_delay = max;
	}

	let session = EventIngestionSession::new(session_cfg);
	let (handle, events_rx) = session.spawn(8, 1024);
	let dispatcher = spawn_dispatcher(events_rx, Arc::clone(&registry), registrar);

	let health = HealthState::new();
	let http_bind = cfg.server.http_bind.parse().context("parse http bind address")?;
	spawn_http_server(http_bind, health.clone(), Arc::clone(&ledger));
	info!(%http_bind, "http ingress listening");

	health.mark_ready();

	let overlay_bind = cfg.server.overlay_bind.parse().context("parse overlay bind address")?;
	tokio::select! {
		res = run_overlay_listener(overlay_bind, hub, counters.clone()) => {
			res?;
		}
		_ = tokio::signal::ctrl_c() => {
			info!("shutdown signal received");
		}
	}

	if let Err(e) = handle.stop().await {
		warn!(error = ?e, "session terminated with error");
	}
	dispatcher.abort();

	Ok(())
}
