#![forbid(unsafe_code)]

//! External seams of the pipeline: tenant configuration, counters,
//! payer resolution and chat output. The server only talks to these
//! through traits; the in-memory implementations back both tests and
//! the config-file seeded deployment mode.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use siren_domain::{MappedAlert, TenantId};
use tokio::sync::Mutex;
use tracing::info;

use super::commands::CommandSpec;

/// Per-tenant configuration reads.
#[async_trait]
pub trait TenantConfigStore: Send + Sync {
	/// Raw event key → alert mapping for a tenant. Missing keys fall
	/// back to the event's default alert kind.
	async fn alert_mapping(&self, tenant: &TenantId) -> anyhow::Result<BTreeMap<String, MappedAlert>>;

	/// Chat commands configured for a tenant.
	async fn commands(&self, tenant: &TenantId) -> anyhow::Result<Vec<CommandSpec>>;

	/// Discord webhook URL for mirroring alerts, if the tenant set one.
	async fn discord_webhook(&self, tenant: &TenantId) -> anyhow::Result<Option<String>>;
}

/// Persistent per-tenant counters (follows, subs, bits, ...).
#[async_trait]
pub trait CounterStore: Send + Sync {
	/// Apply a delta and return the new value.
	async fn increment(&self, tenant: &TenantId, kind: &str, delta: i64) -> anyhow::Result<i64>;

	/// All counters for a tenant.
	async fn snapshot(&self, tenant: &TenantId) -> anyhow::Result<BTreeMap<String, i64>>;
}

/// Maps a donation payer login onto a tenant, when one claims it.
#[async_trait]
pub trait TenantResolver: Send + Sync {
	async fn tenant_for_payer(&self, payer_login: &str) -> anyhow::Result<Option<TenantId>>;
}

/// Outbound chat messages on behalf of the bot account.
#[async_trait]
pub trait ChatSink: Send + Sync {
	async fn send_chat(&self, tenant: &TenantId, text: &str) -> anyhow::Result<()>;
}

/// Full configuration of one tenant, as seeded from the config file.
#[derive(Debug, Clone, Default)]
pub struct TenantSettings {
	pub alert_mapping: BTreeMap<String, MappedAlert>,
	pub commands: Vec<CommandSpec>,
	pub discord_webhook: Option<String>,
}

/// In-memory tenant configuration.
#[derive(Default)]
pub struct MemoryTenantStore {
	tenants: Mutex<HashMap<TenantId, TenantSettings>>,
}

impl MemoryTenantStore {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub async fn upsert(&self, tenant: TenantId, settings: TenantSettings) {
		self.tenants.lock().await.insert(tenant, settings);
	}
}

#[async_trait]
impl TenantConfigStore for MemoryTenantStore {
	async fn alert_mapping(&self, tenant: &TenantId) -> anyhow::Result<BTreeMap<String, MappedAlert>> {
		Ok(self
			.tenants
			.lock()
			.await
			.get(tenant)
			.map(|s| s.alert_mapping.clone())
			.unwrap_or_default())
	}

	async fn commands(&self, tenant: &TenantId) -> anyhow::Result<Vec<CommandSpec>> {
		Ok(self
			.tenants
			.lock()
			.await
			.get(tenant)
			.map(|s| s.commands.clone())
			.unwrap_or_default())
	}

	async fn discord_webhook(&self, tenant: &TenantId) -> anyhow::Result<Option<String>> {
		Ok(self
			.tenants
			.lock()
			.await
			.get(tenant)
			.and_then(|s| s.discord_webhook.clone()))
	}
}

/// In-memory counters.
#[derive(Default)]
pub struct MemoryCounterStore {
	counters: Mutex<HashMap<TenantId, BTreeMap<String, i64>>>,
}

impl MemoryCounterStore {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
	async fn increment(&self, tenant: &TenantId, kind: &str, delta: i64) -> anyhow::Result<i64> {
		let mut counters = self.counters.lock().await;
		let slot = counters
			.entry(tenant.clone())
			.or_default()
			.entry(kind.to_string())
			.or_insert(0);
		*slot = slot.saturating_add(delta);
		Ok(*slot)
	}

	async fn snapshot(&self, tenant: &TenantId) -> anyhow::Result<BTreeMap<String, i64>> {
		Ok(self.counters.lock().await.get(tenant).cloned().unwrap_or_default())
	}
}

/// In-memory payer → tenant mapping.
#[derive(Default)]
pub struct MemoryTenantResolver {
	by_payer: Mutex<HashMap<String, TenantId>>,
}

impl MemoryTenantResolver {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub async fn claim(&self, payer_login: impl Into<String>, tenant: TenantId) {
		self.by_payer.lock().await.insert(payer_login.into().to_lowercase(), tenant);
	}
}

#[async_trait]
impl TenantResolver for MemoryTenantResolver {
	async fn tenant_for_payer(&self, payer_login: &str) -> anyhow::Result<Option<TenantId>> {
		Ok(self.by_payer.lock().await.get(&payer_login.to_lowercase()).cloned())
	}
}

/// Chat sink that only logs. Used until a tenant enables the real bot.
pub struct LoggingChatSink;

#[async_trait]
impl ChatSink for LoggingChatSink {
	async fn send_chat(&self, tenant: &TenantId, text: &str) -> anyhow::Result<()> {
		info!(%tenant, text, "chat sink (logging only)");
		Ok(())
	}
}
