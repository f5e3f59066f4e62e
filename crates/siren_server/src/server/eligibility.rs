#![forbid(unsafe_code)]

//! TTL cache over the "is the bot a moderator here" check.
//!
//! The provider call is rate limited, so results are cached per
//! (broadcaster, bot) pair and expired lazily on read. A zero TTL
//! stores nothing usable: every lookup misses and hits the provider.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use siren_platform::provider::ProviderClient;
use sqlx::Row;
use tokio::sync::Mutex;
use tracing::warn;

/// Cached eligibility verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
	Allowed,
	Denied,
	/// The probe could not answer; never cached.
	Unknown,
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
	allowed: bool,
	expires_at_ms: i64,
}

/// Pluggable TTL cache keyed by (broadcaster, bot).
#[derive(Clone)]
pub struct EligibilityCache {
	backend: EligibilityBackend,
}

#[derive(Clone)]
enum EligibilityBackend {
	Memory(Arc<Mutex<HashMap<(String, String), CacheEntry>>>),
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

fn now_ms() -> i64 {
	chrono::Utc::now().timestamp_millis()
}

impl EligibilityCache {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		let cache = if database_url.starts_with("sqlite:") {
			let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
			Self {
				backend: EligibilityBackend::Sqlite(pool),
			}
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			Self {
				backend: EligibilityBackend::Postgres(pool),
			}
		} else {
			return Err(anyhow!("unsupported database_url for eligibility cache"));
		};

		cache.ensure_schema().await?;
		Ok(cache)
	}

	pub fn in_memory() -> Self {
		Self {
			backend: EligibilityBackend::Memory(Arc::new(Mutex::new(HashMap::new()))),
		}
	}

	async fn ensure_schema(&self) -> anyhow::Result<()> {
		let create = "CREATE TABLE IF NOT EXISTS eligibility_cache (\
			broadcaster_id TEXT NOT NULL, \
			bot_id TEXT NOT NULL, \
			allowed INTEGER NOT NULL, \
			expires_at_ms BIGINT NOT NULL, \
			PRIMARY KEY (broadcaster_id, bot_id))";

		match &self.backend {
			EligibilityBackend::Memory(_) => Ok(()),
			EligibilityBackend::Sqlite(pool) => {
				sqlx::query(create)
					.execute(pool)
					.await
					.context("create eligibility_cache table (sqlite)")?;
				Ok(())
			}
			EligibilityBackend::Postgres(pool) => {
				sqlx::query(create)
					.execute(pool)
					.await
					.context("create eligibility_cache table (postgres)")?;
				Ok(())
			}
		}
	}

	/// Fresh cached verdict, or `None` on miss/expiry.
	pub async fn try_get(&self, broadcaster_id: &str, bot_id: &str) -> anyhow::Result<Option<Eligibility>> {
		let now = now_ms();

		match &self.backend {
			EligibilityBackend::Memory(map) => {
				let mut map = map.lock().await;
				let key = (broadcaster_id.to_string(), bot_id.to_string());
				match map.get(&key) {
					Some(entry) if entry.expires_at_ms > now => Ok(Some(if entry.allowed {
						Eligibility::Allowed
					} else {
						Eligibility::Denied
					})),
					Some(_) => {
						map.remove(&key);
						Ok(None)
					}
					None => Ok(None),
				}
			}
			EligibilityBackend::Sqlite(pool) => {
				let row = sqlx::query(
					"SELECT allowed, expires_at_ms FROM eligibility_cache WHERE broadcaster_id = ? AND bot_id = ?",
				)
				.bind(broadcaster_id)
				.bind(bot_id)
				.fetch_optional(pool)
				.await
				.context("select eligibility (sqlite)")?;

				let Some(row) = row else { return Ok(None) };
				let expires_at_ms: i64 = row.try_get("expires_at_ms")?;
				if expires_at_ms <= now {
					return Ok(None);
				}
				let allowed: i64 = row.try_get("allowed")?;
				Ok(Some(if allowed != 0 { Eligibility::Allowed } else { Eligibility::Denied }))
			}
			EligibilityBackend::Postgres(pool) => {
				let row = sqlx::query(
					"SELECT allowed, expires_at_ms FROM eligibility_cache WHERE broadcaster_id = $1 AND bot_id = $2",
				)
				.bind(broadcaster_id)
				.bind(bot_id)
				.fetch_optional(pool)
				.await
				.context("select eligibility (postgres)")?;

				let Some(row) = row else { return Ok(None) };
				let expires_at_ms: i64 = row.try_get("expires_at_ms")?;
				if expires_at_ms <= now {
					return Ok(None);
				}
				let allowed: i32 = row.try_get("allowed")?;
				Ok(Some(if allowed != 0 { Eligibility::Allowed } else { Eligibility::Denied }))
			}
		}
	}

	/// Store a verdict for `ttl`. Only definite verdicts are cacheable.
	pub async fn set(&self, broadcaster_id: &str, bot_id: &str, allowed: bool, ttl: Duration) -> anyhow::Result<()> {
		let expires_at_ms = now_ms().saturating_add(ttl.as_millis().min(i64::MAX as u128) as i64);

		match &self.backend {
			EligibilityBackend::Memory(map) => {
				map.lock().await.insert(
					(broadcaster_id.to_string(), bot_id.to_string()),
					CacheEntry { allowed, expires_at_ms },
				);
				Ok(())
			}
			EligibilityBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO eligibility_cache (broadcaster_id, bot_id, allowed, expires_at_ms) VALUES (?, ?, ?, ?) \
					ON CONFLICT(broadcaster_id, bot_id) DO UPDATE SET allowed = excluded.allowed, expires_at_ms = excluded.expires_at_ms",
				)
				.bind(broadcaster_id)
				.bind(bot_id)
				.bind(i64::from(allowed))
				.bind(expires_at_ms)
				.execute(pool)
				.await
				.context("upsert eligibility (sqlite)")?;
				Ok(())
			}
			EligibilityBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO eligibility_cache (broadcaster_id, bot_id, allowed, expires_at_ms) VALUES ($1, $2, $3, $4) \
					ON CONFLICT (broadcaster_id, bot_id) DO UPDATE SET allowed = EXCLUDED.allowed, expires_at_ms = EXCLUDED.expires_at_ms",
				)
				.bind(broadcaster_id)
				.bind(bot_id)
				.bind(i32::from(allowed))
				.bind(expires_at_ms)
				.execute(pool)
				.await
				.context("upsert eligibility (postgres)")?;
				Ok(())
			}
		}
	}
}

/// The upstream question the cache sits in front of.
#[async_trait]
pub trait ModeratorProbe: Send + Sync {
	async fn is_moderator(&self, broadcaster_id: &str, bot_id: &str) -> anyhow::Result<bool>;
}

/// Probe backed by the provider REST API.
pub struct ProviderModeratorProbe {
	provider: ProviderClient,
}

impl ProviderModeratorProbe {
	pub fn new(provider: ProviderClient) -> Self {
		Self { provider }
	}
}

#[async_trait]
impl ModeratorProbe for ProviderModeratorProbe {
	async fn is_moderator(&self, broadcaster_id: &str, bot_id: &str) -> anyhow::Result<bool> {
		self.provider.is_moderator(broadcaster_id, bot_id).await
	}
}

/// Cache-fronted eligibility checks for bot actions.
pub struct EligibilityService {
	cache: EligibilityCache,
	probe: Arc<dyn ModeratorProbe>,
	ttl: Duration,
}

impl EligibilityService {
	pub fn new(cache: EligibilityCache, probe: Arc<dyn ModeratorProbe>, ttl: Duration) -> Self {
		Self { cache, probe, ttl }
	}

	/// Whether the bot may act in `broadcaster_id`'s channel.
	///
	/// Probe failures yield `Unknown` without poisoning the cache.
	pub async fn check(&self, broadcaster_id: &str, bot_id: &str) -> Eligibility {
		match self.cache.try_get(broadcaster_id, bot_id).await {
			Ok(Some(verdict)) => {
				metrics::counter!("siren_eligibility_cache_hits_total").increment(1);
				return verdict;
			}
			Ok(None) => {}
			Err(e) => {
				warn!(broadcaster_id, error = ?e, "eligibility cache read failed");
			}
		}

		metrics::counter!("siren_eligibility_cache_misses_total").increment(1);

		match self.probe.is_moderator(broadcaster_id, bot_id).await {
			Ok(allowed) => {
				if let Err(e) = self.cache.set(broadcaster_id, bot_id, allowed, self.ttl).await {
					warn!(broadcaster_id, error = ?e, "eligibility cache write failed");
				}
				if allowed { Eligibility::Allowed } else { Eligibility::Denied }
			}
			Err(e) => {
				warn!(broadcaster_id, error = ?e, "moderator probe failed");
				Eligibility::Unknown
			}
		}
	}
}
