#![forbid(unsafe_code)]

//! Donation intake with exactly-once alerting.
//!
//! Donations arrive over two paths (signed webhook and legacy form
//! postback) and providers redeliver aggressively, so every write here
//! is conditional: creation is create-if-absent on the provider
//! transaction id, verification transitions away from `pending` (or a
//! retryable `failed`) at most once, and the notification flag flips
//! exactly once no matter how many deliveries race.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use serde::Deserialize;
use siren_domain::{AlertKind, TenantId, TransactionId, topics};
use siren_platform::SecretString;
use siren_platform::provider::{ProviderClient, verify_webhook_signature};
use sqlx::Row;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::alert_router::AlertRouter;
use super::stores::TenantResolver;

/// Verification lifecycle of a stored donation.
///
/// `Invalid` is terminal; `Failed` may be retried by a later delivery
/// of the same transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationStatus {
	Pending,
	Verified,
	Invalid,
	Failed,
}

impl VerificationStatus {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Pending => "pending",
			Self::Verified => "verified",
			Self::Invalid => "invalid",
			Self::Failed => "failed",
		}
	}

	fn parse(raw: &str) -> anyhow::Result<Self> {
		match raw {
			"pending" => Ok(Self::Pending),
			"verified" => Ok(Self::Verified),
			"invalid" => Ok(Self::Invalid),
			"failed" => Ok(Self::Failed),
			other => Err(anyhow!("unknown verification status: {other}")),
		}
	}
}

/// A stored donation row.
#[derive(Debug, Clone)]
pub struct DonationRecord {
	pub txn_id: TransactionId,
	pub tenant: Option<TenantId>,
	pub amount_minor: i64,
	pub currency: String,
	pub payer_login: String,
	pub verification: VerificationStatus,
	pub notification_sent: bool,
	pub received_at_unix: i64,
	pub updated_at_unix: i64,
}

impl DonationRecord {
	fn pending(n: &DonationNotification) -> Self {
		let now = chrono::Utc::now().timestamp();
		Self {
			txn_id: n.txn_id.clone(),
			tenant: None,
			amount_minor: n.amount_minor,
			currency: n.currency.clone(),
			payer_login: n.payer_login.clone(),
			verification: VerificationStatus::Pending,
			notification_sent: false,
			received_at_unix: now,
			updated_at_unix: now,
		}
	}
}

/// Persistent donation storage with conditional-write semantics.
#[derive(Clone)]
pub struct DonationStore {
	backend: DonationBackend,
}

#[derive(Clone)]
enum DonationBackend {
	Memory(Arc<Mutex<HashMap<String, DonationRecord>>>),
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

impl DonationStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		let store = if database_url.starts_with("sqlite:") {
			let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
			Self {
				backend: DonationBackend::Sqlite(pool),
			}
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			Self {
				backend: DonationBackend::Postgres(pool),
			}
		} else {
			return Err(anyhow!("unsupported database_url for donations"));
		};

		store.ensure_schema().await?;
		Ok(store)
	}

	pub fn in_memory() -> Self {
		Self {
			backend: DonationBackend::Memory(Arc::new(Mutex::new(HashMap::new()))),
		}
	}

	async fn ensure_schema(&self) -> anyhow::Result<()> {
		match &self.backend {
			DonationBackend::Memory(_) => Ok(()),
			DonationBackend::Sqlite(pool) => {
				sqlx::query(
					"CREATE TABLE IF NOT EXISTS donations (\
						txn_id TEXT PRIMARY KEY, \
						tenant TEXT, \
						amount_minor INTEGER NOT NULL, \
						currency TEXT NOT NULL, \
						payer_login TEXT NOT NULL, \
						verification TEXT NOT NULL, \
						notification_sent INTEGER NOT NULL DEFAULT 0, \
						received_at BIGINT NOT NULL, \
						updated_at BIGINT NOT NULL)",
				)
				.execute(pool)
				.await
				.context("create donations table (sqlite)")?;
				Ok(())
			}
			DonationBackend::Postgres(pool) => {
				sqlx::query(
					"CREATE TABLE IF NOT EXISTS donations (\
						txn_id TEXT PRIMARY KEY, \
						tenant TEXT, \
						amount_minor BIGINT NOT NULL, \
						currency TEXT NOT NULL, \
						payer_login TEXT NOT NULL, \
						verification TEXT NOT NULL, \
						notification_sent BOOLEAN NOT NULL DEFAULT FALSE, \
						received_at BIGINT NOT NULL, \
						updated_at BIGINT NOT NULL)",
				)
				.execute(pool)
				.await
				.context("create donations table (postgres)")?;
				Ok(())
			}
		}
	}

	/// Atomically create the record unless the transaction id already
	/// exists, then return the current row either way.
	pub async fn create_if_absent(&self, record: &DonationRecord) -> anyhow::Result<DonationRecord> {
		match &self.backend {
			DonationBackend::Memory(map) => {
				let mut map = map.lock().await;
				let current = map
					.entry(record.txn_id.as_str().to_string())
					.or_insert_with(|| record.clone());
				Ok(current.clone())
			}
			DonationBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO donations (txn_id, tenant, amount_minor, currency, payer_login, verification, notification_sent, received_at, updated_at) \
					VALUES (?, NULL, ?, ?, ?, ?, 0, ?, ?) \
					ON CONFLICT(txn_id) DO NOTHING",
				)
				.bind(record.txn_id.as_str())
				.bind(record.amount_minor)
				.bind(&record.currency)
				.bind(&record.payer_login)
				.bind(record.verification.as_str())
				.bind(record.received_at_unix)
				.bind(record.updated_at_unix)
				.execute(pool)
				.await
				.context("insert donation (sqlite)")?;

				self.get(&record.txn_id)
					.await?
					.ok_or_else(|| anyhow!("donation row missing after insert"))
			}
			DonationBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO donations (txn_id, tenant, amount_minor, currency, payer_login, verification, notification_sent, received_at, updated_at) \
					VALUES ($1, NULL, $2, $3, $4, $5, FALSE, $6, $7) \
					ON CONFLICT (txn_id) DO NOTHING",
				)
				.bind(record.txn_id.as_str())
				.bind(record.amount_minor)
				.bind(&record.currency)
				.bind(&record.payer_login)
				.bind(record.verification.as_str())
				.bind(record.received_at_unix)
				.bind(record.updated_at_unix)
				.execute(pool)
				.await
				.context("insert donation (postgres)")?;

				self.get(&record.txn_id)
					.await?
					.ok_or_else(|| anyhow!("donation row missing after insert"))
			}
		}
	}

	/// Move a donation out of `pending` (or retryable `failed`) into
	/// `status`. Returns whether this call performed the transition;
	/// terminal states are never overwritten.
	pub async fn set_verification(&self, txn_id: &TransactionId, status: VerificationStatus) -> anyhow::Result<bool> {
		let now = chrono::Utc::now().timestamp();

		match &self.backend {
			DonationBackend::Memory(map) => {
				let mut map = map.lock().await;
				let Some(rec) = map.get_mut(txn_id.as_str()) else {
					return Ok(false);
				};
				if !matches!(rec.verification, VerificationStatus::Pending | VerificationStatus::Failed) {
					return Ok(false);
				}
				rec.verification = status;
				rec.updated_at_unix = now;
				Ok(true)
			}
			DonationBackend::Sqlite(pool) => {
				let result = sqlx::query(
					"UPDATE donations SET verification = ?, updated_at = ? \
					WHERE txn_id = ? AND verification IN ('pending', 'failed')",
				)
				.bind(status.as_str())
				.bind(now)
				.bind(txn_id.as_str())
				.execute(pool)
				.await
				.context("update donation verification (sqlite)")?;
				Ok(result.rows_affected() == 1)
			}
			DonationBackend::Postgres(pool) => {
				let result = sqlx::query(
					"UPDATE donations SET verification = $1, updated_at = $2 \
					WHERE txn_id = $3 AND verification IN ('pending', 'failed')",
				)
				.bind(status.as_str())
				.bind(now)
				.bind(txn_id.as_str())
				.execute(pool)
				.await
				.context("update donation verification (postgres)")?;
				Ok(result.rows_affected() == 1)
			}
		}
	}

	/// Flip the notification flag. Returns true only for the caller that
	/// actually performed the flip; everyone else lost the race.
	pub async fn mark_notified(&self, txn_id: &TransactionId, tenant: &TenantId) -> anyhow::Result<bool> {
		let now = chrono::Utc::now().timestamp();

		match &self.backend {
			DonationBackend::Memory(map) => {
				let mut map = map.lock().await;
				let Some(rec) = map.get_mut(txn_id.as_str()) else {
					return Ok(false);
				};
				if rec.notification_sent {
					return Ok(false);
				}
				rec.notification_sent = true;
				rec.tenant = Some(tenant.clone());
				rec.updated_at_unix = now;
				Ok(true)
			}
			DonationBackend::Sqlite(pool) => {
				let result = sqlx::query(
					"UPDATE donations SET notification_sent = 1, tenant = ?, updated_at = ? \
					WHERE txn_id = ? AND notification_sent = 0",
				)
				.bind(tenant.as_str())
				.bind(now)
				.bind(txn_id.as_str())
				.execute(pool)
				.await
				.context("mark donation notified (sqlite)")?;
				Ok(result.rows_affected() == 1)
			}
			DonationBackend::Postgres(pool) => {
				let result = sqlx::query(
					"UPDATE donations SET notification_sent = TRUE, tenant = $1, updated_at = $2 \
					WHERE txn_id = $3 AND notification_sent = FALSE",
				)
				.bind(tenant.as_str())
				.bind(now)
				.bind(txn_id.as_str())
				.execute(pool)
				.await
				.context("mark donation notified (postgres)")?;
				Ok(result.rows_affected() == 1)
			}
		}
	}

	pub async fn get(&self, txn_id: &TransactionId) -> anyhow::Result<Option<DonationRecord>> {
		match &self.backend {
			DonationBackend::Memory(map) => Ok(map.lock().await.get(txn_id.as_str()).cloned()),
			DonationBackend::Sqlite(pool) => {
				let row = sqlx::query(
					"SELECT txn_id, tenant, amount_minor, currency, payer_login, verification, notification_sent, received_at, updated_at \
					FROM donations WHERE txn_id = ?",
				)
				.bind(txn_id.as_str())
				.fetch_optional(pool)
				.await
				.context("select donation (sqlite)")?;

				row.map(|r| {
					record_from_parts(
						r.try_get::<String, _>("txn_id")?,
						r.try_get::<Option<String>, _>("tenant")?,
						r.try_get::<i64, _>("amount_minor")?,
						r.try_get::<String, _>("currency")?,
						r.try_get::<String, _>("payer_login")?,
						r.try_get::<String, _>("verification")?,
						r.try_get::<i64, _>("notification_sent")? != 0,
						r.try_get::<i64, _>("received_at")?,
						r.try_get::<i64, _>("updated_at")?,
					)
				})
				.transpose()
			}
			DonationBackend::Postgres(pool) => {
				let row = sqlx::query(
					"SELECT txn_id, tenant, amount_minor, currency, payer_login, verification, notification_sent, received_at, updated_at \
					FROM donations WHERE txn_id = $1",
				)
				.bind(txn_id.as_str())
				.fetch_optional(pool)
				.await
				.context("select donation (postgres)")?;

				row.map(|r| {
					record_from_parts(
						r.try_get::<String, _>("txn_id")?,
						r.try_get::<Option<String>, _>("tenant")?,
						r.try_get::<i64, _>("amount_minor")?,
						r.try_get::<String, _>("currency")?,
						r.try_get::<String, _>("payer_login")?,
						r.try_get::<String, _>("verification")?,
						r.try_get::<bool, _>("notification_sent")?,
						r.try_get::<i64, _>("received_at")?,
						r.try_get::<i64, _>("updated_at")?,
					)
				})
				.transpose()
			}
		}
	}
}

#[allow(clippy::too_many_arguments)]
fn record_from_parts(
	txn_id: String,
	tenant: Option<String>,
	amount_minor: i64,
	currency: String,
	payer_login: String,
	verification: String,
	notification_sent: bool,
	received_at_unix: i64,
	updated_at_unix: i64,
) -> anyhow::Result<DonationRecord> {
	Ok(DonationRecord {
		txn_id: TransactionId::new(txn_id)?,
		tenant: tenant.map(TenantId::new).transpose()?,
		amount_minor,
		currency,
		payer_login,
		verification: VerificationStatus::parse(&verification)?,
		notification_sent,
		received_at_unix,
		updated_at_unix,
	})
}

/// One donation delivery as it came off the wire.
#[derive(Debug, Clone)]
pub enum DonationDelivery {
	/// Signed JSON webhook.
	Webhook {
		message_id: String,
		timestamp: String,
		signature: String,
		body: bytes::Bytes,
	},

	/// Legacy unsigned form postback.
	LegacyPostback { body: String },
}

/// The donation fields both delivery shapes normalize to.
#[derive(Debug, Clone, PartialEq)]
pub struct DonationNotification {
	pub txn_id: TransactionId,
	pub amount_minor: i64,
	pub currency: String,
	pub payer_login: String,
	pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WebhookDonationBody {
	id: String,
	amount: String,
	currency: String,
	payer_login: String,
	#[serde(default)]
	message: Option<String>,
}

/// Parse a decimal money string into minor units (max 2 fraction digits).
pub fn parse_amount_minor(raw: &str) -> anyhow::Result<i64> {
	let raw = raw.trim();
	// "-0.50" would survive the whole < 0 check below.
	if raw.starts_with('-') {
		bail!("negative amount: {raw}");
	}
	let (whole, frac) = match raw.split_once('.') {
		Some((w, f)) => (w, f),
		None => (raw, ""),
	};

	if whole.is_empty() || frac.len() > 2 || !frac.chars().all(|c| c.is_ascii_digit()) {
		bail!("malformed amount: {raw}");
	}

	let whole: i64 = whole.parse().with_context(|| format!("malformed amount: {raw}"))?;

	let frac_minor: i64 = match frac.len() {
		0 => 0,
		n => {
			let f: i64 = frac.parse().with_context(|| format!("malformed amount: {raw}"))?;
			if n == 1 { f * 10 } else { f }
		}
	};

	whole
		.checked_mul(100)
		.and_then(|v| v.checked_add(frac_minor))
		.ok_or_else(|| anyhow!("amount overflow: {raw}"))
}

/// Normalize a delivery. A parse failure here means the request is
/// malformed and should be rejected outright, not recorded.
pub fn parse_delivery(delivery: &DonationDelivery) -> anyhow::Result<DonationNotification> {
	match delivery {
		DonationDelivery::Webhook { body, .. } => {
			let parsed: WebhookDonationBody = serde_json::from_slice(body).context("parse webhook donation body")?;
			Ok(DonationNotification {
				txn_id: TransactionId::new(parsed.id)?,
				amount_minor: parse_amount_minor(&parsed.amount)?,
				currency: parsed.currency,
				payer_login: parsed.payer_login,
				message: parsed.message,
			})
		}
		DonationDelivery::LegacyPostback { body } => {
			let mut txn_id = None;
			let mut amount = None;
			let mut currency = None;
			let mut payer = None;
			let mut message = None;

			for (key, value) in url::form_urlencoded::parse(body.as_bytes()) {
				match key.as_ref() {
					"txn_id" => txn_id = Some(value.into_owned()),
					"amount" => amount = Some(value.into_owned()),
					"currency" => currency = Some(value.into_owned()),
					"payer" => payer = Some(value.into_owned()),
					"message" => message = Some(value.into_owned()),
					_ => {}
				}
			}

			Ok(DonationNotification {
				txn_id: TransactionId::new(txn_id.ok_or_else(|| anyhow!("postback missing txn_id"))?)?,
				amount_minor: parse_amount_minor(&amount.ok_or_else(|| anyhow!("postback missing amount"))?)?,
				currency: currency.ok_or_else(|| anyhow!("postback missing currency"))?,
				payer_login: payer.ok_or_else(|| anyhow!("postback missing payer"))?,
				message,
			})
		}
	}
}

/// Outcome of verifying one delivery.
#[derive(Debug)]
pub enum VerificationOutcome {
	Verified,
	/// Authenticity check failed; never retried.
	Invalid(String),
	/// Transient failure; a redelivery may succeed.
	Failed(String),
}

#[async_trait]
pub trait DonationVerifier: Send + Sync {
	async fn verify(&self, delivery: &DonationDelivery, notification: &DonationNotification) -> VerificationOutcome;
}

/// Production verifier: webhook deliveries by HMAC signature, legacy
/// postbacks by authenticated re-query against the provider API.
pub struct ProviderDonationVerifier {
	provider: ProviderClient,
	webhook_secret: SecretString,
}

impl ProviderDonationVerifier {
	pub fn new(provider: ProviderClient, webhook_secret: SecretString) -> Self {
		Self {
			provider,
			webhook_secret,
		}
	}
}

#[async_trait]
impl DonationVerifier for ProviderDonationVerifier {
	async fn verify(&self, delivery: &DonationDelivery, notification: &DonationNotification) -> VerificationOutcome {
		match delivery {
			DonationDelivery::Webhook {
				message_id,
				timestamp,
				signature,
				body,
			} => {
				if verify_webhook_signature(&self.webhook_secret, message_id, timestamp, body, signature) {
					VerificationOutcome::Verified
				} else {
					VerificationOutcome::Invalid("webhook signature mismatch".to_string())
				}
			}
			DonationDelivery::LegacyPostback { .. } => {
				match self.provider.lookup_donation(notification.txn_id.as_str()).await {
					Ok(Some(d)) => {
						let amount_ok = parse_amount_minor(&d.amount)
							.map(|m| m == notification.amount_minor)
							.unwrap_or(false);
						if amount_ok && d.currency.eq_ignore_ascii_case(&notification.currency) {
							VerificationOutcome::Verified
						} else {
							VerificationOutcome::Invalid(format!(
								"postback does not match provider record (txn={})",
								notification.txn_id
							))
						}
					}
					Ok(None) => VerificationOutcome::Invalid(format!("provider does not know txn={}", notification.txn_id)),
					Err(e) => VerificationOutcome::Failed(format!("provider lookup failed: {e:#}")),
				}
			}
		}
	}
}

/// Result of one delivery, mostly for the HTTP layer to map to a
/// response code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
	/// Alert fired for the first time.
	Notified,
	/// Transaction already notified (or lost the notify race).
	Duplicate,
	/// Verification rejected the delivery permanently.
	Invalid,
	/// Verification could not complete; the provider should redeliver.
	VerificationFailed,
	/// Verified, but no tenant claims the payer.
	NoTenantMatch,
}

/// Orchestrates the donation path: dedup, verify, resolve, notify.
pub struct DonationLedger {
	store: DonationStore,
	verifier: Arc<dyn DonationVerifier>,
	resolver: Arc<dyn TenantResolver>,
	router: Arc<AlertRouter>,
}

impl DonationLedger {
	pub fn new(
		store: DonationStore,
		verifier: Arc<dyn DonationVerifier>,
		resolver: Arc<dyn TenantResolver>,
		router: Arc<AlertRouter>,
	) -> Self {
		Self {
			store,
			verifier,
			resolver,
			router,
		}
	}

	pub async fn ingest(&self, delivery: DonationDelivery) -> anyhow::Result<IngestOutcome> {
		let notification = parse_delivery(&delivery)?;
		let txn_id = notification.txn_id.clone();

		let current = self.store.create_if_absent(&DonationRecord::pending(&notification)).await?;

		if current.notification_sent {
			metrics::counter!("siren_donations_duplicate_total").increment(1);
			return Ok(IngestOutcome::Duplicate);
		}

		match current.verification {
			VerificationStatus::Invalid => {
				// Terminal. Redeliveries must not re-run verification.
				return Ok(IngestOutcome::Invalid);
			}
			VerificationStatus::Verified => {
				// Verified earlier but not notified, e.g. the payer had
				// no tenant at the time. Fall through to notify.
			}
			VerificationStatus::Pending | VerificationStatus::Failed => {
				match self.verifier.verify(&delivery, &notification).await {
					VerificationOutcome::Verified => {
						self.store.set_verification(&txn_id, VerificationStatus::Verified).await?;
					}
					VerificationOutcome::Invalid(reason) => {
						warn!(txn_id = %txn_id, reason, "donation rejected as invalid");
						self.store.set_verification(&txn_id, VerificationStatus::Invalid).await?;
						metrics::counter!("siren_donations_invalid_total").increment(1);
						return Ok(IngestOutcome::Invalid);
					}
					VerificationOutcome::Failed(reason) => {
						warn!(txn_id = %txn_id, reason, "donation verification failed; awaiting redelivery");
						self.store.set_verification(&txn_id, VerificationStatus::Failed).await?;
						return Ok(IngestOutcome::VerificationFailed);
					}
				}
			}
		}

		let Some(tenant) = self.resolver.tenant_for_payer(&notification.payer_login).await? else {
			info!(txn_id = %txn_id, payer = %notification.payer_login, "no tenant claims payer; donation stored unrouted");
			return Ok(IngestOutcome::NoTenantMatch);
		};

		if !self.store.mark_notified(&txn_id, &tenant).await? {
			metrics::counter!("siren_donations_duplicate_total").increment(1);
			return Ok(IngestOutcome::Duplicate);
		}

		let default_alert = AlertKind::new("donation").context("donation alert kind")?;
		let payload = serde_json::json!({
			"txn_id": txn_id.as_str(),
			"payer_login": notification.payer_login,
			"amount_minor": notification.amount_minor,
			"currency": notification.currency,
			"message": notification.message,
		});
		self.router.route(&tenant, topics::DONATION, &default_alert, payload).await;

		metrics::counter!("siren_donations_notified_total").increment(1);
		Ok(IngestOutcome::Notified)
	}
}
