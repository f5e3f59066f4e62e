#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use siren_domain::TenantId;
use siren_platform::discord::DiscordSink;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::server::alert_router::AlertRouter;
use crate::server::donations::{
	DonationDelivery, DonationLedger, DonationNotification, DonationStore, DonationVerifier, IngestOutcome,
	VerificationOutcome, parse_amount_minor,
};
use crate::server::overlay_hub::{OverlayFrame, OverlayHub, OverlayHubConfig};
use crate::server::stores::{MemoryTenantResolver, MemoryTenantStore, TenantSettings};

/// Verifier that replays a scripted sequence of outcomes and counts calls.
struct ScriptedVerifier {
	outcomes: Mutex<VecDeque<VerificationOutcome>>,
	calls: AtomicUsize,
}

impl ScriptedVerifier {
	fn new(outcomes: impl IntoIterator<Item = VerificationOutcome>) -> Arc<Self> {
		Arc::new(Self {
			outcomes: Mutex::new(outcomes.into_iter().collect()),
			calls: AtomicUsize::new(0),
		})
	}

	fn call_count(&self) -> usize {
		self.calls.load(Ordering::SeqCst)
	}
}

#[async_trait]
impl DonationVerifier for ScriptedVerifier {
	async fn verify(&self, _delivery: &DonationDelivery, _notification: &DonationNotification) -> VerificationOutcome {
		self.calls.fetch_add(1, Ordering::SeqCst);
		self.outcomes.lock().await.pop_front().expect("scripted outcome available")
	}
}

struct NullDiscordSink;

#[async_trait]
impl DiscordSink for NullDiscordSink {
	async fn send(&self, _webhook_url: &str, _content: &str) -> anyhow::Result<()> {
		Ok(())
	}
}

struct Fixture {
	ledger: DonationLedger,
	verifier: Arc<ScriptedVerifier>,
	resolver: Arc<MemoryTenantResolver>,
	hub: OverlayHub,
	tenant: TenantId,
}

async fn fixture(outcomes: impl IntoIterator<Item = VerificationOutcome>) -> Fixture {
	let tenant = TenantId::new("1001").expect("valid TenantId");

	let tenants = MemoryTenantStore::new();
	tenants.upsert(tenant.clone(), TenantSettings::default()).await;

	let hub = OverlayHub::new(OverlayHubConfig::default());
	let router = Arc::new(AlertRouter::new(tenants, hub.clone(), Arc::new(NullDiscordSink)));

	let resolver = MemoryTenantResolver::new();
	resolver.claim("generous_viewer", tenant.clone()).await;

	let verifier = ScriptedVerifier::new(outcomes);
	let ledger = DonationLedger::new(DonationStore::in_memory(), verifier.clone(), resolver.clone(), router);

	Fixture {
		ledger,
		verifier,
		resolver,
		hub,
		tenant,
	}
}

fn webhook(txn_id: &str) -> DonationDelivery {
	let body = serde_json::json!({
		"id": txn_id,
		"amount": "5.00",
		"currency": "EUR",
		"payer_login": "generous_viewer",
		"message": "keep it up",
	});
	DonationDelivery::Webhook {
		message_id: format!("msg-{txn_id}"),
		timestamp: "2026-01-01T00:00:00Z".to_string(),
		signature: "sha256=unchecked-in-tests".to_string(),
		body: bytes::Bytes::from(serde_json::to_vec(&body).expect("serialize body")),
	}
}

#[tokio::test]
async fn redelivery_of_a_notified_donation_is_a_duplicate() {
	let fx = fixture([VerificationOutcome::Verified]).await;
	let (_id, mut rx) = fx.hub.connect(fx.tenant.clone()).await;

	let first = fx.ledger.ingest(webhook("txn-1")).await.expect("ingest");
	let second = fx.ledger.ingest(webhook("txn-1")).await.expect("ingest");

	assert_eq!(first, IngestOutcome::Notified);
	assert_eq!(second, IngestOutcome::Duplicate);
	assert_eq!(fx.verifier.call_count(), 1, "duplicate must not re-verify");

	let frame = timeout(Duration::from_millis(250), rx.recv())
		.await
		.expect("frame within timeout")
		.expect("channel open");
	assert!(matches!(frame, OverlayFrame::Alert { .. }));

	let nothing = timeout(Duration::from_millis(50), rx.recv()).await;
	assert!(nothing.is_err(), "duplicate delivery produced a second alert");
}

#[tokio::test]
async fn invalid_verification_is_terminal() {
	let fx = fixture([
		VerificationOutcome::Invalid("signature mismatch".to_string()),
		VerificationOutcome::Verified,
	])
	.await;

	let first = fx.ledger.ingest(webhook("txn-2")).await.expect("ingest");
	let second = fx.ledger.ingest(webhook("txn-2")).await.expect("ingest");

	assert_eq!(first, IngestOutcome::Invalid);
	assert_eq!(second, IngestOutcome::Invalid);
	assert_eq!(fx.verifier.call_count(), 1, "invalid transactions must not re-verify");
}

#[tokio::test]
async fn failed_verification_is_retried_on_redelivery() {
	let fx = fixture([
		VerificationOutcome::Failed("provider unreachable".to_string()),
		VerificationOutcome::Verified,
	])
	.await;

	let first = fx.ledger.ingest(webhook("txn-3")).await.expect("ingest");
	let second = fx.ledger.ingest(webhook("txn-3")).await.expect("ingest");

	assert_eq!(first, IngestOutcome::VerificationFailed);
	assert_eq!(second, IngestOutcome::Notified);
	assert_eq!(fx.verifier.call_count(), 2);
}

#[tokio::test]
async fn unclaimed_payer_parks_the_donation_until_claimed() {
	let fx = fixture([VerificationOutcome::Verified]).await;

	let body = serde_json::json!({
		"id": "txn-4",
		"amount": "2.50",
		"currency": "EUR",
		"payer_login": "drifter",
	});
	let delivery = || DonationDelivery::Webhook {
		message_id: "msg-txn-4".to_string(),
		timestamp: "2026-01-01T00:00:00Z".to_string(),
		signature: "sha256=unchecked-in-tests".to_string(),
		body: bytes::Bytes::from(serde_json::to_vec(&body).expect("serialize body")),
	};

	let first = fx.ledger.ingest(delivery()).await.expect("ingest");
	assert_eq!(first, IngestOutcome::NoTenantMatch);

	fx.resolver.claim("drifter", fx.tenant.clone()).await;

	let second = fx.ledger.ingest(delivery()).await.expect("ingest");
	assert_eq!(second, IngestOutcome::Notified);
	assert_eq!(fx.verifier.call_count(), 1, "already-verified redelivery must not re-verify");
}

#[tokio::test]
async fn concurrent_deliveries_notify_exactly_once() {
	let fx = fixture([VerificationOutcome::Verified, VerificationOutcome::Verified]).await;

	let (a, b) = tokio::join!(fx.ledger.ingest(webhook("txn-5")), fx.ledger.ingest(webhook("txn-5")));
	let a = a.expect("ingest");
	let b = b.expect("ingest");

	let notified = [a, b].iter().filter(|o| **o == IngestOutcome::Notified).count();
	assert_eq!(notified, 1, "exactly one delivery may fire the alert, got {a:?} and {b:?}");
}

#[tokio::test]
async fn malformed_webhook_body_is_rejected() {
	let fx = fixture([]).await;

	let delivery = DonationDelivery::Webhook {
		message_id: "msg-bad".to_string(),
		timestamp: "2026-01-01T00:00:00Z".to_string(),
		signature: "sha256=unchecked-in-tests".to_string(),
		body: bytes::Bytes::from_static(b"not json"),
	};

	assert!(fx.ledger.ingest(delivery).await.is_err());
	assert_eq!(fx.verifier.call_count(), 0, "malformed bodies must not reach verification");
}

#[tokio::test]
async fn legacy_postback_normalizes_like_a_webhook() {
	let fx = fixture([VerificationOutcome::Verified]).await;

	let delivery = DonationDelivery::LegacyPostback {
		body: "txn_id=txn-6&amount=12.30&currency=USD&payer=Generous_Viewer&message=gg".to_string(),
	};

	let outcome = fx.ledger.ingest(delivery).await.expect("ingest");
	assert_eq!(outcome, IngestOutcome::Notified);
}

#[test]
fn amounts_parse_into_minor_units() {
	assert_eq!(parse_amount_minor("10").expect("whole"), 1000);
	assert_eq!(parse_amount_minor("10.5").expect("one digit"), 1050);
	assert_eq!(parse_amount_minor("10.50").expect("two digits"), 1050);
	assert_eq!(parse_amount_minor("0.05").expect("cents"), 5);
	assert_eq!(parse_amount_minor(" 3.00 ").expect("trimmed"), 300);
}

#[test]
fn malformed_amounts_are_rejected() {
	assert!(parse_amount_minor("").is_err());
	assert!(parse_amount_minor("-1.00").is_err());
	assert!(parse_amount_minor("-0.50").is_err());
	assert!(parse_amount_minor("10.123").is_err());
	assert!(parse_amount_minor("10.-5").is_err());
	assert!(parse_amount_minor("abc").is_err());
}
