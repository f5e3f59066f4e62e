#![forbid(unsafe_code)]

//! Authenticated REST client for the upstream platform API, plus the
//! HMAC verification used on signed donation webhooks.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use hmac::{Hmac, Mac};
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::Deserialize;
use sha2::Sha256;
use url::Url;

use crate::SecretString;

const MODERATORS_PATH: &str = "moderation/moderators";
const DONATIONS_PATH: &str = "donations";

type HmacSha256 = Hmac<Sha256>;

fn retry_delay_from_headers(headers: &HeaderMap) -> Option<Duration> {
	if let Some(v) = headers.get(RETRY_AFTER)
		&& let Ok(s) = v.to_str()
		&& let Ok(secs) = s.trim().parse::<u64>()
	{
		return Some(Duration::from_secs(secs));
	}

	if let Some(v) = headers.get("Ratelimit-Reset")
		&& let Ok(s) = v.to_str()
		&& let Ok(reset_unix) = s.trim().parse::<u64>()
	{
		let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs();
		if reset_unix > now {
			return Some(Duration::from_secs(reset_unix - now));
		}
	}

	None
}

pub(crate) async fn send_with_retry(req: reqwest::RequestBuilder, label: &'static str) -> anyhow::Result<reqwest::Response> {
	let retry_builder = req.try_clone();
	let resp = req.send().await.with_context(|| format!("provider {label} send"))?;
	let status = resp.status();

	if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
		let body = resp.text().await.unwrap_or_default();
		anyhow::bail!("provider auth failed (status={status}) body={body}");
	}

	if status == StatusCode::TOO_MANY_REQUESTS
		&& let Some(delay) = retry_delay_from_headers(resp.headers())
		&& let Some(retry) = retry_builder
	{
		tokio::time::sleep(delay).await;
		let retry_resp = retry.send().await.with_context(|| format!("provider {label} retry send"))?;
		return Ok(retry_resp);
	}

	if status.is_server_error()
		&& let Some(retry) = retry_builder
	{
		tokio::time::sleep(Duration::from_millis(250)).await;
		let retry_resp = retry.send().await.with_context(|| format!("provider {label} retry send"))?;
		return Ok(retry_resp);
	}

	Ok(resp)
}

/// Provider REST client configuration.
#[derive(Clone)]
pub struct ProviderConfig {
	pub base_url: String,
	pub client_id: String,
	pub bearer_token: SecretString,
}

/// Authenticated client for the provider REST API.
#[derive(Clone)]
pub struct ProviderClient {
	http: reqwest::Client,
	base_url: Url,
	client_id: String,
	bearer_token: SecretString,
}

/// A donation as the provider's API reports it.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderDonation {
	pub id: String,
	pub amount: String,
	pub currency: String,
	pub payer_login: String,
}

#[derive(Debug, Deserialize)]
struct ProviderDonationsResponse {
	data: Vec<ProviderDonation>,
}

#[derive(Debug, Deserialize)]
struct ProviderModeratorsResponse {
	data: Vec<serde_json::Value>,
}

impl ProviderClient {
	pub fn new(cfg: ProviderConfig) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.user_agent("siren/0.x (alert-pipeline)")
			.build()
			.context("build reqwest client")?;
		let base_url = Url::parse(&cfg.base_url).with_context(|| format!("parse provider base url: {}", cfg.base_url))?;

		Ok(Self {
			http,
			base_url,
			client_id: cfg.client_id,
			bearer_token: cfg.bearer_token,
		})
	}

	pub(crate) fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
		req.header("Client-Id", &self.client_id)
			.header("Authorization", format!("Bearer {}", self.bearer_token.expose()))
	}

	pub(crate) fn url(&self, path: &str) -> anyhow::Result<Url> {
		self.base_url.join(path).context("join provider url")
	}

	pub(crate) fn http(&self) -> &reqwest::Client {
		&self.http
	}

	/// Whether `user_id` is a moderator of `broadcaster_id`'s channel.
	pub async fn is_moderator(&self, broadcaster_id: &str, user_id: &str) -> anyhow::Result<bool> {
		let url = self.url(MODERATORS_PATH)?;
		let req = self
			.authed(self.http.get(url))
			.query(&[("broadcaster_id", broadcaster_id), ("user_id", user_id)]);

		let resp = send_with_retry(req, "GET moderation/moderators").await?;
		let status = resp.status();
		let body = resp.text().await.context("provider moderators read body")?;

		if !status.is_success() {
			anyhow::bail!("provider moderators lookup failed: status={status} body={body}");
		}

		let parsed: ProviderModeratorsResponse = serde_json::from_str(&body).context("provider moderators parse json")?;
		Ok(!parsed.data.is_empty())
	}

	/// Authenticated re-query of a donation by provider transaction id.
	///
	/// `Ok(None)` means the provider does not know the transaction; a
	/// transport or 5xx failure surfaces as `Err` so callers can retry.
	pub async fn lookup_donation(&self, txn_id: &str) -> anyhow::Result<Option<ProviderDonation>> {
		let url = self.url(DONATIONS_PATH)?;
		let req = self.authed(self.http.get(url)).query(&[("id", txn_id)]);

		let resp = send_with_retry(req, "GET donations").await?;
		let status = resp.status();

		if status == StatusCode::NOT_FOUND {
			return Ok(None);
		}

		let body = resp.text().await.context("provider donations read body")?;
		if !status.is_success() {
			anyhow::bail!("provider donation lookup failed: status={status} body={body}");
		}

		let parsed: ProviderDonationsResponse = serde_json::from_str(&body).context("provider donations parse json")?;
		Ok(parsed.data.into_iter().next())
	}
}

/// Verify a signed webhook delivery.
///
/// The signature covers `message_id + timestamp + body` and arrives as
/// `sha256=<lowercase hex>`. Comparison happens inside the HMAC so the
/// check is constant time.
pub fn verify_webhook_signature(
	secret: &SecretString,
	message_id: &str,
	timestamp: &str,
	body: &[u8],
	signature: &str,
) -> bool {
	let Some(hex_sig) = signature.strip_prefix("sha256=") else {
		return false;
	};
	let Some(expected) = decode_hex(hex_sig) else {
		return false;
	};

	let Ok(mut mac) = HmacSha256::new_from_slice(secret.expose().as_bytes()) else {
		return false;
	};
	mac.update(message_id.as_bytes());
	mac.update(timestamp.as_bytes());
	mac.update(body);
	mac.verify_slice(&expected).is_ok()
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
	if s.len() % 2 != 0 {
		return None;
	}
	(0..s.len())
		.step_by(2)
		.map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sign(secret: &str, message_id: &str, timestamp: &str, body: &[u8]) -> String {
		let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac key");
		mac.update(message_id.as_bytes());
		mac.update(timestamp.as_bytes());
		mac.update(body);
		let digest = mac.finalize().into_bytes();
		let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
		format!("sha256={hex}")
	}

	#[test]
	fn accepts_valid_signature() {
		let secret = SecretString::new("s3cret");
		let body = br#"{"id":"tx-1","amount":"5.00"}"#;
		let sig = sign("s3cret", "msg-1", "2026-08-12T19:16:27Z", body);
		assert!(verify_webhook_signature(&secret, "msg-1", "2026-08-12T19:16:27Z", body, &sig));
	}

	#[test]
	fn rejects_tampered_body() {
		let secret = SecretString::new("s3cret");
		let sig = sign("s3cret", "msg-1", "2026-08-12T19:16:27Z", b"original");
		assert!(!verify_webhook_signature(&secret, "msg-1", "2026-08-12T19:16:27Z", b"tampered", &sig));
	}

	#[test]
	fn rejects_wrong_secret() {
		let secret = SecretString::new("other");
		let sig = sign("s3cret", "msg-1", "ts", b"body");
		assert!(!verify_webhook_signature(&secret, "msg-1", "ts", b"body", &sig));
	}

	#[test]
	fn rejects_malformed_signature_header() {
		let secret = SecretString::new("s3cret");
		assert!(!verify_webhook_signature(&secret, "m", "t", b"b", "not-a-signature"));
		assert!(!verify_webhook_signature(&secret, "m", "t", b"b", "sha256=zz"));
		assert!(!verify_webhook_signature(&secret, "m", "t", b"b", "sha256=abc"));
	}

	#[test]
	fn decode_hex_roundtrip() {
		assert_eq!(decode_hex("00ff10"), Some(vec![0x00, 0xff, 0x10]));
		assert_eq!(decode_hex("0"), None);
		assert_eq!(decode_hex("gg"), None);
	}
}
