#![forbid(unsafe_code)]

//! HTTP ingress: health/readiness probes and the two donation intake
//! endpoints (signed webhook and legacy postback).

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::warn;

use super::donations::{DonationDelivery, DonationLedger, IngestOutcome};

const WEBHOOK_PATH: &str = "/webhooks/donations";
const POSTBACK_PATH: &str = "/postback/donations";

const HEADER_MESSAGE_ID: &str = "x-provider-message-id";
const HEADER_TIMESTAMP: &str = "x-provider-timestamp";
const HEADER_SIGNATURE: &str = "x-provider-signature";

#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
}

impl HealthState {
	pub fn new() -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

pub fn spawn_http_server(bind: SocketAddr, state: HealthState, ledger: Arc<DonationLedger>) {
	tokio::spawn(async move {
		if let Err(err) = run_http_server(bind, state, ledger).await {
			warn!(error = %err, "http server stopped");
		}
	});
}

async fn run_http_server(bind: SocketAddr, state: HealthState, ledger: Arc<DonationLedger>) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		let ledger = ledger.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_request(req, state.clone(), ledger.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "http connection error");
			}
		});
	}
}

fn text_response(status: StatusCode, body: &'static [u8]) -> Response<Full<Bytes>> {
	Response::builder()
		.status(status)
		.body(Full::new(Bytes::from_static(body)))
		.unwrap()
}

async fn handle_request(
	req: Request<Incoming>,
	state: HealthState,
	ledger: Arc<DonationLedger>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
	let method = req.method().clone();
	let path = req.uri().path().to_string();

	match (method, path.as_str()) {
		(Method::GET, "/healthz") => Ok(text_response(StatusCode::OK, b"ok")),
		(Method::GET, "/readyz") => {
			if state.is_ready() {
				Ok(text_response(StatusCode::OK, b"ready"))
			} else {
				Ok(text_response(StatusCode::SERVICE_UNAVAILABLE, b"not-ready"))
			}
		}
		(Method::POST, WEBHOOK_PATH) => {
			let message_id = header_string(&req, HEADER_MESSAGE_ID);
			let timestamp = header_string(&req, HEADER_TIMESTAMP);
			let signature = header_string(&req, HEADER_SIGNATURE);

			let (Some(message_id), Some(timestamp), Some(signature)) = (message_id, timestamp, signature) else {
				return Ok(text_response(StatusCode::BAD_REQUEST, b"missing signature headers"));
			};

			let body = req.into_body().collect().await?.to_bytes();
			let delivery = DonationDelivery::Webhook {
				message_id,
				timestamp,
				signature,
				body,
			};
			Ok(ingest_response(&ledger, delivery).await)
		}
		(Method::POST, POSTBACK_PATH) => {
			let body = req.into_body().collect().await?.to_bytes();
			let body = String::from_utf8_lossy(&body).into_owned();
			let delivery = DonationDelivery::LegacyPostback { body };
			Ok(ingest_response(&ledger, delivery).await)
		}
		(Method::GET, _) => Ok(text_response(StatusCode::NOT_FOUND, b"")),
		_ => Ok(text_response(StatusCode::METHOD_NOT_ALLOWED, b"")),
	}
}

fn header_string(req: &Request<Incoming>, name: &str) -> Option<String> {
	req.headers().get(name)?.to_str().ok().map(str::to_string)
}

/// Map an ingest outcome to a status the provider's redelivery logic
/// understands. 2xx acknowledges, 403 signals a permanent rejection
/// and 502 asks for a redelivery once verification is reachable again.
async fn ingest_response(ledger: &DonationLedger, delivery: DonationDelivery) -> Response<Full<Bytes>> {
	match ledger.ingest(delivery).await {
		Ok(IngestOutcome::Notified) => text_response(StatusCode::OK, b"ok"),
		Ok(IngestOutcome::Duplicate) => text_response(StatusCode::OK, b"duplicate"),
		Ok(IngestOutcome::NoTenantMatch) => text_response(StatusCode::OK, b"unrouted"),
		Ok(IngestOutcome::Invalid) => text_response(StatusCode::FORBIDDEN, b"rejected"),
		Ok(IngestOutcome::VerificationFailed) => text_response(StatusCode::BAD_GATEWAY, b"verification unavailable"),
		Err(e) => {
			warn!(error = ?e, "donation delivery rejected as malformed");
			text_response(StatusCode::BAD_REQUEST, b"malformed")
		}
	}
}
