#![forbid(unsafe_code)]

//! Overlay WebSocket listener. Each browser source connects to
//! `/overlay/{tenant}` and receives alert and counter frames for that
//! tenant only.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use futures_util::{SinkExt, StreamExt};
use siren_domain::TenantId;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use crate::server::overlay_hub::{OverlayFrame, OverlayHub};
use crate::server::stores::CounterStore;

pub async fn run_overlay_listener(bind: SocketAddr, hub: OverlayHub, counters: Arc<dyn CounterStore>) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await.context("bind overlay listener")?;
	info!(addr = %bind, "overlay listener started");

	loop {
		let (stream, peer) = listener.accept().await.context("accept overlay connection")?;
		let hub = hub.clone();
		let counters = counters.clone();
		tokio::spawn(async move {
			if let Err(err) = handle_overlay_socket(stream, hub, counters).await {
				debug!(%peer, error = %err, "overlay connection ended with error");
			}
		});
	}
}

/// Extracts the tenant id from an `/overlay/{tenant}` request path.
fn tenant_from_path(path: &str) -> Option<TenantId> {
	let rest = path.strip_prefix("/overlay/")?;
	let rest = rest.split(['?', '#']).next().unwrap_or(rest);
	TenantId::new(rest).ok()
}

async fn handle_overlay_socket(stream: TcpStream, hub: OverlayHub, counters: Arc<dyn CounterStore>) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("siren_overlay_active_sockets").decrement(1.0);
		}
	}

	let mut tenant: Option<TenantId> = None;
	let callback = |req: &Request, resp: Response| {
		match tenant_from_path(req.uri().path()) {
			Some(t) => {
				tenant = Some(t);
				Ok(resp)
			}
			None => {
				let mut reject = ErrorResponse::new(Some("expected /overlay/{tenant}".to_string()));
				*reject.status_mut() = tokio_tungstenite::tungstenite::http::StatusCode::NOT_FOUND;
				Err(reject)
			}
		}
	};

	let mut ws = accept_hdr_async(stream, callback).await.context("overlay handshake")?;
	let tenant = tenant.ok_or_else(|| anyhow!("handshake accepted without a tenant"))?;

	metrics::gauge!("siren_overlay_active_sockets").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	// The browser source draws its counters before the first live event
	// arrives, so the snapshot goes out ahead of hub registration.
	let snapshot = match counters.snapshot(&tenant).await {
		Ok(s) => s,
		Err(err) => {
			warn!(tenant = %tenant, error = %err, "counter snapshot failed, sending empty snapshot");
			Default::default()
		}
	};
	let frame = OverlayFrame::CounterSnapshot { counters: snapshot };
	let text = serde_json::to_string(&frame).context("encode counter snapshot")?;
	ws.send(Message::Text(text.into())).await.context("send counter snapshot")?;

	let (conn_id, mut frames) = hub.connect(tenant.clone()).await;
	info!(tenant = %tenant, conn = ?conn_id, "overlay connected");

	let result = async {
		loop {
			tokio::select! {
				frame = frames.recv() => {
					let Some(frame) = frame else {
						// Hub dropped the sender; the tenant entry was evicted.
						return Ok(());
					};
					let text = serde_json::to_string(&frame).context("encode overlay frame")?;
					ws.send(Message::Text(text.into())).await.context("overlay write")?;
				}
				msg = ws.next() => {
					match msg {
						Some(Ok(Message::Close(_))) | None => return Ok(()),
						Some(Ok(Message::Ping(payload))) => {
							ws.send(Message::Pong(payload)).await.context("overlay pong")?;
						}
						// Overlays are write-only from our side; inbound text is ignored.
						Some(Ok(_)) => {}
						Some(Err(e)) => return Err(anyhow!(e).context("overlay read failed")),
					}
				}
			}
		}
	}
	.await;

	hub.disconnect(&tenant, conn_id).await;
	info!(tenant = %tenant, conn = ?conn_id, "overlay disconnected");

	if let Err(err) = &result {
		warn!(tenant = %tenant, error = %err, "overlay socket error");
	}
	result
}

#[cfg(test)]
mod tests {
	use super::tenant_from_path;

	#[test]
	fn tenant_parses_from_overlay_path() {
		let tenant = tenant_from_path("/overlay/12345").unwrap();
		assert_eq!(tenant.as_str(), "12345");
	}

	#[test]
	fn query_string_is_stripped() {
		let tenant = tenant_from_path("/overlay/12345?token=abc").unwrap();
		assert_eq!(tenant.as_str(), "12345");
	}

	#[test]
	fn non_overlay_paths_are_rejected() {
		assert!(tenant_from_path("/healthz").is_none());
		assert!(tenant_from_path("/overlay/").is_none());
		assert!(tenant_from_path("/overlay").is_none());
	}
}
