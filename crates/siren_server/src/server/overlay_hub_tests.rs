#![forbid(unsafe_code)]

use std::time::Duration;

use siren_domain::TenantId;
use tokio::time::timeout;

use crate::server::overlay_hub::{OverlayFrame, OverlayHub, OverlayHubConfig};

fn tenant(id: &str) -> TenantId {
	TenantId::new(id).expect("valid TenantId")
}

fn alert(name: &str) -> OverlayFrame {
	OverlayFrame::Alert {
		alert: name.to_string(),
		payload: serde_json::json!({}),
	}
}

#[tokio::test]
async fn broadcast_reaches_own_tenant_only() {
	let hub = OverlayHub::new(OverlayHubConfig::default());

	let tenant_a = tenant("a");
	let tenant_b = tenant("b");

	let (_id_a, mut rx_a) = hub.connect(tenant_a.clone()).await;
	let (_id_b, mut rx_b) = hub.connect(tenant_b.clone()).await;

	hub.broadcast(&tenant_a, alert("follow")).await;

	let got = timeout(Duration::from_millis(250), rx_a.recv())
		.await
		.expect("frame within timeout")
		.expect("channel open");
	assert_eq!(got, alert("follow"));

	let unexpected = timeout(Duration::from_millis(50), rx_b.recv()).await;
	assert!(unexpected.is_err(), "tenant B unexpectedly received tenant A's frame");
}

#[tokio::test]
async fn broadcast_to_unknown_tenant_is_a_noop() {
	let hub = OverlayHub::new(OverlayHubConfig::default());

	// No connections at all; must not panic or error.
	hub.broadcast(&tenant("nobody"), alert("follow")).await;
	assert_eq!(hub.connection_count(&tenant("nobody")).await, 0);
}

#[tokio::test]
async fn dead_connections_are_evicted_on_broadcast() {
	let hub = OverlayHub::new(OverlayHubConfig::default());
	let t = tenant("a");

	let (_id1, rx1) = hub.connect(t.clone()).await;
	let (_id2, mut rx2) = hub.connect(t.clone()).await;
	assert_eq!(hub.connection_count(&t).await, 2);

	// Simulate a browser source going away without a clean disconnect.
	drop(rx1);

	hub.broadcast(&t, alert("cheer")).await;
	assert_eq!(hub.connection_count(&t).await, 1);

	let got = timeout(Duration::from_millis(250), rx2.recv())
		.await
		.expect("frame within timeout")
		.expect("channel open");
	assert_eq!(got, alert("cheer"));
}

#[tokio::test]
async fn disconnect_is_idempotent() {
	let hub = OverlayHub::new(OverlayHubConfig::default());
	let t = tenant("a");

	let (id, _rx) = hub.connect(t.clone()).await;
	assert_eq!(hub.connection_count(&t).await, 1);

	hub.disconnect(&t, id).await;
	assert_eq!(hub.connection_count(&t).await, 0);

	// Second disconnect of the same id and disconnects for unknown
	// tenants are silent no-ops.
	hub.disconnect(&t, id).await;
	hub.disconnect(&tenant("other"), id).await;
	assert_eq!(hub.connection_count(&t).await, 0);
}

#[tokio::test]
async fn full_queue_drops_frames_without_blocking() {
	let hub = OverlayHub::new(OverlayHubConfig {
		connection_queue_capacity: 1,
		debug_logs: false,
	});
	let t = tenant("a");

	let (_id, mut rx) = hub.connect(t.clone()).await;

	hub.broadcast(&t, alert("first")).await;
	// Queue is full now; this frame is dropped, not queued behind.
	hub.broadcast(&t, alert("second")).await;

	let got = timeout(Duration::from_millis(250), rx.recv())
		.await
		.expect("frame within timeout")
		.expect("channel open");
	assert_eq!(got, alert("first"));

	let nothing = timeout(Duration::from_millis(50), rx.recv()).await;
	assert!(nothing.is_err(), "dropped frame was delivered anyway");

	// The connection itself stays usable.
	hub.broadcast(&t, alert("third")).await;
	let got = timeout(Duration::from_millis(250), rx.recv())
		.await
		.expect("frame within timeout")
		.expect("channel open");
	assert_eq!(got, alert("third"));
}
