#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use siren_domain::TenantId;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;
use uuid::Uuid;

/// Per-tenant hub that fans out overlay frames to browser sources.
#[derive(Debug, Clone)]
pub struct OverlayHub {
	inner: Arc<Mutex<Inner>>,
	cfg: OverlayHubConfig,
}

/// Configuration for `OverlayHub`.
#[derive(Debug, Clone)]
pub struct OverlayHubConfig {
	/// Maximum number of queued frames per connection.
	pub connection_queue_capacity: usize,

	pub debug_logs: bool,
}

impl Default for OverlayHubConfig {
	fn default() -> Self {
		Self {
			connection_queue_capacity: 256,
			debug_logs: false,
		}
	}
}

/// Opaque id for one overlay websocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
	fn fresh() -> Self {
		Self(Uuid::new_v4())
	}
}

/// Frames delivered to overlay pages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OverlayFrame {
	/// Trigger an alert animation.
	Alert {
		alert: String,
		payload: serde_json::Value,
	},

	/// A single counter changed.
	CounterUpdate { kind: String, value: i64 },

	/// Full counter state, sent once per fresh connection.
	CounterSnapshot {
		counters: std::collections::BTreeMap<String, i64>,
	},
}

impl OverlayHub {
	pub fn new(cfg: OverlayHubConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			cfg,
		}
	}

	/// Register a connection for `tenant`. The returned receiver yields
	/// the frames broadcast to that tenant until disconnect or eviction.
	pub async fn connect(&self, tenant: TenantId) -> (ConnectionId, mpsc::Receiver<OverlayFrame>) {
		let (tx, rx) = mpsc::channel(self.cfg.connection_queue_capacity);
		let id = ConnectionId::fresh();

		let mut inner = self.inner.lock().await;
		let entry = inner.tenants.entry(tenant.clone()).or_default();
		prune_closed_connections(entry);
		entry.connections.push(OverlayConnection { id, tx });

		metrics::gauge!("siren_overlay_connections").increment(1);
		if self.cfg.debug_logs {
			debug!(%tenant, connections = entry.connections.len(), "overlay hub: connected");
		}

		(id, rx)
	}

	/// Remove a connection. Unknown or already-removed ids are a no-op,
	/// so the socket teardown path may call this unconditionally.
	pub async fn disconnect(&self, tenant: &TenantId, id: ConnectionId) {
		let mut inner = self.inner.lock().await;
		let Some(entry) = inner.tenants.get_mut(tenant) else {
			return;
		};

		let before = entry.connections.len();
		entry.connections.retain(|c| c.id != id);
		if entry.connections.len() < before {
			metrics::gauge!("siren_overlay_connections").decrement(1);
		}

		if entry.connections.is_empty() {
			inner.tenants.remove(tenant);
		}
	}

	/// Broadcast a frame to every live connection of `tenant`.
	///
	/// Dead connections found on the way are evicted; a tenant with no
	/// connections is a silent no-op. Never fails toward the caller.
	pub async fn broadcast(&self, tenant: &TenantId, frame: OverlayFrame) {
		let mut inner = self.inner.lock().await;
		let Some(entry) = inner.tenants.get_mut(tenant) else {
			return;
		};

		prune_closed_connections(entry);
		if entry.connections.is_empty() {
			inner.tenants.remove(tenant);
			return;
		}

		let mut dropped_total: u64 = 0;

		for conn in &entry.connections {
			match conn.tx.try_send(frame.clone()) {
				Ok(()) => {}
				Err(mpsc::error::TrySendError::Full(_)) => {
					dropped_total += 1;
					metrics::counter!("siren_overlay_dropped_frames_total").increment(1);
				}
				Err(mpsc::error::TrySendError::Closed(_)) => {}
			}
		}

		prune_closed_connections(entry);
		if entry.connections.is_empty() {
			inner.tenants.remove(tenant);
		}

		if self.cfg.debug_logs && dropped_total > 0 {
			debug!(%tenant, dropped = dropped_total, "overlay hub: dropped frames on full queues");
		}
	}

	/// Live connection count for a tenant.
	pub async fn connection_count(&self, tenant: &TenantId) -> usize {
		let inner = self.inner.lock().await;
		inner
			.tenants
			.get(tenant)
			.map(|e| e.connections.iter().filter(|c| !c.tx.is_closed()).count())
			.unwrap_or(0)
	}
}

#[derive(Debug, Default)]
struct Inner {
	tenants: HashMap<TenantId, TenantEntry>,
}

#[derive(Debug, Default)]
struct TenantEntry {
	connections: Vec<OverlayConnection>,
}

#[derive(Debug)]
struct OverlayConnection {
	id: ConnectionId,
	tx: mpsc::Sender<OverlayFrame>,
}

fn prune_closed_connections(entry: &mut TenantEntry) {
	let before = entry.connections.len();
	entry.connections.retain(|c| !c.tx.is_closed());
	let evicted = before - entry.connections.len();
	if evicted > 0 {
		metrics::gauge!("siren_overlay_connections").decrement(evicted as f64);
	}
}
