#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use siren_platform::InboundEvent;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// One handler owns one topic string.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
	fn topic(&self) -> &str;

	async fn handle(&self, event: InboundEvent) -> anyhow::Result<()>;
}

/// Configuration for `HandlerRegistry`.
#[derive(Debug, Clone)]
pub struct HandlerRegistryConfig {
	/// Maximum number of queued events per topic worker.
	pub queue_capacity: usize,
}

impl Default for HandlerRegistryConfig {
	fn default() -> Self {
		Self { queue_capacity: 1024 }
	}
}

/// Topic-keyed dispatch table.
///
/// Each topic gets its own worker task fed by a dedicated queue, so
/// events of one topic are handled in arrival order while different
/// topics proceed concurrently. Handler errors are logged and the
/// event dropped; the pipeline never stalls on a bad payload.
pub struct HandlerRegistry {
	queues: HashMap<String, mpsc::Sender<InboundEvent>>,
}

impl HandlerRegistry {
	/// Build the registry and spawn one worker per handler.
	///
	/// Two handlers claiming the same topic is a configuration bug and
	/// fails startup instead of silently shadowing one of them.
	pub fn new(handlers: Vec<Arc<dyn EventHandler>>, cfg: HandlerRegistryConfig) -> anyhow::Result<Self> {
		let mut queues = HashMap::with_capacity(handlers.len());

		for handler in handlers {
			let topic = handler.topic().to_string();
			if queues.contains_key(&topic) {
				return Err(anyhow!("duplicate handler registration for topic {topic}"));
			}

			let (tx, mut rx) = mpsc::channel::<InboundEvent>(cfg.queue_capacity);
			queues.insert(topic.clone(), tx);

			tokio::spawn(async move {
				while let Some(event) = rx.recv().await {
					if let Err(e) = handler.handle(event).await {
						metrics::counter!("siren_handler_failures_total", "topic" => topic.clone()).increment(1);
						warn!(topic, error = ?e, "handler failed; event dropped");
					}
				}
				debug!(topic, "topic worker stopped");
			});
		}

		Ok(Self { queues })
	}

	/// Hand an event to its topic worker.
	///
	/// Unknown topics are dropped with a diagnostic only; receiving a
	/// topic nobody registered is not an error condition.
	pub async fn dispatch(&self, event: InboundEvent) {
		let Some(tx) = self.queues.get(event.topic.as_str()) else {
			metrics::counter!("siren_dispatch_unknown_topic_total").increment(1);
			debug!(topic = %event.topic, "no handler registered for topic; dropping event");
			return;
		};

		metrics::counter!("siren_dispatch_events_total", "topic" => event.topic.as_str().to_string()).increment(1);

		if let Err(e) = tx.try_send(event) {
			metrics::counter!("siren_dispatch_dropped_total").increment(1);
			warn!(topic = %e.into_inner().topic, "topic queue full; dropping event");
		}
	}

	pub fn topics(&self) -> Vec<&str> {
		self.queues.keys().map(String::as_str).collect()
	}
}
