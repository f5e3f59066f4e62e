#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use siren_domain::TopicType;
use siren_platform::InboundEvent;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::server::registry::{EventHandler, HandlerRegistry, HandlerRegistryConfig};

/// Handler that records the `marker` field of every payload it sees.
struct RecordingHandler {
	topic: String,
	seen: Arc<Mutex<Vec<String>>>,
	/// Simulated per-event work, to make ordering bugs observable.
	delay: Duration,
}

#[async_trait]
impl EventHandler for RecordingHandler {
	fn topic(&self) -> &str {
		&self.topic
	}

	async fn handle(&self, event: InboundEvent) -> anyhow::Result<()> {
		if !self.delay.is_zero() {
			tokio::time::sleep(self.delay).await;
		}
		let marker = event.payload["marker"].as_str().unwrap_or_default().to_string();
		self.seen.lock().await.push(marker);
		Ok(())
	}
}

fn recording(topic: &str, delay: Duration) -> (Arc<dyn EventHandler>, Arc<Mutex<Vec<String>>>) {
	let seen = Arc::new(Mutex::new(Vec::new()));
	let handler = Arc::new(RecordingHandler {
		topic: topic.to_string(),
		seen: seen.clone(),
		delay,
	});
	(handler, seen)
}

fn event(topic: &str, marker: &str) -> InboundEvent {
	InboundEvent::new(
		TopicType::new(topic).expect("valid topic"),
		serde_json::json!({ "marker": marker }),
	)
}

async fn wait_for_count(seen: &Arc<Mutex<Vec<String>>>, n: usize) -> Vec<String> {
	timeout(Duration::from_secs(5), async {
		loop {
			{
				let guard = seen.lock().await;
				if guard.len() >= n {
					return guard.clone();
				}
			}
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
	})
	.await
	.expect("handlers drained within deadline")
}

#[tokio::test]
async fn duplicate_topic_registration_fails_startup() {
	let (first, _) = recording("channel.follow", Duration::ZERO);
	let (second, _) = recording("channel.follow", Duration::ZERO);

	let err = HandlerRegistry::new(vec![first, second], HandlerRegistryConfig::default())
		.err()
		.expect("duplicate registration must fail");
	assert!(err.to_string().contains("channel.follow"), "unexpected error: {err:#}");
}

#[tokio::test]
async fn events_route_to_their_topic_handler() {
	let (follow, follow_seen) = recording("channel.follow", Duration::ZERO);
	let (cheer, cheer_seen) = recording("channel.cheer", Duration::ZERO);

	let registry = HandlerRegistry::new(vec![follow, cheer], HandlerRegistryConfig::default()).expect("registry");
	assert_eq!(registry.topics().len(), 2);

	registry.dispatch(event("channel.follow", "f1")).await;
	registry.dispatch(event("channel.cheer", "c1")).await;
	registry.dispatch(event("channel.follow", "f2")).await;

	assert_eq!(wait_for_count(&follow_seen, 2).await, vec!["f1", "f2"]);
	assert_eq!(wait_for_count(&cheer_seen, 1).await, vec!["c1"]);
}

#[tokio::test]
async fn unknown_topic_is_dropped_silently() {
	let (follow, follow_seen) = recording("channel.follow", Duration::ZERO);
	let registry = HandlerRegistry::new(vec![follow], HandlerRegistryConfig::default()).expect("registry");

	// Nobody registered for raids; this must not error or panic.
	registry.dispatch(event("channel.raid", "r1")).await;
	registry.dispatch(event("channel.follow", "f1")).await;

	assert_eq!(wait_for_count(&follow_seen, 1).await, vec!["f1"]);
}

#[tokio::test]
async fn full_topic_queue_drops_instead_of_blocking() {
	let (follow, seen) = recording("channel.follow", Duration::from_millis(100));
	let registry =
		HandlerRegistry::new(vec![follow], HandlerRegistryConfig { queue_capacity: 1 }).expect("registry");

	// One event in flight, one queued, the rest must be shed without
	// dispatch ever suspending on the full queue.
	let burst = async {
		for i in 0..6 {
			registry.dispatch(event("channel.follow", &format!("m{i}"))).await;
		}
	};
	timeout(Duration::from_millis(50), burst)
		.await
		.expect("dispatch must not block on a full queue");

	// Let the worker drain whatever survived the burst.
	tokio::time::sleep(Duration::from_millis(600)).await;
	let got = seen.lock().await.clone();
	assert_eq!(got.first().map(String::as_str), Some("m0"));
	assert!(got.len() < 6, "expected shed events, got all {got:?}");
}

#[tokio::test]
async fn same_topic_events_keep_arrival_order() {
	// The artificial delay would reorder markers if events of one topic
	// were ever handled concurrently.
	let (follow, seen) = recording("channel.follow", Duration::from_millis(10));
	let registry = HandlerRegistry::new(vec![follow], HandlerRegistryConfig::default()).expect("registry");

	for i in 0..8 {
		registry.dispatch(event("channel.follow", &format!("m{i}"))).await;
	}

	let got = wait_for_count(&seen, 8).await;
	let expected: Vec<String> = (0..8).map(|i| format!("m{i}")).collect();
	assert_eq!(got, expected);
}
