#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;

use crate::server::eligibility::{Eligibility, EligibilityCache, EligibilityService, ModeratorProbe};

/// Probe with a switchable verdict and a call counter.
struct CountingProbe {
	calls: AtomicUsize,
	verdict: AtomicBool,
	fail: AtomicBool,
}

impl CountingProbe {
	fn allowing() -> Arc<Self> {
		Arc::new(Self {
			calls: AtomicUsize::new(0),
			verdict: AtomicBool::new(true),
			fail: AtomicBool::new(false),
		})
	}

	fn call_count(&self) -> usize {
		self.calls.load(Ordering::SeqCst)
	}
}

#[async_trait]
impl ModeratorProbe for CountingProbe {
	async fn is_moderator(&self, _broadcaster_id: &str, _bot_id: &str) -> anyhow::Result<bool> {
		self.calls.fetch_add(1, Ordering::SeqCst);
		if self.fail.load(Ordering::SeqCst) {
			return Err(anyhow!("provider unreachable"));
		}
		Ok(self.verdict.load(Ordering::SeqCst))
	}
}

fn service(probe: Arc<CountingProbe>, ttl: Duration) -> EligibilityService {
	EligibilityService::new(EligibilityCache::in_memory(), probe, ttl)
}

#[tokio::test]
async fn verdicts_are_served_from_cache_within_ttl() {
	let probe = CountingProbe::allowing();
	let svc = service(probe.clone(), Duration::from_secs(300));

	assert_eq!(svc.check("100", "bot").await, Eligibility::Allowed);
	assert_eq!(svc.check("100", "bot").await, Eligibility::Allowed);
	assert_eq!(probe.call_count(), 1, "second check must hit the cache");
}

#[tokio::test]
async fn cache_is_keyed_per_broadcaster() {
	let probe = CountingProbe::allowing();
	let svc = service(probe.clone(), Duration::from_secs(300));

	svc.check("100", "bot").await;
	svc.check("200", "bot").await;
	assert_eq!(probe.call_count(), 2);
}

#[tokio::test]
async fn zero_ttl_disables_caching() {
	let probe = CountingProbe::allowing();
	let svc = service(probe.clone(), Duration::ZERO);

	assert_eq!(svc.check("100", "bot").await, Eligibility::Allowed);
	assert_eq!(svc.check("100", "bot").await, Eligibility::Allowed);
	assert_eq!(probe.call_count(), 2, "zero ttl must probe every time");
}

// Expiry is wall-clock based, so this one sleeps for real.
#[tokio::test]
async fn expired_entries_are_probed_again() {
	let probe = CountingProbe::allowing();
	let svc = service(probe.clone(), Duration::from_millis(30));

	assert_eq!(svc.check("100", "bot").await, Eligibility::Allowed);
	tokio::time::sleep(Duration::from_millis(60)).await;

	probe.verdict.store(false, Ordering::SeqCst);
	assert_eq!(svc.check("100", "bot").await, Eligibility::Denied);
	assert_eq!(probe.call_count(), 2);
}

#[tokio::test]
async fn probe_failure_yields_unknown_and_is_not_cached() {
	let probe = CountingProbe::allowing();
	probe.fail.store(true, Ordering::SeqCst);
	let svc = service(probe.clone(), Duration::from_secs(300));

	assert_eq!(svc.check("100", "bot").await, Eligibility::Unknown);

	probe.fail.store(false, Ordering::SeqCst);
	assert_eq!(svc.check("100", "bot").await, Eligibility::Allowed);
	assert_eq!(probe.call_count(), 2, "a failed probe must not leave a cache entry");
}

#[tokio::test]
async fn denied_verdicts_are_cached_too() {
	let probe = CountingProbe::allowing();
	probe.verdict.store(false, Ordering::SeqCst);
	let svc = service(probe.clone(), Duration::from_secs(300));

	assert_eq!(svc.check("100", "bot").await, Eligibility::Denied);
	assert_eq!(svc.check("100", "bot").await, Eligibility::Denied);
	assert_eq!(probe.call_count(), 1);
}
