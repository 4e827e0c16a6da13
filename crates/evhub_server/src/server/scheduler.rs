#![forbid(unsafe_code)]

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep, sleep_until};
use tracing::trace;

use crate::config::SchedulerSettings;

/// Uniform delay in `0..=max`.
pub(crate) fn jitter_delay(max: Duration) -> Duration {
	let max_ms = max.as_millis().min(u64::MAX as u128) as u64;
	if max_ms == 0 {
		return Duration::ZERO;
	}
	Duration::from_millis(rand::rng().random_range(0..=max_ms))
}

/// Serializes and paces outbound provider calls.
///
/// Every dispatch waits until `interval` has passed since the previous dispatch, then a
/// uniform jitter, and holds the gate while the operation runs. No retries happen here.
#[derive(Debug)]
pub struct RequestScheduler {
	interval: Duration,
	jitter: Duration,
	gate: Mutex<Option<Instant>>,
	waiting: AtomicUsize,
}

impl RequestScheduler {
	pub fn new(settings: &SchedulerSettings) -> Self {
		Self {
			interval: settings.interval(),
			jitter: settings.jitter,
			gate: Mutex::new(None),
			waiting: AtomicUsize::new(0),
		}
	}

	pub fn interval(&self) -> Duration {
		self.interval
	}

	/// Operations queued behind the gate (including the one in flight).
	pub fn queue_depth(&self) -> usize {
		self.waiting.load(Ordering::Relaxed)
	}

	/// Run `op` once its turn comes and return its output unchanged.
	pub async fn submit<F, Fut, T>(&self, label: &'static str, op: F) -> T
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = T>,
	{
		let _queued = Queued::enter(&self.waiting);

		let mut last = self.gate.lock().await;

		if let Some(prev) = *last {
			sleep_until(prev + self.interval).await;
		}
		let jitter = jitter_delay(self.jitter);
		if !jitter.is_zero() {
			sleep(jitter).await;
		}

		let dispatched_at = Instant::now();
		*last = Some(dispatched_at);
		trace!(op = label, jitter_ms = jitter.as_millis() as u64, "scheduler dispatch");
		metrics::counter!("evhub_scheduler_dispatch_total", "op" => label).increment(1);

		let out = op().await;

		metrics::histogram!("evhub_scheduler_op_seconds", "op" => label).record(dispatched_at.elapsed().as_secs_f64());
		drop(last);
		out
	}
}

/// Counts one submitter in the queue depth until dropped, including when the
/// caller abandons the future while it waits for the gate.
struct Queued<'a>(&'a AtomicUsize);

impl<'a> Queued<'a> {
	fn enter(waiting: &'a AtomicUsize) -> Self {
		let depth = waiting.fetch_add(1, Ordering::Relaxed) + 1;
		metrics::gauge!("evhub_scheduler_queue_depth").set(depth as f64);
		Self(waiting)
	}
}

impl Drop for Queued<'_> {
	fn drop(&mut self) {
		let depth = self.0.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
		metrics::gauge!("evhub_scheduler_queue_depth").set(depth as f64);
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use super::*;

	fn scheduler(rate_per_sec: f64, jitter_ms: u64) -> Arc<RequestScheduler> {
		Arc::new(RequestScheduler::new(&SchedulerSettings {
			rate_per_sec,
			jitter: Duration::from_millis(jitter_ms),
		}))
	}

	#[tokio::test(start_paused = true)]
	async fn dispatches_are_spaced_by_interval() {
		let sched = scheduler(2.0, 0);
		let start = Instant::now();

		let mut stamps = Vec::new();
		for _ in 0..5 {
			let t = sched.submit("test", || async { Instant::now() }).await;
			stamps.push(t);
		}

		for pair in stamps.windows(2) {
			assert!(pair[1] - pair[0] >= Duration::from_millis(500), "gap too small: {:?}", pair[1] - pair[0]);
		}
		assert!(stamps[4] - start >= Duration::from_secs(2));
	}

	#[tokio::test(start_paused = true)]
	async fn concurrent_submitters_never_overlap() {
		let sched = scheduler(10.0, 50);
		let in_flight = Arc::new(AtomicUsize::new(0));
		let max_seen = Arc::new(AtomicUsize::new(0));

		let mut tasks = Vec::new();
		for _ in 0..8 {
			let sched = sched.clone();
			let in_flight = in_flight.clone();
			let max_seen = max_seen.clone();
			tasks.push(tokio::spawn(async move {
				sched
					.submit("test", || async {
						let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
						max_seen.fetch_max(now, Ordering::SeqCst);
						tokio::time::sleep(Duration::from_millis(30)).await;
						in_flight.fetch_sub(1, Ordering::SeqCst);
					})
					.await;
			}));
		}

		for t in tasks {
			t.await.expect("task");
		}
		assert_eq!(max_seen.load(Ordering::SeqCst), 1);
		assert_eq!(sched.queue_depth(), 0);
	}

	#[tokio::test(start_paused = true)]
	async fn errors_pass_through_without_retry() {
		let sched = scheduler(2.0, 0);
		let calls = AtomicUsize::new(0);

		let out: Result<(), &str> = sched
			.submit("test", || async {
				calls.fetch_add(1, Ordering::SeqCst);
				Err("boom")
			})
			.await;

		assert_eq!(out, Err("boom"));
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn abandoned_submit_leaves_the_queue() {
		let sched = scheduler(1.0, 0);
		sched.submit("test", || async {}).await;

		// the next dispatch is a second away; give up well before that
		let abandoned = tokio::time::timeout(Duration::from_millis(100), sched.submit("test", || async {})).await;
		assert!(abandoned.is_err());
		assert_eq!(sched.queue_depth(), 0);

		let waiter = {
			let sched = sched.clone();
			tokio::spawn(async move { sched.submit("test", || async {}).await })
		};
		tokio::time::sleep(Duration::from_millis(10)).await;
		assert_eq!(sched.queue_depth(), 1);
		waiter.abort();
		let _ = waiter.await;
		assert_eq!(sched.queue_depth(), 0);
	}

	#[test]
	fn jitter_stays_in_bounds() {
		for _ in 0..100 {
			assert!(jitter_delay(Duration::from_millis(300)) <= Duration::from_millis(300));
		}
		assert_eq!(jitter_delay(Duration::ZERO), Duration::ZERO);
	}
}
