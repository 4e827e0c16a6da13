#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use evhub_domain::{ActiveSubscription, ChannelId, SubscriptionKey, SubscriptionStatus};
use evhub_protocol::PassReport;
use evhub_provider::ProviderError;
use evhub_util::time::unix_secs_now;
use serde_json::json;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, warn};

use crate::config::ReconcileSettings;
use crate::server::hub_state::HubStateHandle;
use crate::server::scheduler::jitter_delay;
use crate::server::store::{AuditSeverity, StoreError, SubscriptionStore};
use crate::server::transport::{SubscriptionClient, backoff_delay};
use crate::server::wait_shutdown;

#[derive(Debug, Default)]
struct ChannelBurst {
	failures: VecDeque<Instant>,
	level: u32,
	backing_off_until: Option<Instant>,
}

/// Per-channel failure bookkeeping.
///
/// `threshold` failures inside `window` put a channel into backoff. While the level stays
/// above zero, a single further failure escalates it. A success resets the channel.
#[derive(Debug)]
pub struct BurstTracker {
	threshold: u32,
	window: Duration,
	base: Duration,
	max: Duration,
	channels: HashMap<ChannelId, ChannelBurst>,
}

/// Snapshot row for status reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelBurstInfo {
	pub failures: u32,
	pub level: u32,
	/// Unix seconds.
	pub backing_off_until: Option<i64>,
}

impl BurstTracker {
	pub fn new(settings: &ReconcileSettings) -> Self {
		Self {
			threshold: settings.burst_threshold.max(1),
			window: settings.burst_window,
			base: settings.backoff_base,
			max: settings.backoff_max,
			channels: HashMap::new(),
		}
	}

	pub fn is_backing_off(&self, channel_id: &ChannelId, now: Instant) -> bool {
		self.channels
			.get(channel_id)
			.and_then(|c| c.backing_off_until)
			.is_some_and(|until| now < until)
	}

	/// Returns the backoff when this failure put the channel (back) into backoff.
	pub fn record_failure(&mut self, channel_id: &ChannelId, now: Instant) -> Option<Duration> {
		let entry = self.channels.entry(channel_id.clone()).or_default();

		entry.failures.push_back(now);
		while let Some(front) = entry.failures.front() {
			if now.duration_since(*front) > self.window {
				entry.failures.pop_front();
			} else {
				break;
			}
		}

		if entry.level == 0 && (entry.failures.len() as u32) < self.threshold {
			return None;
		}

		let delay = backoff_delay(entry.level, self.base, self.max);
		entry.level = entry.level.saturating_add(1);
		entry.backing_off_until = Some(now + delay);
		entry.failures.clear();
		Some(delay)
	}

	pub fn record_success(&mut self, channel_id: &ChannelId) {
		self.channels.remove(channel_id);
	}

	/// Forget one channel, or all of them.
	pub fn clear(&mut self, channel_id: Option<&ChannelId>) {
		match channel_id {
			Some(ch) => {
				self.channels.remove(ch);
			}
			None => self.channels.clear(),
		}
	}

	pub fn max_level(&self) -> u32 {
		self.channels.values().map(|c| c.level).max().unwrap_or(0)
	}

	pub fn snapshot(&self, now: Instant) -> HashMap<ChannelId, ChannelBurstInfo> {
		let now_unix = unix_secs_now();
		self.channels
			.iter()
			.map(|(ch, c)| {
				let until = c
					.backing_off_until
					.filter(|u| *u > now)
					.map(|u| now_unix + u.duration_since(now).as_secs() as i64);
				(
					ch.clone(),
					ChannelBurstInfo {
						failures: c.failures.len() as u32,
						level: c.level,
						backing_off_until: until,
					},
				)
			})
			.collect()
	}
}

/// Converges the active set onto the desired set, one serialized pass at a time.
pub struct Reconciler {
	store: Arc<dyn SubscriptionStore>,
	client: Arc<dyn SubscriptionClient>,
	state: HubStateHandle,
	audit_enabled: bool,
	bursts: Mutex<BurstTracker>,
	pass_lock: Mutex<()>,
}

impl Reconciler {
	pub fn new(
		store: Arc<dyn SubscriptionStore>,
		client: Arc<dyn SubscriptionClient>,
		state: HubStateHandle,
		settings: &ReconcileSettings,
		audit_enabled: bool,
	) -> Self {
		Self {
			store,
			client,
			state,
			audit_enabled,
			bursts: Mutex::new(BurstTracker::new(settings)),
			pass_lock: Mutex::new(()),
		}
	}

	pub async fn burst_snapshot(&self) -> HashMap<ChannelId, ChannelBurstInfo> {
		self.bursts.lock().await.snapshot(Instant::now())
	}

	pub async fn clear_bursts(&self, channel_id: Option<&ChannelId>) {
		self.bursts.lock().await.clear(channel_id);
	}

	async fn audit(&self, event_type: &str, details: serde_json::Value, severity: AuditSeverity) {
		if !self.audit_enabled {
			return;
		}
		if let Err(e) = self.store.record_audit(event_type, &details, severity).await {
			warn!(error = %e, event_type, "audit write failed");
		}
	}

	/// Run one pass. Concurrent callers queue behind the pass in flight.
	pub async fn run_pass(&self) -> PassReport {
		let _guard = self.pass_lock.lock().await;
		let started = Instant::now();

		if !self.client.is_connected() {
			debug!("reconcile: skipped, upstream not connected");
			metrics::counter!("evhub_reconcile_passes_total", "outcome" => "skipped").increment(1);
			return PassReport::skipped("upstream not connected");
		}

		let mut report = match self.apply().await {
			Ok(report) => report,
			Err(e) => {
				error!(error = %e, "reconcile: store failure; pass aborted");
				metrics::counter!("evhub_store_errors_total", "op" => "reconcile").increment(1);
				metrics::counter!("evhub_reconcile_passes_total", "outcome" => "failed").increment(1);
				return PassReport::skipped(format!("store failure: {e}"));
			}
		};
		report.duration_ms = started.elapsed().as_millis() as u64;

		let level = self.bursts.lock().await.max_level();
		self.state
			.update(|s| {
				s.last_reconcile_ts = Some(unix_secs_now());
				s.error_burst_level = level;
			})
			.await;

		metrics::counter!("evhub_reconcile_passes_total", "outcome" => "ok").increment(1);
		metrics::gauge!("evhub_reconcile_remaining").set((report.remaining_to_create + report.remaining_to_delete) as f64);

		if report.created + report.deleted + report.create_failures + report.delete_failures + report.revalidated > 0 {
			info!(
				created = report.created,
				deleted = report.deleted,
				create_failures = report.create_failures,
				delete_failures = report.delete_failures,
				revalidated = report.revalidated,
				remaining_to_create = report.remaining_to_create,
				remaining_to_delete = report.remaining_to_delete,
				duration_ms = report.duration_ms,
				"reconcile pass"
			);
			self.audit("reconcile", json!(report), AuditSeverity::Info).await;
		} else {
			debug!(duration_ms = report.duration_ms, "reconcile pass: nothing to do");
		}

		report
	}

	async fn apply(&self) -> Result<PassReport, StoreError> {
		let mut report = PassReport::default();

		let active = self.store.list_active().await?;
		if active.iter().any(|a| a.status == SubscriptionStatus::Stale) {
			match self.revalidate(&active, &mut report).await? {
				true => {}
				false => {
					report.skipped = Some("revalidation incomplete".to_string());
					return Ok(report);
				}
			}
		}

		let diff = self.store.diff().await?;
		if diff.is_empty() {
			return Ok(report);
		}

		let desired = self.store.list_desired().await?;
		let attention: HashSet<SubscriptionKey> = desired
			.iter()
			.filter(|d| d.needs_attention.is_some())
			.map(|d| d.key())
			.collect();
		let active_by_key: HashMap<SubscriptionKey, ActiveSubscription> =
			self.store.list_active().await?.into_iter().map(|a| (a.key(), a)).collect();

		// deletes first so a channel never holds two subscriptions for one topic
		for key in &diff.to_delete {
			if !self.client.is_connected() {
				break;
			}
			if self.bursts.lock().await.is_backing_off(&key.channel_id, Instant::now()) {
				report.skipped_backoff += 1;
				continue;
			}
			let Some(row) = active_by_key.get(key) else {
				continue;
			};

			match self.client.delete(&row.provider_subscription_id).await {
				Ok(()) | Err(ProviderError::NotFound(_)) => {
					self.store.remove_active(&row.provider_subscription_id).await?;
					report.deleted += 1;
					self.audit(
						"subscription_delete",
						json!({"channel_id": key.channel_id, "topic": key.topic, "id": row.provider_subscription_id}),
						AuditSeverity::Info,
					)
					.await;
				}
				Err(e) => {
					report.delete_failures += 1;
					warn!(channel_id = %key.channel_id, topic = %key.topic, error = %e, "reconcile: delete failed");
					self.note_failure(&key.channel_id).await;
				}
			}
		}

		for key in &diff.to_create {
			if !self.client.is_connected() {
				break;
			}
			if attention.contains(key) {
				report.skipped_attention += 1;
				continue;
			}
			if self.bursts.lock().await.is_backing_off(&key.channel_id, Instant::now()) {
				report.skipped_backoff += 1;
				continue;
			}

			match self.client.create(&key.channel_id, &key.topic).await {
				Ok(created) => {
					let status = SubscriptionStatus::from_provider(&created.status);
					self.store.record_active(&created.id, key, status, created.cost).await?;
					self.bursts.lock().await.record_success(&key.channel_id);
					report.created += 1;
					self.audit(
						"subscription_create",
						json!({"channel_id": key.channel_id, "topic": key.topic, "id": created.id, "status": status}),
						AuditSeverity::Info,
					)
					.await;
				}
				Err(e) => {
					report.create_failures += 1;
					self.handle_create_failure(key, &e).await?;
				}
			}
		}

		report.remaining_to_create = diff.to_create.len().saturating_sub(report.created as usize);
		report.remaining_to_delete = diff.to_delete.len().saturating_sub(report.deleted as usize);
		Ok(report)
	}

	async fn handle_create_failure(&self, key: &SubscriptionKey, e: &ProviderError) -> Result<(), StoreError> {
		self.audit(
			"subscription_create_failed",
			json!({"channel_id": key.channel_id, "topic": key.topic, "error": e.to_string(), "kind": e.kind()}),
			AuditSeverity::Warning,
		)
		.await;

		if let ProviderError::Rejected { status, detail } = e {
			// rejections are not retried until an operator clears the flag
			let reason = match status {
				Some(code) => format!("rejected ({code}): {detail}"),
				None => format!("rejected: {detail}"),
			};
			self.store.flag_attention(key, &reason).await?;
			if e.is_auth() {
				warn!(channel_id = %key.channel_id, topic = %key.topic, reason = %reason, "reconcile: authorization refused; needs re-auth");
			} else {
				warn!(channel_id = %key.channel_id, topic = %key.topic, reason = %reason, "reconcile: create rejected; needs attention");
			}
			metrics::counter!("evhub_reconcile_attention_flags_total").increment(1);
		} else {
			warn!(channel_id = %key.channel_id, topic = %key.topic, error = %e, "reconcile: create failed; will retry");
		}

		self.note_failure(&key.channel_id).await;
		Ok(())
	}

	async fn note_failure(&self, channel_id: &ChannelId) {
		if let Some(delay) = self.bursts.lock().await.record_failure(channel_id, Instant::now()) {
			warn!(%channel_id, backoff_secs = delay.as_secs(), "reconcile: channel backing off after repeated failures");
			metrics::counter!("evhub_reconcile_channel_backoffs_total").increment(1);
		}
	}

	/// Re-derive the active cache after a restart. Returns false when stale rows remain.
	async fn revalidate(&self, active: &[ActiveSubscription], report: &mut PassReport) -> Result<bool, StoreError> {
		match self.client.list().await {
			Ok(Some(remote)) => {
				self.store.clear_active().await?;
				let mut seen = HashSet::new();
				for sub in remote {
					if !seen.insert(sub.key()) {
						continue;
					}
					self.store
						.record_active(&sub.id, &sub.key(), SubscriptionStatus::from_provider(&sub.status), sub.cost)
						.await?;
					report.revalidated += 1;
				}
				info!(confirmed = report.revalidated, "reconcile: active cache rebuilt from provider listing");
				return Ok(true);
			}
			Ok(None) => {}
			Err(e) => {
				warn!(error = %e, "reconcile: provider listing failed; revalidation postponed");
				return Ok(false);
			}
		}

		let mut complete = true;
		for row in active.iter().filter(|a| a.status == SubscriptionStatus::Stale) {
			if !self.client.is_connected() {
				return Ok(false);
			}
			match self.client.delete(&row.provider_subscription_id).await {
				Ok(()) | Err(ProviderError::NotFound(_)) => {
					self.store.remove_active(&row.provider_subscription_id).await?;
					report.revalidated += 1;
				}
				Err(e) => {
					complete = false;
					report.delete_failures += 1;
					warn!(id = %row.provider_subscription_id, error = %e, "reconcile: stale subscription delete failed");
				}
			}
		}
		Ok(complete)
	}
}

#[derive(Debug)]
enum Trigger {
	Pass,
	Resync(oneshot::Sender<PassReport>),
}

/// Wakes the reconcile loop out of band.
#[derive(Debug, Clone)]
pub struct ReconcileHandle {
	tx: mpsc::Sender<Trigger>,
}

impl ReconcileHandle {
	/// Ask for a pass soon. Requests made while one is already queued collapse into it.
	pub fn request(&self) {
		let _ = self.tx.try_send(Trigger::Pass);
	}

	/// Run a pass now and wait for its report.
	pub async fn resync(&self) -> Option<PassReport> {
		let (tx, rx) = oneshot::channel();
		self.tx.send(Trigger::Resync(tx)).await.ok()?;
		rx.await.ok()
	}
}

/// Periodic pass every `interval + jitter`, plus passes on request.
///
/// Shutdown lets a pass in flight finish.
pub fn spawn_reconcile_loop(
	reconciler: Arc<Reconciler>,
	settings: &ReconcileSettings,
	mut shutdown_rx: watch::Receiver<bool>,
) -> (ReconcileHandle, JoinHandle<()>) {
	let (tx, mut rx) = mpsc::channel::<Trigger>(8);
	let period = settings.interval;
	let jitter = settings.interval_jitter;

	let task = tokio::spawn(async move {
		let mut next = Instant::now() + period + jitter_delay(jitter);

		loop {
			tokio::select! {
				_ = wait_shutdown(&mut shutdown_rx) => break,

				_ = sleep_until(next) => {
					reconciler.run_pass().await;
					next = Instant::now() + period + jitter_delay(jitter);
				}

				trigger = rx.recv() => {
					match trigger {
						Some(Trigger::Pass) => {
							reconciler.run_pass().await;
						}
						Some(Trigger::Resync(reply)) => {
							let report = reconciler.run_pass().await;
							let _ = reply.send(report);
						}
						None => break,
					}
					next = Instant::now() + period + jitter_delay(jitter);
				}
			}
		}

		debug!("reconcile loop exiting");
	});

	(ReconcileHandle { tx }, task)
}
