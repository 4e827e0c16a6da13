#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use evhub_domain::ChannelId;
use evhub_protocol::{
	ChannelReport, ControlCommand, ControlResult, PassReport, StatusReport, SubscriptionsReport,
};
use evhub_provider::{SubscriptionApi, Transport};
use evhub_util::endpoint::IpcEndpoint;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::HubConfig;
use crate::server::connection::{ConnectionContext, ConnectionSettings, ControlHandler};
use crate::server::fanout::Fanout;
use crate::server::health::{HealthState, spawn_health_server};
use crate::server::hub_state::HubStateHandle;
use crate::server::listener::{IpcListener, serve};
use crate::server::reconcile::{ReconcileHandle, Reconciler, spawn_reconcile_loop};
use crate::server::registry::SessionRegistry;
use crate::server::scheduler::RequestScheduler;
use crate::server::store::{AuditSeverity, StoreError, SubscriptionStore};
use crate::server::transport::{TransportClient, TransportEvent};
use crate::server::wait_shutdown;

/// How often the routed-events counter is written back while events flow.
const STATE_FLUSH_INTERVAL: Duration = Duration::from_secs(30);

/// Revocation reasons that mean the channel needs to be re-authorized.
const AUTH_REVOCATION_REASONS: &[&str] = &["authorization_revoked", "user_removed"];

pub struct Hub;

impl Hub {
	/// Bring the hub up: restore state, connect upstream, start reconciliation, then open
	/// the consumer socket.
	pub async fn start(
		cfg: HubConfig,
		store: Arc<dyn SubscriptionStore>,
		transport: Arc<dyn Transport>,
		api: Arc<dyn SubscriptionApi>,
	) -> anyhow::Result<HubHandle> {
		let endpoint = IpcEndpoint::parse(&cfg.server.socket)
			.map_err(|e| anyhow!(e))
			.context("parse server.socket")?;

		let state = HubStateHandle::restore(store.clone()).await;
		match store.mark_all_active_stale().await {
			Ok(0) => {}
			Ok(n) => info!(stale = n, "persisted active subscriptions will be re-validated"),
			Err(e) => error!(error = %e, "failed to mark persisted active subscriptions stale"),
		}
		match store.list_desired().await {
			Ok(desired) => info!(desired = desired.len(), "loaded desired subscriptions"),
			Err(e) => error!(error = %e, "failed to load desired subscriptions"),
		}

		let scheduler = Arc::new(RequestScheduler::new(&cfg.scheduler));
		let (transport, events_rx) =
			TransportClient::start(transport, api, scheduler, state.clone(), cfg.transport.clone());

		let reconciler = Arc::new(Reconciler::new(
			store.clone(),
			transport.clone(),
			state.clone(),
			&cfg.reconcile,
			cfg.persistence.audit_enabled,
		));
		let (reconcile_shutdown, reconcile_shutdown_rx) = watch::channel(false);
		let (reconcile, reconcile_task) = spawn_reconcile_loop(reconciler.clone(), &cfg.reconcile, reconcile_shutdown_rx);

		let fanout = Fanout::new();
		let (events_shutdown, events_shutdown_rx) = watch::channel(false);
		let events_task = tokio::spawn(
			EventRouter {
				store: store.clone(),
				state: state.clone(),
				fanout: fanout.clone(),
				reconcile: reconcile.clone(),
				audit_enabled: cfg.persistence.audit_enabled,
			}
			.run(events_rx, events_shutdown_rx),
		);

		if !transport.wait_connected(cfg.transport.startup_connect_timeout).await {
			warn!(
				timeout_secs = cfg.transport.startup_connect_timeout.as_secs(),
				"upstream not connected yet; accepting consumers anyway"
			);
		}

		let draining = Arc::new(AtomicBool::new(false));
		let registry = Arc::new(Mutex::new(SessionRegistry::default()));
		let control = Arc::new(HubControl {
			store: store.clone(),
			state: state.clone(),
			registry: registry.clone(),
			fanout: fanout.clone(),
			reconciler,
			reconcile: reconcile.clone(),
			transport: transport.clone(),
			draining: draining.clone(),
			ping_timeout: cfg.server.ping_timeout,
		});

		let listener = IpcListener::bind(&endpoint).await?;
		let endpoint = listener.local_endpoint()?;
		let ctx = Arc::new(ConnectionContext {
			store: store.clone(),
			registry,
			fanout,
			reconcile: reconcile.clone(),
			control: control.clone(),
			settings: ConnectionSettings::from_server(&cfg.server),
		});
		let (ipc_shutdown, ipc_shutdown_rx) = watch::channel(false);
		let ipc_task = tokio::spawn(serve(listener, ctx, draining.clone(), ipc_shutdown_rx.clone()));

		let (health_task, health_addr) = match cfg.server.health_bind.as_deref() {
			Some(bind) => {
				let listener = TcpListener::bind(bind)
					.await
					.with_context(|| format!("bind health server {bind}"))?;
				let addr = listener.local_addr().context("health local addr")?;
				info!(%addr, "health server listening");
				let health = HealthState::new(state.subscribe(), draining.clone());
				(Some(spawn_health_server(listener, health, ipc_shutdown_rx)), Some(addr))
			}
			None => (None, None),
		};

		info!(endpoint = %endpoint, "hub started");

		Ok(HubHandle {
			endpoint,
			health_addr,
			state,
			store,
			transport,
			reconcile,
			control,
			draining,
			ipc_shutdown,
			reconcile_shutdown,
			events_shutdown,
			ipc_task,
			reconcile_task,
			events_task,
			health_task,
		})
	}
}

/// A running hub.
pub struct HubHandle {
	endpoint: IpcEndpoint,
	health_addr: Option<SocketAddr>,
	state: HubStateHandle,
	store: Arc<dyn SubscriptionStore>,
	transport: Arc<TransportClient>,
	reconcile: ReconcileHandle,
	control: Arc<HubControl>,
	draining: Arc<AtomicBool>,
	ipc_shutdown: watch::Sender<bool>,
	reconcile_shutdown: watch::Sender<bool>,
	events_shutdown: watch::Sender<bool>,
	ipc_task: JoinHandle<()>,
	reconcile_task: JoinHandle<()>,
	events_task: JoinHandle<()>,
	health_task: Option<JoinHandle<()>>,
}

impl HubHandle {
	/// Where consumers connect.
	pub fn endpoint(&self) -> &IpcEndpoint {
		&self.endpoint
	}

	pub fn health_addr(&self) -> Option<SocketAddr> {
		self.health_addr
	}

	pub fn state(&self) -> &HubStateHandle {
		&self.state
	}

	pub fn store(&self) -> Arc<dyn SubscriptionStore> {
		self.store.clone()
	}

	/// Run a pass now.
	pub async fn resync(&self) -> Option<PassReport> {
		self.reconcile.resync().await
	}

	pub fn set_draining(&self, draining: bool) {
		self.draining.store(draining, Ordering::Relaxed);
	}

	pub async fn status(&self) -> anyhow::Result<StatusReport> {
		self.control.status().await.context("build status report")
	}

	/// Stop in reverse start order: consumers, reconciliation, upstream, events, store.
	pub async fn shutdown(self) -> anyhow::Result<()> {
		info!("hub shutting down");

		let _ = self.ipc_shutdown.send(true);
		if let Err(e) = self.ipc_task.await {
			warn!(error = %e, "ipc task failed");
		}
		if let Some(task) = self.health_task
			&& let Err(e) = task.await
		{
			warn!(error = %e, "health task failed");
		}

		// an in-flight pass finishes before the loop exits
		let _ = self.reconcile_shutdown.send(true);
		if let Err(e) = self.reconcile_task.await {
			warn!(error = %e, "reconcile task failed");
		}

		self.transport.close().await;

		let _ = self.events_shutdown.send(true);
		if let Err(e) = self.events_task.await {
			warn!(error = %e, "event router task failed");
		}

		self.state.flush().await;
		self.store.close().await;
		info!("hub stopped");
		Ok(())
	}
}

/// Drains the transport's event channel.
struct EventRouter {
	store: Arc<dyn SubscriptionStore>,
	state: HubStateHandle,
	fanout: Fanout,
	reconcile: ReconcileHandle,
	audit_enabled: bool,
}

impl EventRouter {
	async fn run(self, mut rx: mpsc::Receiver<TransportEvent>, mut shutdown_rx: watch::Receiver<bool>) {
		let mut flush = tokio::time::interval(STATE_FLUSH_INTERVAL);
		flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
		let mut unflushed = false;

		loop {
			tokio::select! {
				_ = wait_shutdown(&mut shutdown_rx) => break,

				_ = flush.tick() => {
					if unflushed {
						self.state.flush().await;
						unflushed = false;
					}
				}

				ev = rx.recv() => {
					let Some(ev) = ev else {
						break;
					};
					unflushed |= matches!(ev, TransportEvent::Event(_));
					self.handle(ev).await;
				}
			}
		}

		debug!("event router exiting");
	}

	async fn handle(&self, ev: TransportEvent) {
		match ev {
			TransportEvent::SessionStarted {
				session_id,
				preserved,
				reconnect,
			} => {
				if !preserved {
					match self.store.clear_active().await {
						Ok(0) => {}
						Ok(n) => info!(%session_id, cleared = n, "new upstream session dropped subscriptions; recreating"),
						Err(e) => error!(error = %e, "failed to clear active subscriptions for new session"),
					}
				}
				debug!(%session_id, reconnect, "requesting reconcile pass after connect");
				self.reconcile.request();
			}

			TransportEvent::Event(ev) => {
				let delivered = self.fanout.publish(&ev).await;
				self.state.record_events_routed(1);
				metrics::counter!("evhub_events_routed_total").increment(1);
				debug!(
					channel_id = %ev.channel_id,
					topic = %ev.topic,
					event_id = %ev.event_id,
					delivered,
					"event routed"
				);

				let key = ev.key();
				match self.store.promote_pending(&key).await {
					Ok(true) => info!(%key, "subscription confirmed by first event"),
					Ok(false) => {}
					Err(e) => warn!(%key, error = %e, "failed to promote pending subscription"),
				}
			}

			TransportEvent::Revoked { subscription_id, reason } => {
				metrics::counter!("evhub_subscriptions_revoked_total").increment(1);
				let key = match self.store.remove_active(&subscription_id).await {
					Ok(k) => k,
					Err(e) => {
						error!(%subscription_id, error = %e, "failed to drop revoked subscription");
						None
					}
				};
				warn!(%subscription_id, reason = %reason, key = ?key, "subscription revoked by provider");

				if let Some(key) = &key
					&& AUTH_REVOCATION_REASONS.contains(&reason.as_str())
					&& let Err(e) = self.store.flag_attention(key, &format!("revoked: {reason}")).await
				{
					error!(%key, error = %e, "failed to flag revoked subscription");
				}

				if self.audit_enabled {
					let details = json!({
						"id": subscription_id,
						"reason": reason,
						"channel_id": key.as_ref().map(|k| k.channel_id.to_string()),
						"topic": key.as_ref().map(|k| k.topic.to_string()),
					});
					if let Err(e) = self
						.store
						.record_audit("subscription_revoked", &details, AuditSeverity::Warning)
						.await
					{
						warn!(error = %e, "audit write failed");
					}
				}

				self.reconcile.request();
			}
		}
	}
}

/// Operator commands arriving over the consumer socket.
struct HubControl {
	store: Arc<dyn SubscriptionStore>,
	state: HubStateHandle,
	registry: Arc<Mutex<SessionRegistry>>,
	fanout: Fanout,
	reconciler: Arc<Reconciler>,
	reconcile: ReconcileHandle,
	transport: Arc<TransportClient>,
	draining: Arc<AtomicBool>,
	ping_timeout: Duration,
}

impl HubControl {
	async fn status(&self) -> Result<StatusReport, StoreError> {
		let desired = self.store.list_desired().await?;
		let active = self.store.list_active().await?;
		let bursts = self.reconciler.burst_snapshot().await;
		let dropped = self.fanout.dropped_snapshot().await;
		let sessions = self.registry.lock().await.snapshot(self.ping_timeout, &dropped);

		let mut channels: BTreeMap<ChannelId, ChannelReport> = BTreeMap::new();
		let row = |ch: &ChannelId| ChannelReport {
			channel_id: ch.to_string(),
			desired: 0,
			active: 0,
			failures: 0,
			backoff_level: 0,
			backing_off_until: None,
			needs_attention: None,
		};
		for d in &desired {
			let entry = channels.entry(d.channel_id.clone()).or_insert_with(|| row(&d.channel_id));
			entry.desired += 1;
			if entry.needs_attention.is_none() {
				entry.needs_attention = d.needs_attention.clone();
			}
		}
		for a in &active {
			channels.entry(a.channel_id.clone()).or_insert_with(|| row(&a.channel_id)).active += 1;
		}
		for (ch, b) in &bursts {
			let entry = channels.entry(ch.clone()).or_insert_with(|| row(ch));
			entry.failures = b.failures;
			entry.backoff_level = b.level;
			entry.backing_off_until = b.backing_off_until;
		}

		Ok(StatusReport {
			state: self.state.snapshot(),
			desired_count: desired.len(),
			active_count: active.len(),
			draining: self.draining.load(Ordering::Relaxed),
			sessions,
			channels: channels.into_values().collect(),
		})
	}

	async fn try_handle(
		&self,
		command: ControlCommand,
		channel_id: Option<ChannelId>,
	) -> Result<ControlResult, StoreError> {
		let result = match command {
			ControlCommand::Status => {
				let mut r = ControlResult::ok(command, "");
				r.status = Some(self.status().await?);
				r
			}
			ControlCommand::Subscriptions => {
				let mut r = ControlResult::ok(command, "");
				r.subscriptions = Some(SubscriptionsReport {
					desired: self.store.list_desired().await?,
					active: self.store.list_active().await?,
				});
				r
			}
			ControlCommand::Resync => match self.reconcile.resync().await {
				Some(pass) => {
					let mut r = match &pass.skipped {
						Some(reason) => ControlResult::failed(command, format!("pass skipped: {reason}")),
						None => ControlResult::ok(command, "pass complete"),
					};
					r.pass = Some(pass);
					r
				}
				None => ControlResult::failed(command, "reconcile loop is not running"),
			},
			ControlCommand::Drain => {
				self.draining.store(true, Ordering::Relaxed);
				info!("draining: new consumers are rejected");
				ControlResult::ok(command, "draining; existing consumers stay connected")
			}
			ControlCommand::Undrain => {
				self.draining.store(false, Ordering::Relaxed);
				info!("drain lifted");
				ControlResult::ok(command, "accepting consumers")
			}
			ControlCommand::Restart => {
				if self.transport.force_reconnect() {
					ControlResult::ok(command, "upstream reconnect requested")
				} else {
					ControlResult::failed(command, "upstream is not connected")
				}
			}
			ControlCommand::ClearAttention => {
				let cleared = self.store.clear_attention(channel_id.as_ref()).await?;
				self.reconciler.clear_bursts(channel_id.as_ref()).await;
				self.reconcile.request();
				info!(channel_id = ?channel_id.as_ref().map(ChannelId::as_str), cleared, "attention flags cleared");
				ControlResult::ok(command, format!("cleared {cleared} flag(s)"))
			}
		};
		Ok(result)
	}
}

#[async_trait::async_trait]
impl ControlHandler for HubControl {
	async fn handle(&self, command: ControlCommand, channel_id: Option<ChannelId>) -> ControlResult {
		match self.try_handle(command, channel_id).await {
			Ok(r) => r,
			Err(e) => {
				error!(command = command.as_str(), error = %e, "control command failed");
				ControlResult::failed(command, format!("store error: {e}"))
			}
		}
	}
}
