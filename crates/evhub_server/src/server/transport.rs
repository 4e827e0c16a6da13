#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use evhub_domain::{ChannelId, ConnectionState, Topic};
use evhub_provider::{
	CreatedSubscription, InboundMessage, ProviderError, ProviderEvent, RemoteSubscription, SubscriptionApi, Transport,
	TransportSession,
};
use evhub_util::time::unix_secs_now;
use rand::Rng;
use tokio::sync::{Mutex, Notify, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep};
use tracing::{debug, info, warn};

use crate::config::TransportSettings;
use crate::server::hub_state::HubStateHandle;
use crate::server::scheduler::RequestScheduler;
use crate::server::wait_shutdown;

pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 4_096;

const MIN_KEEPALIVE: Duration = Duration::from_millis(10);
const SESSION_READ_BUFFER: usize = 64;
const SESSION_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// `min * 2^attempt`, clamped to `[min, max]`.
pub fn backoff_delay(attempt: u32, min: Duration, max: Duration) -> Duration {
	let pow = attempt.min(16);
	let ms = min.as_millis().saturating_mul(1u128 << pow);
	let d = Duration::from_millis(ms.min(u64::MAX as u128) as u64);
	d.min(max).max(min)
}

/// +/- 10% around `delay`.
pub(crate) fn with_jitter(delay: Duration) -> Duration {
	let ms = delay.as_millis().min(u64::MAX as u128) as u64;
	let window = (ms / 10).max(1);
	let offset = rand::rng().random_range(0..=(window * 2));
	Duration::from_millis(ms.saturating_sub(window).saturating_add(offset))
}

/// Items produced by the upstream connection, drained by the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
	Event(ProviderEvent),
	Revoked {
		subscription_id: String,
		reason: String,
	},
	/// A session came up. `preserved` says whether provider-side subscriptions survived.
	SessionStarted {
		session_id: String,
		preserved: bool,
		reconnect: bool,
	},
}

/// Provider calls the reconciliation loop needs.
#[async_trait::async_trait]
pub trait SubscriptionClient: Send + Sync + 'static {
	fn is_connected(&self) -> bool;

	async fn create(&self, channel_id: &ChannelId, topic: &Topic) -> Result<CreatedSubscription, ProviderError>;

	async fn delete(&self, subscription_id: &str) -> Result<(), ProviderError>;

	/// `Ok(None)` when the provider cannot list.
	async fn list(&self) -> Result<Option<Vec<RemoteSubscription>>, ProviderError>;
}

enum SessionEnd {
	Shutdown,
	Forced,
	Lost(String),
}

/// Owns the single upstream connection.
///
/// A supervisor task connects, watches keepalives, and reconnects with backoff. Subscription
/// calls go through the [`RequestScheduler`] over the REST side and never touch the connection.
pub struct TransportClient {
	api: Arc<dyn SubscriptionApi>,
	scheduler: Arc<RequestScheduler>,
	state: HubStateHandle,
	force: Arc<Notify>,
	shutdown_tx: watch::Sender<bool>,
	task: Mutex<Option<JoinHandle<()>>>,
}

impl TransportClient {
	/// Start the supervisor. Inbound events arrive on the returned receiver.
	pub fn start(
		transport: Arc<dyn Transport>,
		api: Arc<dyn SubscriptionApi>,
		scheduler: Arc<RequestScheduler>,
		state: HubStateHandle,
		settings: TransportSettings,
	) -> (Arc<Self>, mpsc::Receiver<TransportEvent>) {
		let (events_tx, events_rx) = mpsc::channel(DEFAULT_EVENT_CHANNEL_CAPACITY);
		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		let force = Arc::new(Notify::new());

		let supervisor = Supervisor {
			transport,
			state: state.clone(),
			settings,
			events_tx,
			force: force.clone(),
			shutdown_rx,
		};
		let task = tokio::spawn(supervisor.run());

		let client = Arc::new(Self {
			api,
			scheduler,
			state,
			force,
			shutdown_tx,
			task: Mutex::new(Some(task)),
		});
		(client, events_rx)
	}

	pub fn connection(&self) -> ConnectionState {
		self.state.connection()
	}

	pub fn watch_state(&self) -> watch::Receiver<evhub_domain::HubState> {
		self.state.subscribe()
	}

	/// Wait until the connection is up. Returns false on timeout.
	pub async fn wait_connected(&self, timeout: Duration) -> bool {
		let mut rx = self.state.subscribe();
		matches!(
			tokio::time::timeout(timeout, rx.wait_for(|s| s.connection.is_connected())).await,
			Ok(Ok(_))
		)
	}

	/// Operator-initiated reconnect. Returns false when there is no live session to drop.
	pub fn force_reconnect(&self) -> bool {
		if !self.connection().is_connected() {
			return false;
		}
		self.force.notify_one();
		true
	}

	/// Stop the supervisor, cancelling any pending reconnect, and close the session.
	pub async fn close(&self) {
		let _ = self.shutdown_tx.send(true);
		if let Some(task) = self.task.lock().await.take()
			&& let Err(e) = task.await
		{
			warn!(error = %e, "transport supervisor task failed");
		}
		self.state.set_connection(ConnectionState::Down).await;
	}

	pub async fn create_subscription(
		&self,
		channel_id: &ChannelId,
		topic: &Topic,
	) -> Result<CreatedSubscription, ProviderError> {
		let res = self
			.scheduler
			.submit("create", || self.api.create_subscription(channel_id, topic))
			.await;
		record_call("create", &res);
		res
	}

	pub async fn delete_subscription(&self, subscription_id: &str) -> Result<(), ProviderError> {
		let res = self
			.scheduler
			.submit("delete", || self.api.delete_subscription(subscription_id))
			.await;
		record_call("delete", &res);
		res
	}

	pub async fn list_subscriptions(&self) -> Result<Option<Vec<RemoteSubscription>>, ProviderError> {
		let res = self.scheduler.submit("list", || self.api.list_subscriptions()).await;
		record_call("list", &res);
		res
	}
}

fn record_call<T>(op: &'static str, res: &Result<T, ProviderError>) {
	let outcome = match res {
		Ok(_) => "ok",
		Err(e) => e.kind(),
	};
	metrics::counter!("evhub_provider_calls_total", "op" => op, "outcome" => outcome).increment(1);
}

#[async_trait::async_trait]
impl SubscriptionClient for TransportClient {
	fn is_connected(&self) -> bool {
		self.connection().is_connected()
	}

	async fn create(&self, channel_id: &ChannelId, topic: &Topic) -> Result<CreatedSubscription, ProviderError> {
		self.create_subscription(channel_id, topic).await
	}

	async fn delete(&self, subscription_id: &str) -> Result<(), ProviderError> {
		self.delete_subscription(subscription_id).await
	}

	async fn list(&self) -> Result<Option<Vec<RemoteSubscription>>, ProviderError> {
		self.list_subscriptions().await
	}
}

struct Supervisor {
	transport: Arc<dyn Transport>,
	state: HubStateHandle,
	settings: TransportSettings,
	events_tx: mpsc::Sender<TransportEvent>,
	force: Arc<Notify>,
	shutdown_rx: watch::Receiver<bool>,
}

impl Supervisor {
	async fn run(mut self) {
		let mut attempt: u32 = 0;
		let mut ever_connected = false;

		loop {
			if *self.shutdown_rx.borrow() {
				break;
			}

			self.state.set_connection(ConnectionState::Connecting).await;

			let connected = tokio::select! {
				res = self.transport.connect() => res,
				_ = wait_shutdown(&mut self.shutdown_rx) => break,
			};

			let mut lost = true;
			match connected {
				Ok(mut session) => {
					let connected_at = Instant::now();
					let reconnect = ever_connected;
					ever_connected = true;
					let session_id = session.session_id().to_string();
					let preserved = session.subscriptions_preserved();

					self.state
						.update(|s| {
							s.connection = ConnectionState::Up;
							s.last_connect_ts = Some(unix_secs_now());
							s.error_burst_level = 0;
							if reconnect {
								s.reconnect_count = s.reconnect_count.saturating_add(1);
							}
						})
						.await;
					metrics::gauge!("evhub_upstream_connected").set(1.0);
					if reconnect {
						metrics::counter!("evhub_upstream_reconnects_total").increment(1);
					}
					let keepalive = session.keepalive_interval();
					info!(
						session_id = %session_id,
						keepalive_secs = keepalive.as_secs_f64(),
						preserved,
						reconnect,
						"upstream connected"
					);

					let _ = self
						.events_tx
						.send(TransportEvent::SessionStarted {
							session_id,
							preserved,
							reconnect,
						})
						.await;

					let mut reader = SessionReader::spawn(session);
					let end = self.run_session(&mut reader, keepalive).await;
					reader.close().await;
					self.state.set_connection(ConnectionState::Down).await;

					if connected_at.elapsed() >= self.settings.stable_after {
						attempt = 0;
					}

					match end {
						SessionEnd::Shutdown => break,
						SessionEnd::Forced => {
							info!("upstream reconnect requested by operator");
							attempt = 0;
							lost = false;
						}
						SessionEnd::Lost(reason) => {
							warn!(reason = %reason, "upstream connection lost");
							metrics::counter!("evhub_upstream_disconnects_total").increment(1);
						}
					}
				}
				Err(e) => {
					warn!(error = %e, attempt, "upstream connect failed");
					metrics::counter!("evhub_upstream_connect_failures_total").increment(1);
					self.state.set_connection(ConnectionState::Down).await;
				}
			}

			if !lost {
				continue;
			}

			let delay = with_jitter(backoff_delay(
				attempt,
				self.settings.backoff_base,
				self.settings.backoff_max,
			));
			attempt = attempt.saturating_add(1);
			debug!(delay_ms = delay.as_millis() as u64, attempt, "upstream reconnect scheduled");

			tokio::select! {
				_ = sleep(delay) => {}
				_ = wait_shutdown(&mut self.shutdown_rx) => break,
			}
		}

		self.state.set_connection(ConnectionState::Down).await;
		debug!("transport supervisor exiting");
	}

	async fn run_session(&mut self, reader: &mut SessionReader, keepalive: Duration) -> SessionEnd {
		let mut keepalive = keepalive.max(MIN_KEEPALIVE);
		let mut dead_after = keepalive.mul_f64(self.settings.keepalive_grace);
		let mut last_activity = Instant::now();
		let mut degraded = false;

		let mut tick = watchdog(keepalive);

		loop {
			tokio::select! {
				biased;

				_ = wait_shutdown(&mut self.shutdown_rx) => return SessionEnd::Shutdown,

				_ = self.force.notified() => return SessionEnd::Forced,

				read = reader.recv() => {
					let Some(read) = read else {
						return SessionEnd::Lost("session reader stopped".to_string());
					};
					let msg = match read.msg {
						Ok(Some(m)) => m,
						Ok(None) => return SessionEnd::Lost("closed by provider".to_string()),
						Err(e) => return SessionEnd::Lost(e.to_string()),
					};

					last_activity = Instant::now();
					if degraded {
						degraded = false;
						self.state.set_connection(ConnectionState::Up).await;
						info!("upstream keepalive resumed");
					}

					// a migration may hand us a session with a different interval
					let current = read.keepalive.max(MIN_KEEPALIVE);
					if current != keepalive {
						info!(
							old_ms = keepalive.as_millis() as u64,
							new_ms = current.as_millis() as u64,
							"upstream keepalive interval changed"
						);
						keepalive = current;
						dead_after = keepalive.mul_f64(self.settings.keepalive_grace);
						tick = watchdog(keepalive);
					}

					let forwarded = match msg {
						InboundMessage::Keepalive => None,
						InboundMessage::Event(ev) => Some(TransportEvent::Event(ev)),
						InboundMessage::Revocation { subscription_id, reason } => {
							Some(TransportEvent::Revoked { subscription_id, reason })
						}
					};
					if let Some(ev) = forwarded
						&& self.events_tx.send(ev).await.is_err()
					{
						return SessionEnd::Shutdown;
					}
				}

				_ = tick.tick() => {
					let silent = last_activity.elapsed();
					if silent >= dead_after {
						metrics::counter!("evhub_upstream_keepalive_timeouts_total").increment(1);
						return SessionEnd::Lost(format!("no keepalive for {}ms", silent.as_millis()));
					}
					if silent >= keepalive && !degraded {
						degraded = true;
						warn!(silent_ms = silent.as_millis() as u64, "upstream keepalive overdue");
						self.state.set_connection(ConnectionState::Degraded).await;
					}
				}
			}
		}
	}
}

fn watchdog(keepalive: Duration) -> tokio::time::Interval {
	let mut tick = interval(keepalive / 2);
	tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
	tick
}

/// One read handed from the session task to the supervisor, with the keepalive interval
/// in force once it completed.
struct SessionRead {
	msg: Result<Option<InboundMessage>, ProviderError>,
	keepalive: Duration,
}

/// Owns the upstream session and drives `next_message` on its own task.
///
/// A single read may span several awaits (a reconnect frame migrates to a new socket
/// before returning), so it must never be dropped half-way by the supervisor's timers.
/// The supervisor only ever waits on the channel, which loses nothing when it is raced.
struct SessionReader {
	rx: mpsc::Receiver<SessionRead>,
	stop: Option<oneshot::Sender<()>>,
	task: JoinHandle<()>,
}

impl SessionReader {
	fn spawn(mut session: Box<dyn TransportSession>) -> Self {
		let (tx, rx) = mpsc::channel(SESSION_READ_BUFFER);
		let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

		let task = tokio::spawn(async move {
			loop {
				let msg = tokio::select! {
					_ = &mut stop_rx => break,
					msg = session.next_message() => msg,
				};
				let last = !matches!(msg, Ok(Some(_)));
				let read = SessionRead {
					msg,
					keepalive: session.keepalive_interval(),
				};
				if tx.send(read).await.is_err() || last {
					break;
				}
			}
			session.close().await;
		});

		Self {
			rx,
			stop: Some(stop_tx),
			task,
		}
	}

	async fn recv(&mut self) -> Option<SessionRead> {
		self.rx.recv().await
	}

	/// Stops reading and waits for the session to be closed.
	async fn close(mut self) {
		if let Some(stop) = self.stop.take() {
			let _ = stop.send(());
		}
		drop(self.rx);

		let mut task = self.task;
		match tokio::time::timeout(SESSION_CLOSE_TIMEOUT, &mut task).await {
			Ok(Ok(())) => {}
			Ok(Err(e)) => warn!(error = %e, "upstream session task failed"),
			Err(_) => {
				warn!("upstream session did not close in time");
				task.abort();
			}
		}
	}
}
