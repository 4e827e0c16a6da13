#![forbid(unsafe_code)]

use std::sync::Arc;

use evhub_domain::{ConnectionState, HubState};
use tokio::sync::watch;
use tracing::error;

use crate::server::store::SubscriptionStore;

/// Shared view of [`HubState`].
///
/// Changes made through [`HubStateHandle::update`] are written through to the store.
/// The routed-events counter is bumped in memory and persisted by the next update or
/// [`HubStateHandle::flush`].
#[derive(Clone)]
pub struct HubStateHandle {
	tx: Arc<watch::Sender<HubState>>,
	store: Arc<dyn SubscriptionStore>,
}

impl HubStateHandle {
	pub fn new(initial: HubState, store: Arc<dyn SubscriptionStore>) -> Self {
		let (tx, _rx) = watch::channel(initial);
		Self { tx: Arc::new(tx), store }
	}

	/// Restore persisted counters. The connection always starts `down`.
	pub async fn restore(store: Arc<dyn SubscriptionStore>) -> Self {
		let mut state = match store.load_state().await {
			Ok(pairs) => HubState::from_pairs(&pairs),
			Err(e) => {
				error!(error = %e, "hub state: failed to load persisted state; starting fresh");
				HubState::default()
			}
		};
		state.connection = ConnectionState::Down;
		Self::new(state, store)
	}

	pub fn snapshot(&self) -> HubState {
		self.tx.borrow().clone()
	}

	pub fn connection(&self) -> ConnectionState {
		self.tx.borrow().connection
	}

	pub fn subscribe(&self) -> watch::Receiver<HubState> {
		self.tx.subscribe()
	}

	/// Mutate and persist.
	pub async fn update(&self, f: impl FnOnce(&mut HubState)) {
		self.tx.send_modify(f);
		self.flush().await;
	}

	pub async fn set_connection(&self, connection: ConnectionState) {
		if self.connection() == connection {
			return;
		}
		self.update(|s| s.connection = connection).await;
		metrics::gauge!("evhub_upstream_connected").set(if connection.is_connected() { 1.0 } else { 0.0 });
	}

	pub fn record_events_routed(&self, n: u64) {
		self.tx.send_modify(|s| s.total_events_routed = s.total_events_routed.saturating_add(n));
	}

	pub async fn flush(&self) {
		let pairs = self.snapshot().to_pairs();
		if let Err(e) = self.store.put_state(&pairs).await {
			error!(error = %e, "hub state: persist failed");
			metrics::counter!("evhub_store_errors_total", "op" => "put_state").increment(1);
		}
	}
}
