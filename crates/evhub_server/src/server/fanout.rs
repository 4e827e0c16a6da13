#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use evhub_domain::SubscriptionKey;
use evhub_protocol::HubMessage;
use evhub_provider::ProviderEvent;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

/// Routes upstream events to the consumer sessions that asked for them.
///
/// Delivery never waits on a consumer: a full queue drops the event for that consumer only.
/// The next delivery that finds room is preceded by a `lagged` notice with the count.
#[derive(Debug, Clone, Default)]
pub struct Fanout {
	inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
	routes: HashMap<SubscriptionKey, Vec<u64>>,
	subscribers: HashMap<u64, Subscriber>,
}

#[derive(Debug)]
struct Subscriber {
	tx: mpsc::Sender<HubMessage>,
	pending_lag: u64,
	dropped_total: u64,
}

impl Fanout {
	pub fn new() -> Self {
		Self::default()
	}

	/// Make `session_id`'s queue a delivery target. Call once per session.
	pub async fn register(&self, session_id: u64, tx: mpsc::Sender<HubMessage>) {
		let mut inner = self.inner.lock().await;
		inner.subscribers.insert(
			session_id,
			Subscriber {
				tx,
				pending_lag: 0,
				dropped_total: 0,
			},
		);
	}

	pub async fn attach(&self, session_id: u64, key: SubscriptionKey) {
		let mut inner = self.inner.lock().await;
		let route = inner.routes.entry(key).or_default();
		if !route.contains(&session_id) {
			route.push(session_id);
		}
	}

	pub async fn detach(&self, session_id: u64, key: &SubscriptionKey) {
		let mut inner = self.inner.lock().await;
		if let Some(route) = inner.routes.get_mut(key) {
			route.retain(|id| *id != session_id);
			if route.is_empty() {
				inner.routes.remove(key);
			}
		}
	}

	/// Forget a session entirely.
	pub async fn unregister(&self, session_id: u64) {
		let mut inner = self.inner.lock().await;
		inner.subscribers.remove(&session_id);
		inner.routes.retain(|_, route| {
			route.retain(|id| *id != session_id);
			!route.is_empty()
		});
	}

	/// Deliver to every session routed for the event's pair. Returns how many got it.
	pub async fn publish(&self, event: &ProviderEvent) -> usize {
		let key = SubscriptionKey::new(event.channel_id.clone(), event.topic.clone());
		let mut guard = self.inner.lock().await;
		let inner = &mut *guard;

		let Some(route) = inner.routes.get(&key) else {
			metrics::counter!("evhub_events_unrouted_total").increment(1);
			return 0;
		};

		let msg = HubMessage::Event {
			channel_id: event.channel_id.clone(),
			topic: event.topic.clone(),
			event_id: event.event_id.clone(),
			payload: event.payload.clone(),
		};

		let mut delivered = 0usize;
		let mut dropped = 0u64;

		for session_id in route {
			let Some(sub) = inner.subscribers.get_mut(session_id) else {
				continue;
			};

			if sub.pending_lag > 0
				&& sub
					.tx
					.try_send(HubMessage::Lagged {
						dropped: sub.pending_lag,
					})
					.is_ok()
			{
				sub.pending_lag = 0;
			}

			match sub.tx.try_send(msg.clone()) {
				Ok(()) => delivered += 1,
				Err(mpsc::error::TrySendError::Full(_)) => {
					dropped += 1;
					sub.pending_lag = sub.pending_lag.saturating_add(1);
					sub.dropped_total = sub.dropped_total.saturating_add(1);
				}
				Err(mpsc::error::TrySendError::Closed(_)) => {}
			}
		}

		metrics::counter!("evhub_events_delivered_total").increment(delivered as u64);
		if dropped > 0 {
			metrics::counter!("evhub_events_dropped_total").increment(dropped);
			debug!(
				channel_id = %key.channel_id,
				topic = %key.topic,
				dropped,
				"fanout: dropped due to full consumer queues"
			);
		}

		delivered
	}

	/// Events dropped per session since it registered.
	pub async fn dropped_snapshot(&self) -> HashMap<u64, u64> {
		let inner = self.inner.lock().await;
		inner
			.subscribers
			.iter()
			.map(|(id, s)| (*id, s.dropped_total))
			.collect()
	}

	pub async fn route_count(&self) -> usize {
		self.inner.lock().await.routes.len()
	}
}
