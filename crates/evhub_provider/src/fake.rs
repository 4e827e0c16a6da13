#![forbid(unsafe_code)]

//! In-process provider for tests and local development.
//!
//! One [`FakeProvider`] implements both [`Transport`] and [`SubscriptionApi`]. Tests script
//! failures per channel, inject events and revocations, silence keepalives, or drop the
//! connection, and read back call counters and timestamps.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use evhub_domain::{ChannelId, SubscriptionKey, Topic};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tracing::debug;

use crate::{
	CreatedSubscription, InboundMessage, ProviderError, ProviderEvent, RemoteSubscription, SubscriptionApi, Transport,
	TransportSession,
};

/// Scripted outcome for create calls on one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeFailure {
	Reject { status: u16 },
	Unavailable,
}

impl FakeFailure {
	fn to_error(self, channel_id: &ChannelId) -> ProviderError {
		match self {
			Self::Reject { status } => ProviderError::rejected(Some(status), format!("fake rejection for {channel_id}")),
			Self::Unavailable => ProviderError::Unavailable(format!("fake outage for {channel_id}")),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeCallKind {
	Create,
	Delete,
	List,
}

/// One recorded API call.
#[derive(Debug, Clone)]
pub struct FakeCall {
	pub kind: FakeCallKind,
	pub channel_id: Option<ChannelId>,
	pub topic: Option<Topic>,
	pub subscription_id: Option<String>,
	pub at: Instant,
	pub ok: bool,
}

#[derive(Debug)]
enum Signal {
	Inbound(InboundMessage),
	Drop,
}

struct LiveSession {
	id: String,
	tx: mpsc::UnboundedSender<Signal>,
	silenced: Arc<AtomicBool>,
}

struct FakeState {
	subs: BTreeMap<String, RemoteSubscription>,
	next_id: u64,
	create_failures: HashMap<ChannelId, FakeFailure>,
	connect_failures: u32,
	list_supported: bool,
	calls: Vec<FakeCall>,
	connects: u64,
	session: Option<LiveSession>,
}

struct Inner {
	state: Mutex<FakeState>,
	keepalive: Duration,
	preserved: bool,
}

#[derive(Clone)]
pub struct FakeProvider {
	inner: Arc<Inner>,
}

impl Default for FakeProvider {
	fn default() -> Self {
		Self::new()
	}
}

impl FakeProvider {
	pub fn new() -> Self {
		Self::with_options(Duration::from_secs(10), true)
	}

	/// `preserved = false` makes every new session forget existing subscriptions, like a fresh
	/// EventSub socket.
	pub fn with_options(keepalive: Duration, preserved: bool) -> Self {
		Self {
			inner: Arc::new(Inner {
				state: Mutex::new(FakeState {
					subs: BTreeMap::new(),
					next_id: 1,
					create_failures: HashMap::new(),
					connect_failures: 0,
					list_supported: true,
					calls: Vec::new(),
					connects: 0,
					session: None,
				}),
				keepalive,
				preserved,
			}),
		}
	}

	pub fn fail_creates_for(&self, channel_id: &ChannelId, failure: FakeFailure) {
		self.inner.state.lock().create_failures.insert(channel_id.clone(), failure);
	}

	pub fn clear_failures(&self, channel_id: &ChannelId) {
		self.inner.state.lock().create_failures.remove(channel_id);
	}

	pub fn fail_next_connects(&self, n: u32) {
		self.inner.state.lock().connect_failures = n;
	}

	pub fn set_list_supported(&self, supported: bool) {
		self.inner.state.lock().list_supported = supported;
	}

	pub fn connect_calls(&self) -> u64 {
		self.inner.state.lock().connects
	}

	pub fn calls(&self) -> Vec<FakeCall> {
		self.inner.state.lock().calls.clone()
	}

	fn count_calls(&self, kind: FakeCallKind, channel_id: Option<&ChannelId>) -> usize {
		self.inner
			.state
			.lock()
			.calls
			.iter()
			.filter(|c| c.kind == kind)
			.filter(|c| channel_id.is_none_or(|ch| c.channel_id.as_ref() == Some(ch)))
			.count()
	}

	pub fn create_calls(&self) -> usize {
		self.count_calls(FakeCallKind::Create, None)
	}

	pub fn create_calls_for(&self, channel_id: &ChannelId) -> usize {
		self.count_calls(FakeCallKind::Create, Some(channel_id))
	}

	pub fn delete_calls(&self) -> usize {
		self.count_calls(FakeCallKind::Delete, None)
	}

	/// Subscriptions the fake provider currently considers live.
	pub fn remote(&self) -> Vec<RemoteSubscription> {
		self.inner.state.lock().subs.values().cloned().collect()
	}

	pub fn remote_keys(&self) -> Vec<SubscriptionKey> {
		self.inner.state.lock().subs.values().map(RemoteSubscription::key).collect()
	}

	/// Register a subscription upstream without going through the API.
	pub fn insert_remote(&self, channel_id: &ChannelId, topic: &Topic) -> String {
		let mut st = self.inner.state.lock();
		let id = format!("fake-sub-{}", st.next_id);
		st.next_id += 1;
		st.subs.insert(
			id.clone(),
			RemoteSubscription {
				id: id.clone(),
				channel_id: channel_id.clone(),
				topic: topic.clone(),
				status: "enabled".to_string(),
				cost: 1,
			},
		);
		id
	}

	/// Forget every subscription, as if they expired upstream.
	pub fn expire_all(&self) {
		self.inner.state.lock().subs.clear();
	}

	pub fn current_session_id(&self) -> Option<String> {
		self.inner.state.lock().session.as_ref().map(|s| s.id.clone())
	}

	fn send(&self, signal: Signal) -> bool {
		let st = self.inner.state.lock();
		match st.session.as_ref() {
			Some(s) => s.tx.send(signal).is_ok(),
			None => false,
		}
	}

	/// Deliver an event on the live session. Returns false when no session is connected.
	pub fn emit_event(&self, channel_id: &ChannelId, topic: &Topic, event_id: &str, payload: serde_json::Value) -> bool {
		let subscription_id = {
			let st = self.inner.state.lock();
			st.subs
				.values()
				.find(|s| &s.channel_id == channel_id && &s.topic == topic)
				.map(|s| s.id.clone())
		};

		self.send(Signal::Inbound(InboundMessage::Event(ProviderEvent {
			subscription_id,
			channel_id: channel_id.clone(),
			topic: topic.clone(),
			event_id: event_id.to_string(),
			payload,
		})))
	}

	/// Drop a subscription upstream and tell the live session about it.
	pub fn revoke(&self, subscription_id: &str, reason: &str) -> bool {
		self.inner.state.lock().subs.remove(subscription_id);
		self.send(Signal::Inbound(InboundMessage::Revocation {
			subscription_id: subscription_id.to_string(),
			reason: reason.to_string(),
		}))
	}

	/// Stop keepalives on the live session without closing it.
	pub fn silence_keepalives(&self) -> bool {
		let st = self.inner.state.lock();
		match st.session.as_ref() {
			Some(s) => {
				s.silenced.store(true, Ordering::SeqCst);
				true
			}
			None => false,
		}
	}

	/// Fail the live session with a transport error.
	pub fn drop_connection(&self) -> bool {
		self.send(Signal::Drop)
	}

	fn record(&self, st: &mut FakeState, call: FakeCall) {
		debug!(kind = ?call.kind, channel_id = ?call.channel_id, ok = call.ok, "fake provider call");
		st.calls.push(call);
	}
}

#[async_trait::async_trait]
impl SubscriptionApi for FakeProvider {
	async fn create_subscription(
		&self,
		channel_id: &ChannelId,
		topic: &Topic,
	) -> Result<CreatedSubscription, ProviderError> {
		let mut st = self.inner.state.lock();

		let result = if let Some(failure) = st.create_failures.get(channel_id).copied() {
			Err(failure.to_error(channel_id))
		} else if st.subs.values().any(|s| &s.channel_id == channel_id && &s.topic == topic) {
			Err(ProviderError::rejected(
				Some(409),
				format!("subscription already exists for {channel_id}/{topic}"),
			))
		} else {
			let id = format!("fake-sub-{}", st.next_id);
			st.next_id += 1;
			st.subs.insert(
				id.clone(),
				RemoteSubscription {
					id: id.clone(),
					channel_id: channel_id.clone(),
					topic: topic.clone(),
					status: "enabled".to_string(),
					cost: 1,
				},
			);
			Ok(CreatedSubscription {
				id,
				status: "enabled".to_string(),
				cost: 1,
			})
		};

		let call = FakeCall {
			kind: FakeCallKind::Create,
			channel_id: Some(channel_id.clone()),
			topic: Some(topic.clone()),
			subscription_id: result.as_ref().ok().map(|c| c.id.clone()),
			at: Instant::now(),
			ok: result.is_ok(),
		};
		self.record(&mut st, call);
		result
	}

	async fn delete_subscription(&self, subscription_id: &str) -> Result<(), ProviderError> {
		let mut st = self.inner.state.lock();
		let removed = st.subs.remove(subscription_id);

		let call = FakeCall {
			kind: FakeCallKind::Delete,
			channel_id: removed.as_ref().map(|s| s.channel_id.clone()),
			topic: removed.as_ref().map(|s| s.topic.clone()),
			subscription_id: Some(subscription_id.to_string()),
			at: Instant::now(),
			ok: removed.is_some(),
		};
		self.record(&mut st, call);

		match removed {
			Some(_) => Ok(()),
			None => Err(ProviderError::NotFound(subscription_id.to_string())),
		}
	}

	async fn list_subscriptions(&self) -> Result<Option<Vec<RemoteSubscription>>, ProviderError> {
		let mut st = self.inner.state.lock();
		let out = st.list_supported.then(|| st.subs.values().cloned().collect());

		let call = FakeCall {
			kind: FakeCallKind::List,
			channel_id: None,
			topic: None,
			subscription_id: None,
			at: Instant::now(),
			ok: true,
		};
		self.record(&mut st, call);
		Ok(out)
	}
}

#[async_trait::async_trait]
impl Transport for FakeProvider {
	async fn connect(&self) -> Result<Box<dyn TransportSession>, ProviderError> {
		let mut st = self.inner.state.lock();
		st.connects += 1;

		if st.connect_failures > 0 {
			st.connect_failures -= 1;
			return Err(ProviderError::TransportUnavailable("fake connect failure".to_string()));
		}

		if !self.inner.preserved {
			st.subs.clear();
		}

		let (tx, rx) = mpsc::unbounded_channel();
		let silenced = Arc::new(AtomicBool::new(false));
		let id = format!("fake-session-{}", uuid::Uuid::new_v4());

		st.session = Some(LiveSession {
			id: id.clone(),
			tx,
			silenced: silenced.clone(),
		});

		Ok(Box::new(FakeSession {
			id,
			rx,
			silenced,
			keepalive: self.inner.keepalive,
			next_keepalive: Instant::now() + self.inner.keepalive,
			preserved: self.inner.preserved,
		}))
	}
}

pub struct FakeSession {
	id: String,
	rx: mpsc::UnboundedReceiver<Signal>,
	silenced: Arc<AtomicBool>,
	keepalive: Duration,
	next_keepalive: Instant,
	preserved: bool,
}

impl FakeSession {
	fn handle(&self, signal: Option<Signal>) -> Result<Option<InboundMessage>, ProviderError> {
		match signal {
			Some(Signal::Inbound(m)) => Ok(Some(m)),
			Some(Signal::Drop) => Err(ProviderError::TransportUnavailable("fake connection dropped".to_string())),
			None => Ok(None),
		}
	}
}

#[async_trait::async_trait]
impl TransportSession for FakeSession {
	fn session_id(&self) -> &str {
		&self.id
	}

	fn keepalive_interval(&self) -> Duration {
		self.keepalive
	}

	fn subscriptions_preserved(&self) -> bool {
		self.preserved
	}

	async fn next_message(&mut self) -> Result<Option<InboundMessage>, ProviderError> {
		loop {
			if self.silenced.load(Ordering::SeqCst) {
				let signal = self.rx.recv().await;
				return self.handle(signal);
			}

			tokio::select! {
				signal = self.rx.recv() => return self.handle(signal),
				_ = sleep_until(self.next_keepalive) => {
					self.next_keepalive += self.keepalive;
					if !self.silenced.load(Ordering::SeqCst) {
						return Ok(Some(InboundMessage::Keepalive));
					}
				}
			}
		}
	}

	async fn close(&mut self) {
		self.rx.close();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn ch(s: &str) -> ChannelId {
		ChannelId::new(s).expect("channel")
	}

	fn tp(s: &str) -> Topic {
		Topic::new(s).expect("topic")
	}

	#[tokio::test]
	async fn create_delete_and_counters() {
		let fake = FakeProvider::new();
		let created = fake
			.create_subscription(&ch("100"), &tp("stream.online"))
			.await
			.expect("create");
		assert!(created.id.starts_with("fake-sub-"));
		assert_eq!(fake.remote().len(), 1);

		let dup = fake.create_subscription(&ch("100"), &tp("stream.online")).await;
		assert!(matches!(dup, Err(ProviderError::Rejected { status: Some(409), .. })));

		fake.delete_subscription(&created.id).await.expect("delete");
		let again = fake.delete_subscription(&created.id).await.unwrap_err();
		assert!(again.is_not_found());

		assert_eq!(fake.create_calls(), 2);
		assert_eq!(fake.delete_calls(), 2);
	}

	#[tokio::test]
	async fn scripted_failures_apply_per_channel() {
		let fake = FakeProvider::new();
		fake.fail_creates_for(&ch("bad"), FakeFailure::Reject { status: 401 });

		let err = fake.create_subscription(&ch("bad"), &tp("stream.online")).await.unwrap_err();
		assert!(err.is_auth());
		assert!(fake.create_subscription(&ch("good"), &tp("stream.online")).await.is_ok());
		assert_eq!(fake.create_calls_for(&ch("bad")), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn session_emits_keepalives_until_silenced() {
		let fake = FakeProvider::with_options(Duration::from_secs(5), true);
		let mut session = fake.connect().await.expect("connect");

		let msg = session.next_message().await.expect("ok").expect("some");
		assert_eq!(msg, InboundMessage::Keepalive);

		assert!(fake.silence_keepalives());
		let waited = tokio::time::timeout(Duration::from_secs(30), session.next_message()).await;
		assert!(waited.is_err(), "silenced session must not yield keepalives");

		assert!(fake.drop_connection());
		let err = session.next_message().await.unwrap_err();
		assert!(matches!(err, ProviderError::TransportUnavailable(_)));
	}

	#[tokio::test]
	async fn fresh_sessions_forget_subscriptions_when_not_preserved() {
		let fake = FakeProvider::with_options(Duration::from_secs(10), false);
		let _s1 = fake.connect().await.expect("connect");
		fake.create_subscription(&ch("1"), &tp("stream.online")).await.expect("create");
		assert_eq!(fake.remote().len(), 1);

		let s2 = fake.connect().await.expect("reconnect");
		assert!(!s2.subscriptions_preserved());
		assert!(fake.remote().is_empty());
		assert_eq!(fake.connect_calls(), 2);
	}
}
