#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashMap};

use evhub_domain::{ChannelId, SubscriptionKey, Topic};
use evhub_protocol::SessionReport;
use tokio::time::{Duration, Instant};

/// One consumer connection that has said hello.
#[derive(Debug, Clone)]
pub struct ConsumerSession {
	pub channel: String,
	pub channel_id: ChannelId,
	pub topics: BTreeSet<Topic>,
	pub last_ping: Instant,
}

/// Which sessions want which `(channel_id, topic)` pairs.
///
/// A pair is "acquired" when its first session asks for it and "released" when its last
/// session lets go. Only those two transitions touch the desired set.
#[derive(Debug, Default)]
pub struct SessionRegistry {
	sessions: HashMap<u64, ConsumerSession>,
	refcounts: HashMap<SubscriptionKey, u64>,
}

impl SessionRegistry {
	/// Returns false when the session already said hello.
	pub fn register(&mut self, session_id: u64, channel: String, channel_id: ChannelId) -> bool {
		if self.sessions.contains_key(&session_id) {
			return false;
		}
		self.sessions.insert(
			session_id,
			ConsumerSession {
				channel,
				channel_id,
				topics: BTreeSet::new(),
				last_ping: Instant::now(),
			},
		);
		true
	}

	pub fn session(&self, session_id: u64) -> Option<&ConsumerSession> {
		self.sessions.get(&session_id)
	}

	pub fn len(&self) -> usize {
		self.sessions.len()
	}

	pub fn is_empty(&self) -> bool {
		self.sessions.is_empty()
	}

	/// Returns `Some(true)` if this acquired the pair, `None` for an unknown session.
	pub fn add_topic(&mut self, session_id: u64, topic: &Topic) -> Option<bool> {
		let session = self.sessions.get_mut(&session_id)?;
		if !session.topics.insert(topic.clone()) {
			return Some(false);
		}

		let key = SubscriptionKey::new(session.channel_id.clone(), topic.clone());
		let rc = self.refcounts.entry(key).or_insert(0);
		*rc += 1;
		Some(*rc == 1)
	}

	/// Returns `Some(true)` if this released the pair.
	pub fn remove_topic(&mut self, session_id: u64, topic: &Topic) -> Option<bool> {
		let session = self.sessions.get_mut(&session_id)?;
		if !session.topics.remove(topic) {
			return Some(false);
		}

		let key = SubscriptionKey::new(session.channel_id.clone(), topic.clone());
		Some(release(&mut self.refcounts, key))
	}

	/// Drop a session and return the pairs nobody wants anymore.
	pub fn remove_session(&mut self, session_id: u64) -> Vec<SubscriptionKey> {
		let Some(prev) = self.sessions.remove(&session_id) else {
			return Vec::new();
		};

		prev.topics
			.into_iter()
			.map(|topic| SubscriptionKey::new(prev.channel_id.clone(), topic))
			.filter(|key| release(&mut self.refcounts, key.clone()))
			.collect()
	}

	pub fn touch(&mut self, session_id: u64) {
		if let Some(s) = self.sessions.get_mut(&session_id) {
			s.last_ping = Instant::now();
		}
	}

	pub fn refcount(&self, key: &SubscriptionKey) -> u64 {
		self.refcounts.get(key).copied().unwrap_or(0)
	}

	/// Liveness rows for `status`. `dropped` maps session id to events dropped for it.
	pub fn snapshot(&self, ping_timeout: Duration, dropped: &HashMap<u64, u64>) -> Vec<SessionReport> {
		let mut out: Vec<SessionReport> = self
			.sessions
			.iter()
			.map(|(id, s)| {
				let idle = s.last_ping.elapsed();
				SessionReport {
					session_id: *id,
					channel: s.channel.clone(),
					channel_id: s.channel_id.to_string(),
					topics: s.topics.iter().map(ToString::to_string).collect(),
					alive: idle <= ping_timeout,
					last_seen_secs_ago: idle.as_secs(),
					dropped_events: dropped.get(id).copied().unwrap_or(0),
				}
			})
			.collect();
		out.sort_by_key(|r| r.session_id);
		out
	}
}

fn release(refcounts: &mut HashMap<SubscriptionKey, u64>, key: SubscriptionKey) -> bool {
	match refcounts.get_mut(&key) {
		Some(rc) if *rc <= 1 => {
			refcounts.remove(&key);
			true
		}
		Some(rc) => {
			*rc -= 1;
			false
		}
		None => false,
	}
}
