#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Transport kind recorded on every desired subscription.
pub const TRANSPORT_WEBSOCKET: &str = "websocket";

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
	#[error("unknown value: {0}")]
	Unknown(String),
}

/// Opaque provider channel identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelId(String);

impl ChannelId {
	/// Create a non-empty `ChannelId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		let trimmed = id.trim();
		if trimmed.is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(trimmed.to_string()))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for ChannelId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for ChannelId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ChannelId::new(s.to_string())
	}
}

impl TryFrom<String> for ChannelId {
	type Error = ParseIdError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		ChannelId::new(value)
	}
}

impl From<ChannelId> for String {
	fn from(value: ChannelId) -> Self {
		value.0
	}
}

/// Event topic (e.g. `stream.online`). Opaque to the hub beyond routing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Topic(String);

impl Topic {
	/// Create a topic; must be non-empty and contain no whitespace.
	pub fn new(topic: impl Into<String>) -> Result<Self, ParseIdError> {
		let topic = topic.into();
		let trimmed = topic.trim();
		if trimmed.is_empty() {
			return Err(ParseIdError::Empty);
		}
		if trimmed.chars().any(char::is_whitespace) {
			return Err(ParseIdError::InvalidFormat(format!("topic contains whitespace: {trimmed}")));
		}
		Ok(Self(trimmed.to_string()))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for Topic {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for Topic {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Topic::new(s.to_string())
	}
}

impl TryFrom<String> for Topic {
	type Error = ParseIdError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		Topic::new(value)
	}
}

impl From<Topic> for String {
	fn from(value: Topic) -> Self {
		value.0
	}
}

/// Join key between desired and active subscriptions: `(channel_id, topic)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriptionKey {
	pub channel_id: ChannelId,
	pub topic: Topic,
}

impl SubscriptionKey {
	pub fn new(channel_id: ChannelId, topic: Topic) -> Self {
		Self { channel_id, topic }
	}

	/// Parse a `channel_id/topic` string.
	pub fn parse(s: &str) -> Result<Self, ParseIdError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		let (channel_s, topic_s) = s
			.split_once('/')
			.ok_or_else(|| ParseIdError::InvalidFormat("expected channel_id/topic".into()))?;

		Ok(Self::new(ChannelId::new(channel_s)?, Topic::new(topic_s)?))
	}
}

impl fmt::Display for SubscriptionKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}/{}", self.channel_id, self.topic)
	}
}

impl FromStr for SubscriptionKey {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		SubscriptionKey::parse(s)
	}
}

/// Status of an active (provider-confirmed) subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
	Pending,
	Enabled,
	Error,
	/// Persisted before a restart and not yet re-validated.
	Stale,
}

impl SubscriptionStatus {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Pending => "pending",
			Self::Enabled => "enabled",
			Self::Error => "error",
			Self::Stale => "stale",
		}
	}

	/// Map a provider status string (`enabled`, `*_pending`, failures) onto the hub's view.
	pub fn from_provider(s: &str) -> Self {
		let s = s.trim().to_ascii_lowercase();
		if s == "enabled" {
			Self::Enabled
		} else if s.contains("pending") {
			Self::Pending
		} else {
			Self::Error
		}
	}
}

impl fmt::Display for SubscriptionStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for SubscriptionStatus {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"" => Err(ParseIdError::Empty),
			"pending" => Ok(Self::Pending),
			"enabled" => Ok(Self::Enabled),
			"error" => Ok(Self::Error),
			"stale" => Ok(Self::Stale),
			other => Err(ParseIdError::Unknown(other.to_string())),
		}
	}
}

/// Upstream connection state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
	#[default]
	Down,
	Connecting,
	Up,
	/// Connected but a keepalive is overdue.
	Degraded,
}

impl ConnectionState {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Down => "down",
			Self::Connecting => "connecting",
			Self::Up => "up",
			Self::Degraded => "degraded",
		}
	}

	/// True while a session exists (`up` or `degraded`).
	pub const fn is_connected(self) -> bool {
		matches!(self, Self::Up | Self::Degraded)
	}
}

impl fmt::Display for ConnectionState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for ConnectionState {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"" => Err(ParseIdError::Empty),
			"down" => Ok(Self::Down),
			"connecting" => Ok(Self::Connecting),
			"up" => Ok(Self::Up),
			"degraded" => Ok(Self::Degraded),
			other => Err(ParseIdError::Unknown(other.to_string())),
		}
	}
}

/// A `(channel_id, topic)` pair some consumer wants delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredSubscription {
	pub channel_id: ChannelId,
	pub topic: Topic,
	pub transport: String,
	/// Reason the provider refused this entry; creates are skipped while set.
	#[serde(default)]
	pub needs_attention: Option<String>,
	pub created_at: i64,
	pub updated_at: i64,
}

impl DesiredSubscription {
	pub fn key(&self) -> SubscriptionKey {
		SubscriptionKey::new(self.channel_id.clone(), self.topic.clone())
	}
}

/// The hub's record of a provider-confirmed subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveSubscription {
	pub provider_subscription_id: String,
	pub channel_id: ChannelId,
	pub topic: Topic,
	pub status: SubscriptionStatus,
	pub cost: i64,
	pub created_at: i64,
	pub updated_at: i64,
}

impl ActiveSubscription {
	pub fn key(&self) -> SubscriptionKey {
		SubscriptionKey::new(self.channel_id.clone(), self.topic.clone())
	}
}

/// Keys of the persisted `hub_state` table.
pub mod state_keys {
	pub const CONNECTION: &str = "connection";
	pub const LAST_CONNECT_TS: &str = "last_connect_ts";
	pub const LAST_RECONCILE_TS: &str = "last_reconcile_ts";
	pub const ERROR_BURST_LEVEL: &str = "error_burst_level";
	pub const TOTAL_EVENTS_ROUTED: &str = "total_events_routed";
	pub const RECONNECT_COUNT: &str = "reconnect_count";
}

/// Operational facts about the hub.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubState {
	pub connection: ConnectionState,
	pub last_connect_ts: Option<i64>,
	pub last_reconcile_ts: Option<i64>,
	pub error_burst_level: u32,
	pub total_events_routed: u64,
	pub reconnect_count: u64,
}

impl HubState {
	/// Rebuild from persisted key/value rows. Unknown keys and unparsable values are ignored.
	pub fn from_pairs(pairs: &BTreeMap<String, String>) -> Self {
		let mut state = Self::default();
		for (k, v) in pairs {
			state.apply(k, v);
		}
		state
	}

	/// Apply one persisted row; returns false if the key or value was not understood.
	pub fn apply(&mut self, key: &str, value: &str) -> bool {
		let value = value.trim();
		match key {
			state_keys::CONNECTION => value.parse().map(|c| self.connection = c).is_ok(),
			state_keys::LAST_CONNECT_TS => value.parse().map(|ts| self.last_connect_ts = Some(ts)).is_ok(),
			state_keys::LAST_RECONCILE_TS => value.parse().map(|ts| self.last_reconcile_ts = Some(ts)).is_ok(),
			state_keys::ERROR_BURST_LEVEL => value.parse().map(|l| self.error_burst_level = l).is_ok(),
			state_keys::TOTAL_EVENTS_ROUTED => value.parse().map(|n| self.total_events_routed = n).is_ok(),
			state_keys::RECONNECT_COUNT => value.parse().map(|n| self.reconnect_count = n).is_ok(),
			_ => false,
		}
	}

	/// Key/value rows for persistence.
	pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
		let mut out = vec![
			(state_keys::CONNECTION, self.connection.as_str().to_string()),
			(state_keys::ERROR_BURST_LEVEL, self.error_burst_level.to_string()),
			(state_keys::TOTAL_EVENTS_ROUTED, self.total_events_routed.to_string()),
			(state_keys::RECONNECT_COUNT, self.reconnect_count.to_string()),
		];
		if let Some(ts) = self.last_connect_ts {
			out.push((state_keys::LAST_CONNECT_TS, ts.to_string()));
		}
		if let Some(ts) = self.last_reconcile_ts {
			out.push((state_keys::LAST_RECONCILE_TS, ts.to_string()));
		}
		out
	}
}
