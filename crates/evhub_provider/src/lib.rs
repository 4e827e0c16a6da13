#![forbid(unsafe_code)]

pub mod eventsub;
pub mod fake;

use std::fmt;
use std::time::Duration;

use evhub_domain::{ChannelId, SubscriptionKey, Topic};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors at the upstream boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
	/// The persistent connection could not be established or was lost.
	#[error("transport unavailable: {0}")]
	TransportUnavailable(String),

	/// Upstream refused the call for policy reasons (auth, quota, invalid channel). Not retried.
	#[error("provider rejected request (status={status:?}): {detail}")]
	Rejected {
		status: Option<u16>,
		detail: String,
	},

	/// Transient failure (network, 429, 5xx). Retried on a later pass.
	#[error("provider unavailable: {0}")]
	Unavailable(String),

	/// The subscription id is unknown upstream.
	#[error("subscription not found: {0}")]
	NotFound(String),
}

impl ProviderError {
	pub fn rejected(status: Option<u16>, detail: impl Into<String>) -> Self {
		Self::Rejected {
			status,
			detail: detail.into(),
		}
	}

	/// Authorization problems (401/403-equivalent).
	pub fn is_auth(&self) -> bool {
		matches!(self, Self::Rejected { status: Some(401 | 403), .. })
	}

	pub fn is_not_found(&self) -> bool {
		matches!(self, Self::NotFound(_))
	}

	/// Worth another attempt on a later pass.
	pub fn is_retryable(&self) -> bool {
		matches!(self, Self::Unavailable(_) | Self::TransportUnavailable(_))
	}

	/// Short label for logs/metrics.
	pub fn kind(&self) -> &'static str {
		match self {
			Self::TransportUnavailable(_) => "transport_unavailable",
			Self::Rejected { .. } => "rejected",
			Self::Unavailable(_) => "unavailable",
			Self::NotFound(_) => "not_found",
		}
	}
}

/// Result of a successful create call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedSubscription {
	pub id: String,
	/// Provider-reported status string (e.g. `enabled`).
	pub status: String,
	pub cost: i64,
}

/// A subscription as the provider currently sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSubscription {
	pub id: String,
	pub channel_id: ChannelId,
	pub topic: Topic,
	pub status: String,
	pub cost: i64,
}

impl RemoteSubscription {
	pub fn key(&self) -> SubscriptionKey {
		SubscriptionKey::new(self.channel_id.clone(), self.topic.clone())
	}
}

/// One inbound provider event.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderEvent {
	pub subscription_id: Option<String>,
	pub channel_id: ChannelId,
	pub topic: Topic,
	pub event_id: String,
	pub payload: serde_json::Value,
}

impl ProviderEvent {
	pub fn key(&self) -> SubscriptionKey {
		SubscriptionKey::new(self.channel_id.clone(), self.topic.clone())
	}
}

/// What a live session yields.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
	Keepalive,
	Event(ProviderEvent),
	/// Upstream dropped a subscription on its own.
	Revocation {
		subscription_id: String,
		reason: String,
	},
}

/// Subscription management calls (HTTP-style, independent of the persistent connection).
#[async_trait::async_trait]
pub trait SubscriptionApi: Send + Sync + 'static {
	async fn create_subscription(
		&self,
		channel_id: &ChannelId,
		topic: &Topic,
	) -> Result<CreatedSubscription, ProviderError>;

	async fn delete_subscription(&self, subscription_id: &str) -> Result<(), ProviderError>;

	/// Live subscriptions visible to this hub, or `None` when the provider cannot list them.
	async fn list_subscriptions(&self) -> Result<Option<Vec<RemoteSubscription>>, ProviderError> {
		Ok(None)
	}
}

/// Opens the persistent connection.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
	async fn connect(&self) -> Result<Box<dyn TransportSession>, ProviderError>;
}

/// One established persistent connection.
#[async_trait::async_trait]
pub trait TransportSession: Send + 'static {
	fn session_id(&self) -> &str;

	/// Expected interval between keepalives.
	fn keepalive_interval(&self) -> Duration;

	/// False when subscriptions made on earlier sessions are gone upstream.
	fn subscriptions_preserved(&self) -> bool;

	/// Next inbound message; `Ok(None)` when the peer closed cleanly.
	async fn next_message(&mut self) -> Result<Option<InboundMessage>, ProviderError>;

	async fn close(&mut self);
}

/// Wrapper that redacts in logs.
#[derive(Clone, Default)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}

	pub fn is_empty(&self) -> bool {
		self.0.trim().is_empty()
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl<'de> Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}
