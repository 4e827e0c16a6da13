#![forbid(unsafe_code)]

use evhub_domain::{ActiveSubscription, ChannelId, DesiredSubscription, HubState, Topic};
use serde::{Deserialize, Serialize};

/// Consumer -> hub.
///
/// Identifiers arrive as plain strings so that one bad topic inside a `hello` yields a
/// per-topic `error` instead of rejecting the whole message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
	Hello {
		channel: String,
		channel_id: String,
		#[serde(default)]
		topics: Vec<String>,
	},
	Subscribe {
		topic: String,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		channel_id: Option<String>,
	},
	Unsubscribe {
		topic: String,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		channel_id: Option<String>,
	},
	Ping {
		#[serde(default, skip_serializing_if = "Option::is_none")]
		timestamp: Option<i64>,
	},
	Control {
		command: ControlCommand,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		channel_id: Option<String>,
	},
}

impl ClientMessage {
	/// Name used in `ack.cmd` / `error.cmd`.
	pub const fn cmd(&self) -> &'static str {
		match self {
			Self::Hello { .. } => "hello",
			Self::Subscribe { .. } => "subscribe",
			Self::Unsubscribe { .. } => "unsubscribe",
			Self::Ping { .. } => "ping",
			Self::Control { .. } => "control",
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
	Ok,
	Pending,
	Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
	Malformed,
	FrameTooLarge,
	UnknownTopic,
	NoHello,
	DuplicateHello,
	ChannelMismatch,
	Draining,
	Internal,
}

impl ErrorCode {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Malformed => "malformed",
			Self::FrameTooLarge => "frame_too_large",
			Self::UnknownTopic => "unknown_topic",
			Self::NoHello => "no_hello",
			Self::DuplicateHello => "duplicate_hello",
			Self::ChannelMismatch => "channel_mismatch",
			Self::Draining => "draining",
			Self::Internal => "internal",
		}
	}
}

impl std::fmt::Display for ErrorCode {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlCommand {
	Status,
	Resync,
	Drain,
	Undrain,
	Restart,
	Subscriptions,
	ClearAttention,
}

impl ControlCommand {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Status => "status",
			Self::Resync => "resync",
			Self::Drain => "drain",
			Self::Undrain => "undrain",
			Self::Restart => "restart",
			Self::Subscriptions => "subscriptions",
			Self::ClearAttention => "clear_attention",
		}
	}
}

/// Hub -> consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubMessage {
	Ack {
		cmd: String,
		channel_id: String,
		topic: String,
		status: AckStatus,
	},
	Error {
		cmd: String,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		topic: Option<String>,
		code: ErrorCode,
		detail: String,
	},
	Event {
		channel_id: ChannelId,
		topic: Topic,
		event_id: String,
		payload: serde_json::Value,
	},
	Pong {
		timestamp: i64,
	},
	/// Events were dropped for this consumer because its queue was full.
	Lagged {
		dropped: u64,
	},
	ControlResult(Box<ControlResult>),
}

impl HubMessage {
	pub fn ack(cmd: &str, channel_id: &str, topic: &str, status: AckStatus) -> Self {
		Self::Ack {
			cmd: cmd.to_string(),
			channel_id: channel_id.to_string(),
			topic: topic.to_string(),
			status,
		}
	}

	pub fn error(cmd: &str, topic: Option<&str>, code: ErrorCode, detail: impl Into<String>) -> Self {
		Self::Error {
			cmd: cmd.to_string(),
			topic: topic.map(str::to_string),
			code,
			detail: detail.into(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlResult {
	pub command: ControlCommand,
	pub ok: bool,
	#[serde(default)]
	pub detail: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub status: Option<StatusReport>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub subscriptions: Option<SubscriptionsReport>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub pass: Option<PassReport>,
}

impl ControlResult {
	pub fn ok(command: ControlCommand, detail: impl Into<String>) -> Self {
		Self {
			command,
			ok: true,
			detail: detail.into(),
			status: None,
			subscriptions: None,
			pass: None,
		}
	}

	pub fn failed(command: ControlCommand, detail: impl Into<String>) -> Self {
		Self {
			ok: false,
			..Self::ok(command, detail)
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
	pub state: HubState,
	pub desired_count: usize,
	pub active_count: usize,
	pub draining: bool,
	#[serde(default)]
	pub sessions: Vec<SessionReport>,
	#[serde(default)]
	pub channels: Vec<ChannelReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionReport {
	pub session_id: u64,
	pub channel: String,
	pub channel_id: String,
	pub topics: Vec<String>,
	/// Pinged within the liveness window.
	pub alive: bool,
	pub last_seen_secs_ago: u64,
	pub dropped_events: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelReport {
	pub channel_id: String,
	pub desired: usize,
	pub active: usize,
	pub failures: u32,
	pub backoff_level: u32,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub backing_off_until: Option<i64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub needs_attention: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionsReport {
	pub desired: Vec<DesiredSubscription>,
	pub active: Vec<ActiveSubscription>,
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassReport {
	/// Set when the pass did not run (e.g. upstream not connected).
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub skipped: Option<String>,
	pub revalidated: u32,
	pub created: u32,
	pub deleted: u32,
	pub create_failures: u32,
	pub delete_failures: u32,
	pub skipped_backoff: u32,
	pub skipped_attention: u32,
	pub remaining_to_create: usize,
	pub remaining_to_delete: usize,
	pub duration_ms: u64,
}

impl PassReport {
	pub fn skipped(reason: impl Into<String>) -> Self {
		Self {
			skipped: Some(reason.into()),
			..Self::default()
		}
	}

	/// True once nothing is left to create or delete.
	pub fn converged(&self) -> bool {
		self.skipped.is_none() && self.remaining_to_create == 0 && self.remaining_to_delete == 0
	}
}
