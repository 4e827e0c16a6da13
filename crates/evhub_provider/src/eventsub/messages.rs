#![forbid(unsafe_code)]

use anyhow::Context;
use evhub_domain::{ChannelId, Topic};
use serde::Deserialize;

use crate::{InboundMessage, ProviderEvent};

/// A lightweight peek struct to cheaply inspect `message_type`.
#[derive(Debug, Deserialize)]
pub(crate) struct MetadataPeek {
	pub(crate) metadata: MetadataPeekInner,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MetadataPeekInner {
	pub(crate) message_type: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Metadata {
	pub(crate) message_id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WelcomeMessage {
	pub(crate) payload: SessionPayload,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SessionPayload {
	pub(crate) session: Session,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Session {
	pub(crate) id: String,

	#[serde(default)]
	pub(crate) keepalive_timeout_seconds: Option<u64>,

	#[serde(default)]
	pub(crate) reconnect_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct NotificationMessage {
	pub(crate) metadata: Metadata,
	pub(crate) payload: NotificationPayload,
}

#[derive(Debug, Deserialize)]
pub(crate) struct NotificationPayload {
	pub(crate) subscription: SubscriptionInfo,
	#[serde(default)]
	pub(crate) event: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RevocationMessage {
	pub(crate) payload: RevocationPayload,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RevocationPayload {
	pub(crate) subscription: SubscriptionInfo,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SubscriptionInfo {
	pub(crate) id: String,
	#[serde(default)]
	pub(crate) status: String,
	#[serde(rename = "type")]
	pub(crate) kind: String,
	#[serde(default)]
	pub(crate) condition: serde_json::Value,
}

/// Parsed frame from the EventSub socket.
#[derive(Debug)]
pub(crate) enum WsFrame {
	Welcome(Session),
	Keepalive,
	Reconnect(Session),
	Inbound(InboundMessage),
	/// Understood but irrelevant (or an event we cannot attribute to a channel).
	Ignored(String),
}

/// Extract `metadata.message_type` from a raw EventSub WS JSON string.
pub(crate) fn peek_message_type(raw_json: &str) -> anyhow::Result<String> {
	let peek: MetadataPeek = serde_json::from_str(raw_json).context("parse EventSub metadata peek")?;
	Ok(peek.metadata.message_type)
}

/// Channel id carried in a subscription condition under `condition_key`.
pub(crate) fn condition_channel(condition: &serde_json::Value, condition_key: &str) -> Option<ChannelId> {
	condition
		.get(condition_key)
		.and_then(|v| v.as_str())
		.and_then(|s| ChannelId::new(s).ok())
}

pub(crate) fn parse_frame(raw_json: &str, condition_key: &str) -> anyhow::Result<WsFrame> {
	let ty = peek_message_type(raw_json)?;
	match ty.as_str() {
		"session_welcome" => {
			let msg: WelcomeMessage = serde_json::from_str(raw_json).context("parse session_welcome")?;
			Ok(WsFrame::Welcome(msg.payload.session))
		}
		"session_keepalive" => Ok(WsFrame::Keepalive),
		"session_reconnect" => {
			let msg: WelcomeMessage = serde_json::from_str(raw_json).context("parse session_reconnect")?;
			Ok(WsFrame::Reconnect(msg.payload.session))
		}
		"notification" => {
			let msg: NotificationMessage = serde_json::from_str(raw_json).context("parse notification")?;
			let sub = msg.payload.subscription;
			let Some(channel_id) = condition_channel(&sub.condition, condition_key) else {
				return Ok(WsFrame::Ignored(format!(
					"notification without {condition_key} (type={})",
					sub.kind
				)));
			};
			let topic = Topic::new(sub.kind).context("notification subscription type")?;
			Ok(WsFrame::Inbound(InboundMessage::Event(ProviderEvent {
				subscription_id: Some(sub.id),
				channel_id,
				topic,
				event_id: msg.metadata.message_id,
				payload: msg.payload.event,
			})))
		}
		"revocation" => {
			let msg: RevocationMessage = serde_json::from_str(raw_json).context("parse revocation")?;
			Ok(WsFrame::Inbound(InboundMessage::Revocation {
				subscription_id: msg.payload.subscription.id,
				reason: msg.payload.subscription.status,
			}))
		}
		other => Ok(WsFrame::Ignored(other.to_string())),
	}
}
