#![forbid(unsafe_code)]

//! EventSub-style provider: a WebSocket session that carries events and keepalives, plus a REST
//! API that binds subscriptions to that session.

mod api;
mod messages;

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};
use url::Url;

pub use api::EventSubApi;
use messages::{Session, WsFrame, parse_frame};

use crate::{InboundMessage, ProviderError, SecretString, Transport, TransportSession};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type EventSubWs = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
pub type WsConnector = Arc<dyn Fn(Url) -> BoxFuture<'static, anyhow::Result<EventSubWs>> + Send + Sync>;

pub const DEFAULT_WS_URL: &str = "wss://eventsub.wss.twitch.tv/ws";
pub const DEFAULT_API_BASE_URL: &str = "https://api.twitch.tv";
pub const DEFAULT_CONDITION_KEY: &str = "broadcaster_user_id";

const DEFAULT_KEEPALIVE_SECS: u64 = 10;

#[derive(Clone)]
pub struct EventSubConfig {
	pub client_id: String,
	pub access_token: SecretString,
	pub ws_url: String,
	pub api_base_url: String,
	/// Condition field that carries the channel id.
	pub condition_key: String,
	/// Per-topic subscription version; topics not listed use `"1"`.
	pub topic_versions: BTreeMap<String, String>,
	pub welcome_timeout: Duration,
	pub ws_connector: Option<WsConnector>,
}

impl EventSubConfig {
	pub fn new(client_id: impl Into<String>, access_token: SecretString) -> Self {
		Self {
			client_id: client_id.into(),
			access_token,
			ws_url: DEFAULT_WS_URL.to_string(),
			api_base_url: DEFAULT_API_BASE_URL.to_string(),
			condition_key: DEFAULT_CONDITION_KEY.to_string(),
			topic_versions: BTreeMap::new(),
			welcome_timeout: Duration::from_secs(10),
			ws_connector: None,
		}
	}
}

impl std::fmt::Debug for EventSubConfig {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("EventSubConfig")
			.field("client_id", &self.client_id)
			.field("access_token", &self.access_token)
			.field("ws_url", &self.ws_url)
			.field("api_base_url", &self.api_base_url)
			.field("condition_key", &self.condition_key)
			.field("topic_versions", &self.topic_versions)
			.field("welcome_timeout", &self.welcome_timeout)
			.field("ws_connector", &self.ws_connector.as_ref().map(|_| "<custom>"))
			.finish()
	}
}

/// Build the transport and API halves sharing one session id.
pub fn build(cfg: EventSubConfig) -> anyhow::Result<(EventSubTransport, EventSubApi)> {
	if cfg.client_id.trim().is_empty() || cfg.access_token.is_empty() {
		anyhow::bail!("eventsub provider requires client_id and access_token");
	}

	let ws_url = Url::parse(&cfg.ws_url).with_context(|| format!("parse eventsub ws url: {}", cfg.ws_url))?;
	let api_base_url =
		Url::parse(&cfg.api_base_url).with_context(|| format!("parse eventsub api url: {}", cfg.api_base_url))?;

	let session_id = Arc::new(RwLock::new(None));
	let api = EventSubApi::new(
		api_base_url,
		cfg.client_id.clone(),
		cfg.access_token.clone(),
		cfg.condition_key.clone(),
		cfg.topic_versions.clone(),
		session_id.clone(),
	)?;

	let transport = EventSubTransport {
		ws_url,
		condition_key: cfg.condition_key,
		welcome_timeout: cfg.welcome_timeout,
		connector: cfg.ws_connector.unwrap_or_else(default_connector),
		session_id,
	};

	Ok((transport, api))
}

async fn connect_eventsub_ws(url: Url) -> anyhow::Result<EventSubWs> {
	let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str())
		.await
		.context("connect_async to eventsub ws")?;
	Ok(ws)
}

fn default_connector() -> WsConnector {
	Arc::new(|url: Url| Box::pin(async move { connect_eventsub_ws(url).await }) as BoxFuture<'static, anyhow::Result<EventSubWs>>)
}

pub struct EventSubTransport {
	ws_url: Url,
	condition_key: String,
	welcome_timeout: Duration,
	connector: WsConnector,
	session_id: Arc<RwLock<Option<String>>>,
}

impl EventSubTransport {
	async fn open(&self, url: Url) -> Result<(EventSubWs, Session), ProviderError> {
		let mut ws = (self.connector)(url)
			.await
			.map_err(|e| ProviderError::TransportUnavailable(format!("{e:#}")))?;

		let session = tokio::time::timeout(self.welcome_timeout, read_until_welcome(&mut ws, &self.condition_key))
			.await
			.map_err(|_| ProviderError::TransportUnavailable("timed out waiting for session_welcome".to_string()))?
			.map_err(|e| ProviderError::TransportUnavailable(format!("{e:#}")))?;

		Ok((ws, session))
	}
}

#[async_trait::async_trait]
impl Transport for EventSubTransport {
	async fn connect(&self) -> Result<Box<dyn TransportSession>, ProviderError> {
		let (ws, session) = self.open(self.ws_url.clone()).await?;
		let keepalive = Duration::from_secs(session.keepalive_timeout_seconds.unwrap_or(DEFAULT_KEEPALIVE_SECS));

		info!(session_id = %session.id, keepalive_secs = keepalive.as_secs(), "eventsub connected");
		*self.session_id.write() = Some(session.id.clone());

		Ok(Box::new(EventSubSession {
			ws,
			id: session.id,
			keepalive,
			condition_key: self.condition_key.clone(),
			welcome_timeout: self.welcome_timeout,
			connector: self.connector.clone(),
			shared_session_id: self.session_id.clone(),
		}))
	}
}

async fn read_until_welcome(ws: &mut EventSubWs, condition_key: &str) -> anyhow::Result<Session> {
	loop {
		let Some(msg) = ws.next().await else {
			anyhow::bail!("ws closed before welcome");
		};
		let msg = msg.context("ws read")?;

		match msg {
			Message::Text(t) => {
				if let WsFrame::Welcome(session) = parse_frame(&t, condition_key)? {
					return Ok(session);
				}
			}
			Message::Ping(p) => {
				let _ = ws.send(Message::Pong(p)).await;
			}
			Message::Close(c) => {
				anyhow::bail!("ws closed before welcome: close={c:?}");
			}
			_ => {}
		}
	}
}

pub struct EventSubSession {
	ws: EventSubWs,
	id: String,
	keepalive: Duration,
	condition_key: String,
	welcome_timeout: Duration,
	connector: WsConnector,
	shared_session_id: Arc<RwLock<Option<String>>>,
}

impl EventSubSession {
	/// Move to the socket named by `session_reconnect`. Subscriptions carry over.
	async fn migrate(&mut self, reconnect_url: &str) -> Result<(), ProviderError> {
		let url = Url::parse(reconnect_url)
			.map_err(|e| ProviderError::TransportUnavailable(format!("invalid reconnect_url: {e}")))?;

		let mut ws2 = (self.connector)(url)
			.await
			.map_err(|e| ProviderError::TransportUnavailable(format!("reconnect connect: {e:#}")))?;
		let session = tokio::time::timeout(self.welcome_timeout, read_until_welcome(&mut ws2, &self.condition_key))
			.await
			.map_err(|_| ProviderError::TransportUnavailable("timed out waiting for reconnect welcome".to_string()))?
			.map_err(|e| ProviderError::TransportUnavailable(format!("reconnect welcome: {e:#}")))?;

		let mut old = std::mem::replace(&mut self.ws, ws2);
		let _ = old.close(None).await;

		info!(old_session_id = %self.id, session_id = %session.id, "eventsub session migrated");
		self.id = session.id.clone();
		if let Some(secs) = session.keepalive_timeout_seconds {
			self.keepalive = Duration::from_secs(secs);
		}
		*self.shared_session_id.write() = Some(session.id);
		Ok(())
	}
}

#[async_trait::async_trait]
impl TransportSession for EventSubSession {
	fn session_id(&self) -> &str {
		&self.id
	}

	fn keepalive_interval(&self) -> Duration {
		self.keepalive
	}

	fn subscriptions_preserved(&self) -> bool {
		// Fresh EventSub sockets start with no subscriptions.
		false
	}

	async fn next_message(&mut self) -> Result<Option<InboundMessage>, ProviderError> {
		loop {
			let Some(msg) = self.ws.next().await else {
				return Ok(None);
			};
			let msg = msg.map_err(|e| ProviderError::TransportUnavailable(format!("eventsub ws read: {e}")))?;

			match msg {
				Message::Text(t) => match parse_frame(&t, &self.condition_key) {
					Ok(WsFrame::Keepalive) => return Ok(Some(InboundMessage::Keepalive)),
					Ok(WsFrame::Inbound(m)) => return Ok(Some(m)),
					Ok(WsFrame::Reconnect(session)) => {
						let Some(url) = session.reconnect_url else {
							warn!(session_id = %self.id, "session_reconnect without reconnect_url");
							continue;
						};
						self.migrate(&url).await?;
						return Ok(Some(InboundMessage::Keepalive));
					}
					Ok(WsFrame::Welcome(_)) => {
						debug!(session_id = %self.id, "unexpected session_welcome on live socket");
					}
					Ok(WsFrame::Ignored(kind)) => {
						debug!(session_id = %self.id, %kind, "eventsub message ignored");
					}
					Err(e) => {
						warn!(session_id = %self.id, error = %e, "eventsub message parse failed");
					}
				},
				Message::Ping(p) => {
					let _ = self.ws.send(Message::Pong(p)).await;
				}
				Message::Close(c) => {
					debug!(session_id = %self.id, close = ?c, "eventsub ws closed by peer");
					return Ok(None);
				}
				_ => {}
			}
		}
	}

	async fn close(&mut self) {
		let _ = self.ws.close(None).await;
		let mut shared = self.shared_session_id.write();
		if shared.as_deref() == Some(self.id.as_str()) {
			*shared = None;
		}
	}
}

#[cfg(test)]
mod eventsub_tests;
