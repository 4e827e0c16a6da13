#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use evhub_domain::{ChannelId, SubscriptionKey, Topic};
use evhub_protocol::{
	AckStatus, ClientMessage, ControlCommand, ControlResult, ErrorCode, FramingError, HubMessage, encode_line_into,
	try_decode_line_from_buffer,
};
use evhub_util::time::unix_secs_now;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::ServerSettings;
use crate::server::fanout::Fanout;
use crate::server::reconcile::ReconcileHandle;
use crate::server::registry::SessionRegistry;
use crate::server::store::SubscriptionStore;
use crate::server::wait_shutdown;

/// Answers `control` messages. Implemented by the hub.
#[async_trait::async_trait]
pub trait ControlHandler: Send + Sync + 'static {
	async fn handle(&self, command: ControlCommand, channel_id: Option<ChannelId>) -> ControlResult;
}

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub max_frame_bytes: usize,
	pub queue_capacity: usize,
	pub idle_timeout: Duration,
	pub malformed_limit: u32,
	pub malformed_window: Duration,
	pub allowed_topics: Vec<String>,
}

impl ConnectionSettings {
	pub fn from_server(s: &ServerSettings) -> Self {
		Self {
			max_frame_bytes: s.max_frame_bytes,
			queue_capacity: s.consumer_queue_capacity.max(1),
			idle_timeout: s.idle_timeout,
			malformed_limit: s.malformed_limit.max(1),
			malformed_window: s.malformed_window,
			allowed_topics: s.allowed_topics.clone(),
		}
	}

	fn topic_allowed(&self, topic: &Topic) -> bool {
		self.allowed_topics.is_empty() || self.allowed_topics.iter().any(|t| t == topic.as_str())
	}
}

/// Everything a consumer connection needs from the hub.
pub struct ConnectionContext {
	pub store: Arc<dyn SubscriptionStore>,
	pub registry: Arc<Mutex<SessionRegistry>>,
	pub fanout: Fanout,
	pub reconcile: ReconcileHandle,
	pub control: Arc<dyn ControlHandler>,
	pub settings: ConnectionSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
	Eof,
	ReadError,
	WriterGone,
	FrameTooLarge,
	TooManyMalformed,
	HubShutdown,
}

impl CloseReason {
	const fn as_str(self) -> &'static str {
		match self {
			Self::Eof => "eof",
			Self::ReadError => "read_error",
			Self::WriterGone => "writer_closed",
			Self::FrameTooLarge => "frame_too_large",
			Self::TooManyMalformed => "too_many_malformed",
			Self::HubShutdown => "hub_shutdown",
		}
	}
}

/// Serve one consumer until it goes away or the hub shuts down.
///
/// Messages from one connection are handled strictly in order. On a consumer-side close the
/// session's pairs are released; a hub shutdown leaves the desired set alone.
pub async fn handle_connection<S>(
	session_id: u64,
	stream: S,
	ctx: Arc<ConnectionContext>,
	mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()>
where
	S: AsyncRead + AsyncWrite + Send + 'static,
{
	struct SessionGaugeGuard;
	impl Drop for SessionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("evhub_ipc_connections").decrement(1.0);
		}
	}

	metrics::gauge!("evhub_ipc_connections").increment(1.0);
	let _gauge = SessionGaugeGuard;

	let (mut rd, wr) = tokio::io::split(stream);
	let (out_tx, out_rx) = mpsc::channel::<HubMessage>(ctx.settings.queue_capacity);
	let writer = tokio::spawn(write_loop(session_id, wr, out_rx, ctx.settings.max_frame_bytes));

	ctx.fanout.register(session_id, out_tx.clone()).await;
	debug!(session_id, "ipc: connection accepted");

	let mut session = Session {
		id: session_id,
		ctx: ctx.clone(),
		out: out_tx,
		malformed: VecDeque::new(),
	};

	let mut buf = BytesMut::with_capacity(8 * 1024);
	let reason = 'conn: loop {
		let read = tokio::select! {
			_ = wait_shutdown(&mut shutdown_rx) => None,
			r = tokio::time::timeout(ctx.settings.idle_timeout, rd.read_buf(&mut buf)) => Some(r),
		};
		let Some(read) = read else {
			break CloseReason::HubShutdown;
		};

		match read {
			Ok(Ok(0)) => break CloseReason::Eof,
			Ok(Ok(n)) => {
				metrics::counter!("evhub_ipc_bytes_in_total").increment(n as u64);
			}
			Ok(Err(e)) => {
				debug!(session_id, error = %e, "ipc: read failed");
				break CloseReason::ReadError;
			}
			// a consumer that only reads is still healthy; its liveness comes from pings
			Err(_) if session.out.is_closed() => break CloseReason::WriterGone,
			Err(_) => {
				debug!(session_id, "ipc: no input within idle timeout");
				continue;
			}
		}

		loop {
			match try_decode_line_from_buffer::<ClientMessage>(&mut buf, ctx.settings.max_frame_bytes) {
				Ok(Some(msg)) => {
					metrics::counter!("evhub_ipc_messages_in_total", "cmd" => msg.cmd()).increment(1);
					if !session.dispatch(msg).await {
						break 'conn CloseReason::ReadError;
					}
				}
				Ok(None) => break,
				Err(FramingError::Malformed(detail)) => {
					if session.malformed(detail).await {
						break 'conn CloseReason::TooManyMalformed;
					}
				}
				Err(e) => {
					metrics::counter!("evhub_ipc_frame_too_large_total").increment(1);
					let _ = session
						.reply(HubMessage::error("frame", None, ErrorCode::FrameTooLarge, e.to_string()))
						.await;
					break 'conn CloseReason::FrameTooLarge;
				}
			}
		}
	};

	session.teardown(reason).await;
	drop(session);

	// the writer exits once every sender is gone and the queue is flushed
	match tokio::time::timeout(Duration::from_secs(5), writer).await {
		Ok(Ok(())) => {}
		Ok(Err(e)) => warn!(session_id, error = %e, "ipc: writer task failed"),
		Err(_) => warn!(session_id, "ipc: writer did not finish flushing"),
	}

	Ok(())
}

async fn write_loop<W>(session_id: u64, mut wr: W, mut rx: mpsc::Receiver<HubMessage>, max_frame_bytes: usize)
where
	W: AsyncWrite + Unpin,
{
	let mut buf = BytesMut::with_capacity(8 * 1024);

	while let Some(msg) = rx.recv().await {
		buf.clear();
		if let Err(e) = encode_line_into(&mut buf, &msg, max_frame_bytes) {
			warn!(session_id, error = %e, "ipc: dropping unencodable outbound message");
			continue;
		}

		// batch whatever else is already queued
		while buf.len() < max_frame_bytes
			&& let Ok(next) = rx.try_recv()
		{
			if let Err(e) = encode_line_into(&mut buf, &next, max_frame_bytes) {
				warn!(session_id, error = %e, "ipc: dropping unencodable outbound message");
			}
		}

		if let Err(e) = wr.write_all(&buf).await {
			debug!(session_id, error = %e, "ipc: write failed");
			break;
		}
		if let Err(e) = wr.flush().await {
			debug!(session_id, error = %e, "ipc: flush failed");
			break;
		}
		metrics::counter!("evhub_ipc_bytes_out_total").increment(buf.len() as u64);
	}

	let _ = wr.shutdown().await;
}

struct Session {
	id: u64,
	ctx: Arc<ConnectionContext>,
	out: mpsc::Sender<HubMessage>,
	malformed: VecDeque<Instant>,
}

impl Session {
	/// Returns false once the consumer can no longer be written to.
	async fn reply(&self, msg: HubMessage) -> bool {
		self.out.send(msg).await.is_ok()
	}

	/// Returns true when the connection should be closed.
	async fn malformed(&mut self, detail: String) -> bool {
		metrics::counter!("evhub_ipc_malformed_total").increment(1);
		debug!(session_id = self.id, detail = %detail, "ipc: malformed message");

		let now = Instant::now();
		let window = self.ctx.settings.malformed_window;
		self.malformed.push_back(now);
		while let Some(front) = self.malformed.front() {
			if now.duration_since(*front) > window {
				self.malformed.pop_front();
			} else {
				break;
			}
		}

		let _ = self
			.reply(HubMessage::error("unknown", None, ErrorCode::Malformed, detail))
			.await;

		if self.malformed.len() as u32 >= self.ctx.settings.malformed_limit {
			warn!(session_id = self.id, count = self.malformed.len(), "ipc: closing connection after repeated malformed messages");
			return true;
		}
		false
	}

	async fn dispatch(&mut self, msg: ClientMessage) -> bool {
		match msg {
			ClientMessage::Hello {
				channel,
				channel_id,
				topics,
			} => self.hello(channel, channel_id, topics).await,
			ClientMessage::Subscribe { topic, channel_id } => self.subscribe(topic, channel_id).await,
			ClientMessage::Unsubscribe { topic, channel_id } => self.unsubscribe(topic, channel_id).await,
			ClientMessage::Ping { timestamp } => {
				self.ctx.registry.lock().await.touch(self.id);
				self.reply(HubMessage::Pong {
					timestamp: timestamp.unwrap_or_else(unix_secs_now),
				})
				.await
			}
			ClientMessage::Control { command, channel_id } => self.control(command, channel_id).await,
		}
	}

	async fn hello(&mut self, channel: String, channel_id: String, topics: Vec<String>) -> bool {
		let channel_id = match ChannelId::new(channel_id) {
			Ok(c) => c,
			Err(e) => {
				return self
					.reply(HubMessage::error("hello", None, ErrorCode::Malformed, format!("invalid channel_id: {e}")))
					.await;
			}
		};

		{
			let mut reg = self.ctx.registry.lock().await;
			if !reg.register(self.id, channel.clone(), channel_id.clone()) {
				drop(reg);
				return self
					.reply(HubMessage::error("hello", None, ErrorCode::DuplicateHello, "hello already received"))
					.await;
			}
			metrics::gauge!("evhub_ipc_sessions").set(reg.len() as f64);
		}

		info!(session_id = self.id, %channel, %channel_id, topics = topics.len(), "ipc: consumer registered");

		let mut acquired_any = false;
		for topic in topics {
			let (reply, acquired) = self.add_topic("hello", &channel_id, topic).await;
			acquired_any |= acquired;
			if !self.reply(reply).await {
				return false;
			}
		}
		if acquired_any {
			self.ctx.reconcile.request();
		}
		true
	}

	async fn subscribe(&mut self, topic: String, channel_id: Option<String>) -> bool {
		let session_channel = match self.session_channel("subscribe", &topic, channel_id.as_deref()).await {
			Ok(c) => c,
			Err(reply) => return self.reply(reply).await,
		};

		let (reply, acquired) = self.add_topic("subscribe", &session_channel, topic).await;
		if acquired {
			self.ctx.reconcile.request();
		}
		self.reply(reply).await
	}

	async fn unsubscribe(&mut self, topic: String, channel_id: Option<String>) -> bool {
		let session_channel = match self.session_channel("unsubscribe", &topic, channel_id.as_deref()).await {
			Ok(c) => c,
			Err(reply) => return self.reply(reply).await,
		};

		let parsed = match Topic::new(topic.as_str()) {
			Ok(t) => t,
			Err(e) => {
				return self
					.reply(HubMessage::error("unsubscribe", Some(&topic), ErrorCode::UnknownTopic, e.to_string()))
					.await;
			}
		};
		let key = SubscriptionKey::new(session_channel.clone(), parsed.clone());

		let reply = {
			let mut reg = self.ctx.registry.lock().await;
			match reg.remove_topic(self.id, &parsed) {
				Some(true) => match self.ctx.store.remove_desired(&key).await {
					Ok(_) => {
						debug!(session_id = self.id, %key, "ipc: desired entry released");
						None
					}
					Err(e) => {
						reg.add_topic(self.id, &parsed);
						error!(session_id = self.id, %key, error = %e, "ipc: remove_desired failed");
						metrics::counter!("evhub_store_errors_total", "op" => "remove_desired").increment(1);
						Some(HubMessage::error(
							"unsubscribe",
							Some(&topic),
							ErrorCode::Internal,
							"could not update desired subscriptions",
						))
					}
				},
				_ => None,
			}
		};

		if let Some(err) = reply {
			return self.reply(err).await;
		}

		self.ctx.fanout.detach(self.id, &key).await;
		self.ctx.reconcile.request();
		self.reply(HubMessage::ack("unsubscribe", session_channel.as_str(), &topic, AckStatus::Ok))
			.await
	}

	async fn control(&mut self, command: ControlCommand, channel_id: Option<String>) -> bool {
		let channel_id = match channel_id.map(ChannelId::new).transpose() {
			Ok(c) => c,
			Err(e) => {
				let result = ControlResult::failed(command, format!("invalid channel_id: {e}"));
				return self.reply(HubMessage::ControlResult(Box::new(result))).await;
			}
		};

		info!(session_id = self.id, command = command.as_str(), "ipc: control command");
		let result = self.ctx.control.handle(command, channel_id).await;
		self.reply(HubMessage::ControlResult(Box::new(result))).await
	}

	/// The session's channel, or the error to send back.
	async fn session_channel(&self, cmd: &str, topic: &str, requested: Option<&str>) -> Result<ChannelId, HubMessage> {
		let reg = self.ctx.registry.lock().await;
		let Some(session) = reg.session(self.id) else {
			return Err(HubMessage::error(cmd, Some(topic), ErrorCode::NoHello, "send hello first"));
		};

		if let Some(requested) = requested
			&& requested != session.channel_id.as_str()
		{
			return Err(HubMessage::error(
				cmd,
				Some(topic),
				ErrorCode::ChannelMismatch,
				format!("session is bound to channel {}", session.channel_id),
			));
		}
		Ok(session.channel_id.clone())
	}

	/// Validate and record one topic. Returns the reply and whether the pair became desired.
	async fn add_topic(&self, cmd: &str, channel_id: &ChannelId, topic: String) -> (HubMessage, bool) {
		let parsed = match Topic::new(topic.as_str()) {
			Ok(t) if self.ctx.settings.topic_allowed(&t) => t,
			Ok(_) => {
				return (
					HubMessage::error(cmd, Some(&topic), ErrorCode::UnknownTopic, format!("topic {topic} is not served")),
					false,
				);
			}
			Err(e) => {
				return (
					HubMessage::error(cmd, Some(&topic), ErrorCode::UnknownTopic, e.to_string()),
					false,
				);
			}
		};
		let key = SubscriptionKey::new(channel_id.clone(), parsed.clone());

		let mut reg = self.ctx.registry.lock().await;
		let acquired = match reg.add_topic(self.id, &parsed) {
			Some(true) => match self.ctx.store.add_desired(&key).await {
				Ok(_) => true,
				Err(e) => {
					reg.remove_topic(self.id, &parsed);
					error!(session_id = self.id, %key, error = %e, "ipc: add_desired failed");
					metrics::counter!("evhub_store_errors_total", "op" => "add_desired").increment(1);
					return (
						HubMessage::error(cmd, Some(&topic), ErrorCode::Internal, "could not record desired subscription"),
						false,
					);
				}
			},
			Some(false) => false,
			None => {
				return (
					HubMessage::error(cmd, Some(&topic), ErrorCode::NoHello, "send hello first"),
					false,
				);
			}
		};
		drop(reg);

		self.ctx.fanout.attach(self.id, key).await;
		(HubMessage::ack(cmd, channel_id.as_str(), &topic, AckStatus::Ok), acquired)
	}

	async fn teardown(&self, reason: CloseReason) {
		self.ctx.fanout.unregister(self.id).await;

		let mut reg = self.ctx.registry.lock().await;
		let channel = reg.session(self.id).map(|s| s.channel_id.clone());
		let released = reg.remove_session(self.id);
		metrics::gauge!("evhub_ipc_sessions").set(reg.len() as f64);

		if reason == CloseReason::HubShutdown {
			drop(reg);
			debug!(session_id = self.id, "ipc: session closed by hub shutdown");
			return;
		}

		let mut removed = 0usize;
		for key in &released {
			match self.ctx.store.remove_desired(key).await {
				Ok(_) => removed += 1,
				Err(e) => {
					error!(session_id = self.id, %key, error = %e, "ipc: remove_desired on disconnect failed");
					metrics::counter!("evhub_store_errors_total", "op" => "remove_desired").increment(1);
				}
			}
		}
		drop(reg);

		if removed > 0 {
			self.ctx.reconcile.request();
		}

		if let Some(channel_id) = channel {
			info!(
				session_id = self.id,
				%channel_id,
				reason = reason.as_str(),
				released = removed,
				"ipc: consumer disconnected"
			);
		} else {
			debug!(session_id = self.id, reason = reason.as_str(), "ipc: connection closed before hello");
		}
	}
}
