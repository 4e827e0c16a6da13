#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::time::Duration;

use bytes::BytesMut;
use evhub_protocol::{
	AckStatus, ClientMessage, ControlCommand, ControlResult, DEFAULT_MAX_FRAME_SIZE, ErrorCode, FramingError,
	HubMessage, encode_line, try_decode_line_from_buffer,
};
use evhub_util::endpoint::IpcEndpoint;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Socket the hub listens on unless told otherwise.
pub const DEFAULT_HUB_SOCKET: &str = "unix:///tmp/evhub.sock";

/// Consumer client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
	/// Maximum inbound/outbound line size.
	pub max_frame_bytes: usize,

	/// How long a request waits for its reply.
	pub request_timeout: Duration,

	/// Connection attempts made by [`HubClient::connect_with_retry`].
	pub retry_attempts: u32,

	/// Delay before retry `n` is `retry_base * 2^n`.
	pub retry_base: Duration,

	/// Ping cadence used by [`HubClient::next_message_keepalive`]. Keep it under the
	/// hub's ping timeout.
	pub ping_interval: Duration,
}

impl Default for ClientConfig {
	fn default() -> Self {
		Self {
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			request_timeout: Duration::from_secs(10),
			retry_attempts: 5,
			retry_base: Duration::from_secs(1),
			ping_interval: Duration::from_secs(15),
		}
	}
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
	/// The hub could not be reached.
	#[error("failed to connect: {0}")]
	Connect(String),

	#[error("timed out waiting for {0}")]
	Timeout(&'static str),

	#[error(transparent)]
	Framing(#[from] FramingError),

	/// Unexpected message ordering or a closed connection.
	#[error("protocol error: {0}")]
	Protocol(String),

	#[error("io error: {0}")]
	Io(String),

	/// The hub answered with an `error` message.
	#[error("rejected ({code}): {detail}")]
	Rejected { code: ErrorCode, detail: String },
}

impl ClientError {
	/// The hub's error code, when the hub rejected the request.
	pub fn code(&self) -> Option<ErrorCode> {
		match self {
			Self::Rejected { code, .. } => Some(*code),
			_ => None,
		}
	}
}

/// Per-topic outcome of a `hello`.
#[derive(Debug, Clone, PartialEq)]
pub enum TopicReply {
	Acked { topic: String, status: AckStatus },
	Rejected { topic: String, code: ErrorCode, detail: String },
}

impl TopicReply {
	pub fn topic(&self) -> &str {
		match self {
			Self::Acked { topic, .. } | Self::Rejected { topic, .. } => topic,
		}
	}

	pub fn is_ok(&self) -> bool {
		matches!(self, Self::Acked { .. })
	}
}

type Reader = Box<dyn AsyncRead + Send + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// One consumer connection to the hub.
///
/// Replies are matched to requests in order; events and lag notices that arrive while a
/// request is outstanding are kept and handed out by [`HubClient::next_message`].
pub struct HubClient {
	rd: Reader,
	wr: Writer,
	buf: BytesMut,
	pending: VecDeque<HubMessage>,
	cfg: ClientConfig,
	last_ping: Instant,
}

impl HubClient {
	pub async fn connect(endpoint: &IpcEndpoint) -> Result<Self, ClientError> {
		Self::connect_with(endpoint, ClientConfig::default()).await
	}

	pub async fn connect_with(endpoint: &IpcEndpoint, cfg: ClientConfig) -> Result<Self, ClientError> {
		let (rd, wr): (Reader, Writer) = match endpoint {
			#[cfg(unix)]
			IpcEndpoint::Unix(path) => {
				let stream = tokio::net::UnixStream::connect(path)
					.await
					.map_err(|e| ClientError::Connect(format!("{endpoint}: {e}")))?;
				let (rd, wr) = stream.into_split();
				(Box::new(rd) as Reader, Box::new(wr) as Writer)
			}
			#[cfg(not(unix))]
			IpcEndpoint::Unix(_) => {
				return Err(ClientError::Connect(format!("{endpoint}: unix sockets are not supported here")));
			}
			IpcEndpoint::Tcp { .. } => {
				let hostport = endpoint.hostport().unwrap_or_default();
				let stream = tokio::net::TcpStream::connect(&hostport)
					.await
					.map_err(|e| ClientError::Connect(format!("{endpoint}: {e}")))?;
				let _ = stream.set_nodelay(true);
				let (rd, wr) = stream.into_split();
				(Box::new(rd) as Reader, Box::new(wr) as Writer)
			}
		};

		debug!(%endpoint, "connected to hub");
		Ok(Self {
			rd,
			wr,
			buf: BytesMut::with_capacity(8 * 1024),
			pending: VecDeque::new(),
			cfg,
			last_ping: Instant::now(),
		})
	}

	/// Connect, retrying with exponential backoff while the hub is unreachable.
	pub async fn connect_with_retry(endpoint: &IpcEndpoint, cfg: ClientConfig) -> Result<Self, ClientError> {
		let attempts = cfg.retry_attempts.max(1);
		let mut last_err = None;

		for attempt in 0..attempts {
			match Self::connect_with(endpoint, cfg.clone()).await {
				Ok(client) => {
					if attempt > 0 {
						info!(%endpoint, attempt = attempt + 1, "connected to hub after retry");
					}
					return Ok(client);
				}
				Err(e) => {
					if attempt + 1 < attempts {
						let delay = cfg.retry_base.saturating_mul(1u32 << attempt.min(16));
						warn!(%endpoint, attempt = attempt + 1, error = %e, delay_ms = delay.as_millis() as u64, "hub unreachable; retrying");
						tokio::time::sleep(delay).await;
					}
					last_err = Some(e);
				}
			}
		}

		Err(last_err.unwrap_or_else(|| ClientError::Connect(format!("{endpoint}: no attempts made"))))
	}

	pub async fn send(&mut self, msg: &ClientMessage) -> Result<(), ClientError> {
		let line = encode_line(msg, self.cfg.max_frame_bytes)?;
		self.wr.write_all(&line).await.map_err(|e| ClientError::Io(e.to_string()))?;
		self.wr.flush().await.map_err(|e| ClientError::Io(e.to_string()))?;
		if matches!(msg, ClientMessage::Ping { .. }) {
			self.last_ping = Instant::now();
		}
		Ok(())
	}

	/// Write raw bytes, bypassing the encoder.
	pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
		self.wr.write_all(bytes).await.map_err(|e| ClientError::Io(e.to_string()))?;
		self.wr.flush().await.map_err(|e| ClientError::Io(e.to_string()))
	}

	/// Register the consumer and collect one reply per topic.
	///
	/// A `hello` the hub refuses outright (bad channel id, second hello) is an error.
	pub async fn hello(
		&mut self,
		channel: &str,
		channel_id: &str,
		topics: &[&str],
	) -> Result<Vec<TopicReply>, ClientError> {
		self.send(&ClientMessage::Hello {
			channel: channel.to_string(),
			channel_id: channel_id.to_string(),
			topics: topics.iter().map(|t| t.to_string()).collect(),
		})
		.await?;

		// a trailing ping marks the end of the hello replies, even with no topics
		self.send(&ClientMessage::Ping { timestamp: None }).await?;

		let mut replies = Vec::with_capacity(topics.len());
		loop {
			match self.await_reply(|m| reply_to(m, "hello") || matches!(m, HubMessage::Pong { .. })).await? {
				HubMessage::Pong { .. } => break,
				HubMessage::Ack { topic, status, .. } => replies.push(TopicReply::Acked { topic, status }),
				HubMessage::Error {
					topic: Some(topic),
					code,
					detail,
					..
				} => replies.push(TopicReply::Rejected { topic, code, detail }),
				HubMessage::Error {
					topic: None, code, detail, ..
				} => {
					self.discard_until_pong().await?;
					return Err(ClientError::Rejected { code, detail });
				}
				other => return Err(ClientError::Protocol(format!("unexpected reply to hello: {other:?}"))),
			}
		}

		Ok(replies)
	}

	pub async fn subscribe(&mut self, topic: &str) -> Result<AckStatus, ClientError> {
		self.send(&ClientMessage::Subscribe {
			topic: topic.to_string(),
			channel_id: None,
		})
		.await?;
		self.await_ack("subscribe").await
	}

	/// Subscribe naming the channel explicitly; it must match the session's channel.
	pub async fn subscribe_for(&mut self, channel_id: &str, topic: &str) -> Result<AckStatus, ClientError> {
		self.send(&ClientMessage::Subscribe {
			topic: topic.to_string(),
			channel_id: Some(channel_id.to_string()),
		})
		.await?;
		self.await_ack("subscribe").await
	}

	pub async fn unsubscribe(&mut self, topic: &str) -> Result<AckStatus, ClientError> {
		self.send(&ClientMessage::Unsubscribe {
			topic: topic.to_string(),
			channel_id: None,
		})
		.await?;
		self.await_ack("unsubscribe").await
	}

	/// Ping and return the echoed timestamp.
	pub async fn ping(&mut self, timestamp: Option<i64>) -> Result<i64, ClientError> {
		self.send(&ClientMessage::Ping { timestamp }).await?;
		match self.await_reply(|m| matches!(m, HubMessage::Pong { .. })).await? {
			HubMessage::Pong { timestamp } => Ok(timestamp),
			other => Err(ClientError::Protocol(format!("expected pong, got {other:?}"))),
		}
	}

	/// Run an operational command. A result with `ok == false` is still returned.
	pub async fn control(
		&mut self,
		command: ControlCommand,
		channel_id: Option<&str>,
	) -> Result<ControlResult, ClientError> {
		self.send(&ClientMessage::Control {
			command,
			channel_id: channel_id.map(str::to_string),
		})
		.await?;
		match self.await_reply(|m| matches!(m, HubMessage::ControlResult(_))).await? {
			HubMessage::ControlResult(r) => Ok(*r),
			other => Err(ClientError::Protocol(format!("expected control_result, got {other:?}"))),
		}
	}

	/// Next message from the hub, or `None` once the hub closed the connection.
	pub async fn next_message(&mut self) -> Result<Option<HubMessage>, ClientError> {
		if let Some(msg) = self.pending.pop_front() {
			return Ok(Some(msg));
		}
		self.read_message().await
	}

	/// Like [`Self::next_message`] but gives up after `timeout`.
	pub async fn next_message_timeout(&mut self, timeout: Duration) -> Result<Option<HubMessage>, ClientError> {
		if let Some(msg) = self.pending.pop_front() {
			return Ok(Some(msg));
		}
		tokio::time::timeout(timeout, self.read_message())
			.await
			.map_err(|_| ClientError::Timeout("next message"))?
	}

	/// [`Self::next_message`] for consumers that mostly listen.
	///
	/// Pings the hub every `ping_interval` so the session keeps being reported as alive.
	/// Pongs never reach the caller.
	pub async fn next_message_keepalive(&mut self) -> Result<Option<HubMessage>, ClientError> {
		let every = self.cfg.ping_interval.max(Duration::from_millis(10));
		loop {
			if self.last_ping.elapsed() >= every {
				self.send(&ClientMessage::Ping { timestamp: None }).await?;
			}
			let wait = every.saturating_sub(self.last_ping.elapsed());
			match self.next_message_timeout(wait).await {
				Ok(Some(HubMessage::Pong { .. })) | Err(ClientError::Timeout(_)) => continue,
				other => return other,
			}
		}
	}

	pub async fn close(mut self) {
		let _ = self.wr.shutdown().await;
	}

	async fn await_ack(&mut self, cmd: &'static str) -> Result<AckStatus, ClientError> {
		match self.await_reply(|m| reply_to(m, cmd)).await? {
			HubMessage::Ack { status, .. } => Ok(status),
			HubMessage::Error { code, detail, .. } => Err(ClientError::Rejected { code, detail }),
			other => Err(ClientError::Protocol(format!("unexpected reply to {cmd}: {other:?}"))),
		}
	}

	/// Read until `want` matches, parking anything else. Connection-level errors end the wait.
	async fn await_reply(&mut self, want: impl Fn(&HubMessage) -> bool) -> Result<HubMessage, ClientError> {
		let deadline = Instant::now() + self.cfg.request_timeout;

		loop {
			let msg = tokio::time::timeout_at(deadline, self.read_message())
				.await
				.map_err(|_| ClientError::Timeout("hub reply"))??;
			let Some(msg) = msg else {
				return Err(ClientError::Protocol("connection closed by hub".to_string()));
			};

			if want(&msg) {
				return Ok(msg);
			}
			if let HubMessage::Error {
				cmd, code, detail, ..
			} = &msg
				&& is_connection_error(cmd)
			{
				return Err(ClientError::Rejected {
					code: *code,
					detail: detail.clone(),
				});
			}
			self.pending.push_back(msg);
		}
	}

	async fn discard_until_pong(&mut self) -> Result<(), ClientError> {
		self.await_reply(|m| matches!(m, HubMessage::Pong { .. })).await.map(|_| ())
	}

	async fn read_message(&mut self) -> Result<Option<HubMessage>, ClientError> {
		loop {
			if let Some(msg) = try_decode_line_from_buffer::<HubMessage>(&mut self.buf, self.cfg.max_frame_bytes)? {
				return Ok(Some(msg));
			}

			let n = self
				.rd
				.read_buf(&mut self.buf)
				.await
				.map_err(|e| ClientError::Io(e.to_string()))?;
			if n == 0 {
				return Ok(None);
			}
		}
	}
}

fn reply_to(msg: &HubMessage, cmd: &str) -> bool {
	match msg {
		HubMessage::Ack { cmd: c, .. } | HubMessage::Error { cmd: c, .. } => c == cmd,
		_ => false,
	}
}

/// Errors the hub sends about the connection rather than a specific request.
fn is_connection_error(cmd: &str) -> bool {
	matches!(cmd, "unknown" | "frame" | "connect")
}
