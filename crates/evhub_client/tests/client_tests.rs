#![forbid(unsafe_code)]

use std::sync::OnceLock;
use std::time::Duration;

use bytes::BytesMut;
use evhub_client::{ClientError, HubClient, TopicReply};
use evhub_domain::{ChannelId, Topic};
use evhub_protocol::{
	AckStatus, ClientMessage, ControlCommand, ControlResult, DEFAULT_MAX_FRAME_SIZE, ErrorCode, HubMessage, encode_line,
	try_decode_line_from_buffer,
};
use evhub_util::endpoint::IpcEndpoint;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

static LOG_INIT: OnceLock<()> = OnceLock::new();

fn init_test_logging() {
	LOG_INIT.get_or_init(|| {
		if std::env::var_os("EVHUB_TEST_LOG").is_none() {
			return;
		}

		let _ = tracing_subscriber::fmt()
			.with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "debug".to_string()))
			.with_target(false)
			.try_init();
	});
}

/// Hub side of one scripted connection.
struct ScriptedHub {
	stream: UnixStream,
	buf: BytesMut,
}

impl ScriptedHub {
	async fn recv(&mut self) -> ClientMessage {
		loop {
			if let Some(msg) =
				try_decode_line_from_buffer::<ClientMessage>(&mut self.buf, DEFAULT_MAX_FRAME_SIZE).expect("decode")
			{
				return msg;
			}
			let n = self.stream.read_buf(&mut self.buf).await.expect("read");
			assert!(n > 0, "client closed early");
		}
	}

	async fn send(&mut self, msg: HubMessage) {
		let line = encode_line(&msg, DEFAULT_MAX_FRAME_SIZE).expect("encode");
		self.stream.write_all(&line).await.expect("write");
	}
}

async fn listen() -> (tempfile::TempDir, IpcEndpoint, UnixListener) {
	init_test_logging();
	let dir = tempfile::tempdir().expect("tempdir");
	let path = dir.path().join("hub.sock");
	let listener = UnixListener::bind(&path).expect("bind");
	(dir, IpcEndpoint::Unix(path), listener)
}

async fn accept(listener: &UnixListener) -> ScriptedHub {
	let (stream, _) = listener.accept().await.expect("accept");
	ScriptedHub {
		stream,
		buf: BytesMut::new(),
	}
}

#[tokio::test]
async fn hello_collects_per_topic_replies_and_keeps_events() {
	let (_dir, endpoint, listener) = listen().await;

	let hub = tokio::spawn(async move {
		let mut hub = accept(&listener).await;
		let ClientMessage::Hello { channel_id, topics, .. } = hub.recv().await else {
			panic!("expected hello");
		};
		assert_eq!(topics, vec!["stream.online", "bogus"]);
		assert!(matches!(hub.recv().await, ClientMessage::Ping { timestamp: None }));

		hub.send(HubMessage::ack("hello", &channel_id, "stream.online", AckStatus::Ok))
			.await;
		// an event racing the hello replies
		hub.send(HubMessage::Event {
			channel_id: ChannelId::new(channel_id.as_str()).expect("channel id"),
			topic: Topic::new("stream.online").expect("topic"),
			event_id: "e1".to_string(),
			payload: serde_json::json!({"n": 1}),
		})
		.await;
		hub.send(HubMessage::error("hello", Some("bogus"), ErrorCode::UnknownTopic, "not served"))
			.await;
		hub.send(HubMessage::Pong { timestamp: 1 }).await;
		hub
	});

	let mut client = HubClient::connect(&endpoint).await.expect("connect");
	let replies = client
		.hello("alice", "123", &["stream.online", "bogus"])
		.await
		.expect("hello");

	assert_eq!(replies.len(), 2);
	assert_eq!(
		replies[0],
		TopicReply::Acked {
			topic: "stream.online".to_string(),
			status: AckStatus::Ok
		}
	);
	assert!(matches!(&replies[1], TopicReply::Rejected { code: ErrorCode::UnknownTopic, .. }));

	let ev = client
		.next_message_timeout(Duration::from_secs(5))
		.await
		.expect("next")
		.expect("event");
	assert!(matches!(ev, HubMessage::Event { ref event_id, .. } if event_id == "e1"));

	let _hub = hub.await.expect("hub task");
}

#[tokio::test]
async fn refused_hello_is_an_error() {
	let (_dir, endpoint, listener) = listen().await;

	let hub = tokio::spawn(async move {
		let mut hub = accept(&listener).await;
		let _ = hub.recv().await;
		let _ = hub.recv().await;
		hub.send(HubMessage::error("hello", None, ErrorCode::DuplicateHello, "hello already received"))
			.await;
		hub.send(HubMessage::Pong { timestamp: 1 }).await;
		hub
	});

	let mut client = HubClient::connect(&endpoint).await.expect("connect");
	let err = client.hello("alice", "123", &["stream.online"]).await.unwrap_err();
	assert_eq!(err.code(), Some(ErrorCode::DuplicateHello));

	let _hub = hub.await.expect("hub task");
}

#[tokio::test]
async fn subscribe_rejection_and_control_roundtrip() {
	let (_dir, endpoint, listener) = listen().await;

	let hub = tokio::spawn(async move {
		let mut hub = accept(&listener).await;

		let ClientMessage::Subscribe { topic, channel_id } = hub.recv().await else {
			panic!("expected subscribe");
		};
		assert_eq!(channel_id.as_deref(), Some("999"));
		hub.send(HubMessage::error("subscribe", Some(&topic), ErrorCode::ChannelMismatch, "bound to 123"))
			.await;

		let ClientMessage::Control { command, .. } = hub.recv().await else {
			panic!("expected control");
		};
		assert_eq!(command, ControlCommand::Drain);
		hub.send(HubMessage::Lagged { dropped: 3 }).await;
		hub.send(HubMessage::ControlResult(Box::new(ControlResult::ok(command, "draining"))))
			.await;
		hub
	});

	let mut client = HubClient::connect(&endpoint).await.expect("connect");
	let err = client.subscribe_for("999", "stream.online").await.unwrap_err();
	assert!(
		matches!(err, ClientError::Rejected { code: ErrorCode::ChannelMismatch, .. }),
		"{err:?}"
	);

	let result = client.control(ControlCommand::Drain, None).await.expect("control");
	assert!(result.ok);
	assert_eq!(result.detail, "draining");

	// the lag notice that arrived first is still delivered
	let msg = client.next_message().await.expect("next").expect("lagged");
	assert_eq!(msg, HubMessage::Lagged { dropped: 3 });

	let _hub = hub.await.expect("hub task");
}

#[tokio::test]
async fn closed_connection_surfaces_as_protocol_error() {
	let (_dir, endpoint, listener) = listen().await;

	let hub = tokio::spawn(async move {
		let mut hub = accept(&listener).await;
		let _ = hub.recv().await;
		drop(hub);
	});

	let mut client = HubClient::connect(&endpoint).await.expect("connect");
	let err = client.ping(Some(42)).await.unwrap_err();
	assert!(matches!(err, ClientError::Protocol(_)), "{err:?}");
	hub.await.expect("hub task");
}
