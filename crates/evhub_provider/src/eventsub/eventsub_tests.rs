#![forbid(unsafe_code)]

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::Message;

use super::*;

fn welcome(id: &str, keepalive: u64) -> String {
	serde_json::json!({
		"metadata": {"message_id": format!("w-{id}"), "message_type": "session_welcome", "message_timestamp": "t"},
		"payload": {"session": {"id": id, "status": "connected", "connected_at": "t", "keepalive_timeout_seconds": keepalive, "reconnect_url": null}}
	})
	.to_string()
}

fn keepalive() -> String {
	serde_json::json!({
		"metadata": {"message_id": "k", "message_type": "session_keepalive", "message_timestamp": "t"},
		"payload": {}
	})
	.to_string()
}

fn notification(event_id: &str, channel: &str) -> String {
	serde_json::json!({
		"metadata": {"message_id": event_id, "message_type": "notification", "message_timestamp": "t"},
		"payload": {
			"subscription": {"id": "sub-1", "status": "enabled", "type": "stream.online", "version": "1", "condition": {"broadcaster_user_id": channel}, "created_at": "t"},
			"event": {"broadcaster_user_id": channel}
		}
	})
	.to_string()
}

fn reconnect(url: &str) -> String {
	serde_json::json!({
		"metadata": {"message_id": "r", "message_type": "session_reconnect", "message_timestamp": "t"},
		"payload": {"session": {"id": "sess-a", "status": "reconnecting", "connected_at": "t", "keepalive_timeout_seconds": null, "reconnect_url": url}}
	})
	.to_string()
}

/// Serve one websocket connection that sends `frames` and then waits for the peer to close.
async fn serve_once(frames: Vec<String>) -> String {
	let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
	let addr = listener.local_addr().expect("addr");

	tokio::spawn(async move {
		let (stream, _) = listener.accept().await.expect("accept");
		let mut ws = tokio_tungstenite::accept_async(stream).await.expect("ws handshake");
		for f in frames {
			ws.send(Message::Text(f.into())).await.expect("send");
		}
		while let Some(Ok(_)) = ws.next().await {}
	});

	format!("ws://{addr}/ws")
}

fn test_config(ws_url: String) -> EventSubConfig {
	let mut cfg = EventSubConfig::new("client", SecretString::new("token"));
	cfg.ws_url = ws_url;
	cfg.api_base_url = "http://127.0.0.1:9".to_string();
	cfg.welcome_timeout = Duration::from_secs(5);
	cfg
}

#[tokio::test]
async fn connect_reads_welcome_and_yields_events() {
	let url = serve_once(vec![welcome("sess-a", 7), keepalive(), notification("evt-1", "100")]).await;
	let (transport, _api) = build(test_config(url)).expect("build");

	let mut session = tokio::time::timeout(Duration::from_secs(5), transport.connect())
		.await
		.expect("connect timed out")
		.expect("connect");

	assert_eq!(session.session_id(), "sess-a");
	assert_eq!(session.keepalive_interval(), Duration::from_secs(7));
	assert!(!session.subscriptions_preserved());
	assert_eq!(transport.session_id.read().as_deref(), Some("sess-a"));

	let first = session.next_message().await.expect("read").expect("some");
	assert_eq!(first, InboundMessage::Keepalive);

	match session.next_message().await.expect("read").expect("some") {
		InboundMessage::Event(ev) => {
			assert_eq!(ev.channel_id.as_str(), "100");
			assert_eq!(ev.event_id, "evt-1");
		}
		other => panic!("unexpected message: {other:?}"),
	}

	session.close().await;
	assert!(transport.session_id.read().is_none());
}

#[tokio::test]
async fn session_reconnect_migrates_to_new_socket() {
	let second = serve_once(vec![welcome("sess-b", 10), notification("evt-2", "200")]).await;
	let first = serve_once(vec![welcome("sess-a", 10), reconnect(&second)]).await;

	let (transport, _api) = build(test_config(first)).expect("build");
	let mut session = transport.connect().await.expect("connect");
	assert_eq!(session.session_id(), "sess-a");

	// migration surfaces as activity
	let msg = tokio::time::timeout(Duration::from_secs(5), session.next_message())
		.await
		.expect("migration timed out")
		.expect("read")
		.expect("some");
	assert_eq!(msg, InboundMessage::Keepalive);
	assert_eq!(session.session_id(), "sess-b");
	assert_eq!(transport.session_id.read().as_deref(), Some("sess-b"));

	match session.next_message().await.expect("read").expect("some") {
		InboundMessage::Event(ev) => assert_eq!(ev.event_id, "evt-2"),
		other => panic!("unexpected message: {other:?}"),
	}
}

#[tokio::test]
async fn connect_fails_when_socket_closes_before_welcome() {
	let url = serve_once(vec![keepalive()]).await;
	let mut cfg = test_config(url);
	cfg.welcome_timeout = Duration::from_millis(500);
	let (transport, _api) = build(cfg).expect("build");

	let err = match transport.connect().await {
		Ok(_) => panic!("connect should fail"),
		Err(e) => e,
	};
	assert!(matches!(err, ProviderError::TransportUnavailable(_)));
}

#[test]
fn build_requires_credentials() {
	let cfg = EventSubConfig::new("", SecretString::new(""));
	assert!(build(cfg).is_err());
}
