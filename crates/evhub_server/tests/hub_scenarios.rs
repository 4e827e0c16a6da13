#![forbid(unsafe_code)]

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{TestHub, active_keys, ch, desired_keys, enabled_keys, eventually, key, start_hub, test_config};
use evhub_domain::ConnectionState;
use evhub_protocol::ControlCommand;
use evhub_provider::fake::{FakeFailure, FakeProvider};

#[tokio::test]
async fn hello_acks_and_subscription_becomes_active() {
	let t = TestHub::start().await;
	let store = &t.store();

	let mut consumer = t.client().await;
	let replies = consumer
		.hello("acme", "100", &["stream.online"])
		.await
		.expect("hello");
	assert_eq!(replies.len(), 1);
	assert_eq!(replies[0].topic(), "stream.online");
	assert!(replies[0].is_ok());

	let want = &key("100", "stream.online");
	eventually("active subscription", || async move { active_keys(store).await.contains(want) }).await;
	assert_eq!(t.fake.create_calls(), 1);
	assert_eq!(t.fake.remote_keys(), vec![want.clone()]);

	t.shutdown().await;
}

#[tokio::test]
async fn desired_entry_lives_until_last_consumer_leaves() {
	let t = TestHub::start().await;
	let store = &t.store();
	let k = &key("200", "stream.offline");

	let first = t.consumer("200", &["stream.offline"]).await;
	let mut second = t.consumer("200", &["stream.offline"]).await;
	eventually("active subscription", || async move { active_keys(store).await.contains(k) }).await;

	first.close().await;
	let hub = &t.hub;
	eventually("first session torn down", || async move {
		hub.status().await.expect("status").sessions.len() == 1
	})
	.await;
	assert!(desired_keys(store).await.contains(k));
	assert!(active_keys(store).await.contains(k));

	// the surviving consumer still works
	assert_eq!(second.ping(Some(7)).await.expect("ping"), 7);

	second.close().await;
	eventually("desired entry released", || async move { !desired_keys(store).await.contains(k) }).await;
	eventually("upstream subscription deleted", || async move { active_keys(store).await.is_empty() }).await;
	assert_eq!(t.fake.delete_calls(), 1);
	assert!(t.fake.remote_keys().is_empty());

	t.shutdown().await;
}

#[tokio::test]
async fn rejected_channel_is_flagged_and_never_retried() {
	let fake = FakeProvider::new();
	fake.fail_creates_for(&ch("bad-auth"), FakeFailure::Reject { status: 401 });
	let t = TestHub::start_with(fake, |_| {}).await;
	let store = &t.store();

	let _consumer = t.consumer("bad-auth", &["stream.online"]).await;
	eventually("needs_attention flag", || async move {
		store
			.list_desired()
			.await
			.expect("list_desired")
			.iter()
			.any(|d| d.needs_attention.is_some())
	})
	.await;
	assert_eq!(t.fake.create_calls_for(&ch("bad-auth")), 1);

	for _ in 0..5 {
		let pass = t.hub.resync().await.expect("pass");
		assert!(pass.skipped.is_none(), "{pass:?}");
		assert_eq!(pass.created, 0);
		assert_eq!(pass.skipped_attention, 1);
	}
	assert_eq!(t.fake.create_calls_for(&ch("bad-auth")), 1);
	assert!(active_keys(store).await.is_empty());

	let status = t.hub.status().await.expect("status");
	let row = status
		.channels
		.iter()
		.find(|c| c.channel_id == "bad-auth")
		.expect("channel row");
	assert!(row.needs_attention.as_deref().is_some_and(|r| r.contains("401")), "{row:?}");

	t.shutdown().await;
}

#[tokio::test]
async fn silent_keepalive_reconnects_once_without_recreating() {
	let fake = FakeProvider::with_options(Duration::from_millis(100), true);
	let t = TestHub::start_with(fake, |_| {}).await;
	let store = &t.store();
	let k = &key("300", "stream.online");

	let _consumer = t.consumer("300", &["stream.online"]).await;
	eventually("active subscription", || async move { active_keys(store).await.contains(k) }).await;
	assert_eq!(t.fake.create_calls(), 1);

	let before = t.hub.state().snapshot();
	assert_eq!(before.connection, ConnectionState::Up);

	let seen = Arc::new(Mutex::new(Vec::new()));
	let mut rx = t.hub.state().subscribe();
	let recorder = {
		let seen = seen.clone();
		tokio::spawn(async move {
			while rx.changed().await.is_ok() {
				let conn = rx.borrow_and_update().connection;
				seen.lock().expect("lock").push(conn);
			}
		})
	};

	assert!(t.fake.silence_keepalives());
	let hub = &t.hub;
	let target = before.reconnect_count + 1;
	eventually("reconnect", || async move {
		let s = hub.state().snapshot();
		s.reconnect_count == target && s.connection == ConnectionState::Up
	})
	.await;

	let pass = t.hub.resync().await.expect("pass");
	assert_eq!(pass.created, 0);
	assert_eq!(t.fake.create_calls(), 1, "reconnect must not recreate subscriptions");
	assert_eq!(t.hub.state().snapshot().reconnect_count, target);
	assert_eq!(t.fake.connect_calls(), 2);

	recorder.abort();
	let seen = seen.lock().expect("lock").clone();
	let down = seen
		.iter()
		.position(|c| !c.is_connected())
		.expect("connection went down");
	assert!(seen[down..].contains(&ConnectionState::Up), "{seen:?}");

	t.shutdown().await;
}

#[tokio::test]
async fn failing_channel_does_not_block_others() {
	let fake = FakeProvider::new();
	fake.fail_creates_for(&ch("A"), FakeFailure::Unavailable);
	let t = TestHub::start_with(fake, |_| {}).await;
	let store = &t.store();

	let _a = t.consumer("A", &["stream.online", "stream.offline"]).await;
	let _b = t.consumer("B", &["stream.online"]).await;

	for _ in 0..3 {
		let pass = t.hub.resync().await.expect("pass");
		assert!(pass.skipped.is_none(), "{pass:?}");
	}

	let active = active_keys(store).await;
	assert_eq!(active, vec![key("B", "stream.online")]);

	let status = t.hub.status().await.expect("status");
	let a = status.channels.iter().find(|c| c.channel_id == "A").expect("row A");
	assert!(a.backoff_level >= 1, "{a:?}");
	assert!(a.backing_off_until.is_some());
	assert!(a.needs_attention.is_none(), "transient failures are not flagged");
	let b = status.channels.iter().find(|c| c.channel_id == "B").expect("row B");
	assert_eq!(b.backoff_level, 0);
	assert_eq!(b.active, 1);

	// while backing off the channel gets no create calls at all
	let calls = t.fake.create_calls_for(&ch("A"));
	let pass = t.hub.resync().await.expect("pass");
	assert!(pass.skipped_backoff > 0);
	assert_eq!(t.fake.create_calls_for(&ch("A")), calls);

	t.shutdown().await;
}

#[tokio::test]
async fn subscribe_churn_never_touches_the_connection() {
	let t = TestHub::start().await;
	let mut consumer = t.consumer("400", &[]).await;
	assert_eq!(t.fake.connect_calls(), 1);

	for _ in 0..5 {
		consumer.subscribe("stream.online").await.expect("subscribe");
		consumer.unsubscribe("stream.online").await.expect("unsubscribe");
	}
	t.hub.resync().await.expect("pass");

	assert_eq!(t.fake.connect_calls(), 1);
	assert_eq!(t.hub.state().snapshot().reconnect_count, 0);
	assert!(active_keys(&t.store()).await.is_empty());

	t.shutdown().await;
}

#[tokio::test]
async fn state_survives_restart_and_is_revalidated() {
	common::init_test_logging();
	let dir = tempfile::tempdir().expect("tempdir");
	let db = dir.path().join("hub.db");
	let fake = FakeProvider::new();

	let mut cfg = test_config(dir.path());
	cfg.persistence.database_url = format!("sqlite://{}", db.display());

	{
		let hub = start_hub(&fake, cfg.clone()).await;
		let store = &hub.store();
		let k = &key("500", "stream.online");

		let mut consumer = evhub_client::HubClient::connect(hub.endpoint()).await.expect("connect");
		consumer
			.hello("acme", "500", &["stream.online"])
			.await
			.expect("hello");
		eventually("active subscription", || async move { active_keys(store).await.contains(k) }).await;

		assert!(fake.emit_event(&ch("500"), &k.topic, "ev-1", serde_json::json!({"live": true})));
		let msg = consumer
			.next_message_timeout(Duration::from_secs(5))
			.await
			.expect("event")
			.expect("open");
		assert!(matches!(msg, evhub_protocol::HubMessage::Event { .. }), "{msg:?}");

		hub.shutdown().await.expect("shutdown");
		// hub shutdown does not count as the consumer leaving
		assert_eq!(consumer.next_message().await.expect("eof"), None);
	}

	let hub = start_hub(&fake, cfg).await;
	assert_eq!(hub.state().snapshot().total_events_routed, 1);

	let store = &hub.store();
	assert_eq!(desired_keys(store).await, vec![key("500", "stream.online")]);

	let pass = hub.resync().await.expect("pass");
	assert!(pass.skipped.is_none(), "{pass:?}");
	assert_eq!(fake.create_calls(), 1, "revalidated from the provider listing");
	assert_eq!(enabled_keys(store).await, vec![key("500", "stream.online")]);
	assert_eq!(active_keys(store).await, vec![key("500", "stream.online")]);

	hub.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn stale_rows_are_replaced_when_provider_cannot_list() {
	common::init_test_logging();
	let dir = tempfile::tempdir().expect("tempdir");
	let fake = FakeProvider::new();
	fake.set_list_supported(false);

	let mut cfg = test_config(dir.path());
	cfg.persistence.database_url = format!("sqlite://{}", dir.path().join("hub.db").display());

	{
		let hub = start_hub(&fake, cfg.clone()).await;
		let store = &hub.store();
		let k = &key("600", "stream.online");
		let mut consumer = evhub_client::HubClient::connect(hub.endpoint()).await.expect("connect");
		consumer.hello("acme", "600", &["stream.online"]).await.expect("hello");
		eventually("active subscription", || async move { active_keys(store).await.contains(k) }).await;
		hub.shutdown().await.expect("shutdown");
	}

	// expired upstream while the hub was down
	fake.expire_all();

	let hub = start_hub(&fake, cfg).await;
	let store = &hub.store();
	let k = &key("600", "stream.online");
	let f = &fake;
	// the persisted row already carries the key, so wait on the replacement itself
	eventually("recreated subscription", || async move {
		f.create_calls() == 2 && enabled_keys(store).await.contains(k)
	})
	.await;
	assert_eq!(fake.create_calls(), 2);
	assert_eq!(active_keys(store).await, vec![k.clone()]);
	assert_eq!(fake.delete_calls(), 1, "stale id deleted; not found counts as done");
	assert_eq!(fake.remote_keys(), vec![k.clone()]);

	hub.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn unpreserved_session_reset_recreates_subscriptions() {
	let fake = FakeProvider::with_options(Duration::from_secs(10), false);
	let t = TestHub::start_with(fake, |_| {}).await;
	let store = &t.store();
	let k = &key("700", "stream.online");

	let _consumer = t.consumer("700", &["stream.online"]).await;
	eventually("active subscription", || async move { active_keys(store).await.contains(k) }).await;
	let first_id = &store.list_active().await.expect("active")[0].provider_subscription_id.clone();

	assert!(t.fake.drop_connection());
	let fake = &t.fake;
	eventually("recreated after reset", || async move { fake.create_calls() == 2 }).await;
	eventually("active again", || async move {
		store
			.list_active()
			.await
			.expect("active")
			.iter()
			.any(|a| a.key() == *k && &a.provider_subscription_id != first_id)
	})
	.await;

	t.shutdown().await;
}

#[tokio::test]
async fn auth_revocation_flags_until_cleared() {
	let t = TestHub::start().await;
	let store = &t.store();
	let k = &key("800", "stream.online");

	let mut consumer = t.consumer("800", &["stream.online"]).await;
	eventually("active subscription", || async move { active_keys(store).await.contains(k) }).await;
	let id = store.list_active().await.expect("active")[0].provider_subscription_id.clone();

	assert!(t.fake.revoke(&id, "authorization_revoked"));
	eventually("flagged after revocation", || async move {
		store
			.list_desired()
			.await
			.expect("desired")
			.iter()
			.any(|d| d.needs_attention.is_some())
	})
	.await;
	let pass = t.hub.resync().await.expect("pass");
	assert_eq!(pass.created, 0);
	assert!(active_keys(store).await.is_empty());
	assert_eq!(t.fake.create_calls(), 1);

	let cleared = consumer
		.control(ControlCommand::ClearAttention, Some("800"))
		.await
		.expect("control");
	assert!(cleared.ok, "{cleared:?}");
	eventually("recreated after clear", || async move { active_keys(store).await.contains(k) }).await;
	assert_eq!(t.fake.create_calls(), 2);

	let audit = store.recent_audit(50).await.expect("audit");
	assert!(audit.iter().any(|a| a.event_type == "subscription_revoked"));
	assert!(audit.iter().any(|a| a.event_type == "subscription_create"));

	t.shutdown().await;
}

#[tokio::test]
async fn operator_restart_reconnects_without_recreating() {
	let t = TestHub::start().await;
	let store = &t.store();
	let k = &key("900", "stream.online");

	let mut consumer = t.consumer("900", &["stream.online"]).await;
	eventually("active subscription", || async move { active_keys(store).await.contains(k) }).await;

	let result = consumer.control(ControlCommand::Restart, None).await.expect("control");
	assert!(result.ok, "{result:?}");

	let hub = &t.hub;
	eventually("reconnected", || async move {
		let s = hub.state().snapshot();
		s.reconnect_count == 1 && s.connection == ConnectionState::Up
	})
	.await;
	t.hub.resync().await.expect("pass");
	assert_eq!(t.fake.create_calls(), 1);
	assert_eq!(t.fake.connect_calls(), 2);

	t.shutdown().await;
}
