#![forbid(unsafe_code)]

mod common;

use std::sync::Arc;

use common::{FailingStore, active_keys, eventually, key, test_config};
use evhub_client::{HubClient, TopicReply};
use evhub_protocol::ErrorCode;
use evhub_provider::fake::FakeProvider;
use evhub_server::Hub;

#[tokio::test]
async fn store_outage_fails_requests_but_not_sessions() {
	common::init_test_logging();
	let dir = tempfile::tempdir().expect("tempdir");
	let fake = FakeProvider::new();
	let failing = FailingStore::new();
	let hub = Hub::start(
		test_config(dir.path()),
		failing.clone(),
		Arc::new(fake.clone()),
		Arc::new(fake.clone()),
	)
	.await
	.expect("start hub");
	let store = &hub.store();

	let mut healthy = HubClient::connect(hub.endpoint()).await.expect("connect");
	healthy.hello("acme", "100", &["stream.online"]).await.expect("hello");
	let k = &key("100", "stream.online");
	eventually("active subscription", || async move { active_keys(store).await.contains(k) }).await;

	failing.set_broken(true);

	let mut late = HubClient::connect(hub.endpoint()).await.expect("connect");
	let replies = late.hello("acme", "200", &["stream.online"]).await.expect("hello");
	assert!(
		matches!(&replies[..], [TopicReply::Rejected { code: ErrorCode::Internal, .. }]),
		"{replies:?}"
	);

	let err = healthy.unsubscribe("stream.online").await.unwrap_err();
	assert_eq!(err.code(), Some(ErrorCode::Internal));

	let pass = hub.resync().await.expect("pass");
	let skipped = pass.skipped.expect("pass should be skipped");
	assert!(skipped.starts_with("store failure"), "{skipped}");

	// both connections stay usable through the outage
	assert_eq!(healthy.ping(Some(7)).await.expect("ping"), 7);
	assert_eq!(late.ping(Some(8)).await.expect("ping"), 8);

	failing.set_broken(false);
	late.subscribe("stream.online").await.expect("subscribe after recovery");
	let pass = hub.resync().await.expect("pass");
	assert!(pass.skipped.is_none(), "{pass:?}");
	let k2 = &key("200", "stream.online");
	eventually("recovered subscription", || async move { active_keys(store).await.contains(k2) }).await;
	assert!(active_keys(store).await.contains(k), "failed unsubscribe left the entry in place");

	hub.shutdown().await.expect("shutdown");
}
