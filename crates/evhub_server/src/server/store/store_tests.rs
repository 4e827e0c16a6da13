#![forbid(unsafe_code)]

use std::sync::Arc;

use evhub_domain::{ChannelId, SubscriptionKey, SubscriptionStatus};
use proptest::prelude::*;

use super::memory::MemoryStore;
use super::sqlite::SqliteStore;
use super::*;

fn key(ch: &str, topic: &str) -> SubscriptionKey {
	SubscriptionKey::parse(&format!("{ch}/{topic}")).expect("valid key")
}

async fn backends() -> Vec<(&'static str, Arc<dyn SubscriptionStore>)> {
	let sqlite = SqliteStore::connect("sqlite::memory:").await.expect("sqlite memory store");
	vec![("memory", Arc::new(MemoryStore::new())), ("sqlite", Arc::new(sqlite))]
}

#[tokio::test]
async fn desired_mutations_are_idempotent() {
	for (name, store) in backends().await {
		let k = key("100", "stream.online");

		assert!(store.add_desired(&k).await.expect("add"), "{name}");
		assert!(!store.add_desired(&k).await.expect("add again"), "{name}");
		assert_eq!(store.list_desired().await.expect("list").len(), 1, "{name}");

		assert!(store.remove_desired(&k).await.expect("remove"), "{name}");
		assert!(!store.remove_desired(&k).await.expect("remove missing"), "{name}");
		assert!(store.list_desired().await.expect("list").is_empty(), "{name}");
	}
}

#[tokio::test]
async fn record_active_keeps_key_and_id_unique() {
	for (name, store) in backends().await {
		let k = key("100", "stream.online");

		store
			.record_active("sub-1", &k, SubscriptionStatus::Pending, 1)
			.await
			.expect("record");
		// same key under a new provider id replaces the old row
		store
			.record_active("sub-2", &k, SubscriptionStatus::Enabled, 1)
			.await
			.expect("record");

		let active = store.list_active().await.expect("list");
		assert_eq!(active.len(), 1, "{name}");
		assert_eq!(active[0].provider_subscription_id, "sub-2", "{name}");
		assert_eq!(active[0].status, SubscriptionStatus::Enabled, "{name}");

		// same id under a new key moves the row
		let k2 = key("100", "stream.offline");
		store
			.record_active("sub-2", &k2, SubscriptionStatus::Enabled, 0)
			.await
			.expect("record");
		let active = store.list_active().await.expect("list");
		assert_eq!(active.len(), 1, "{name}");
		assert_eq!(active[0].key(), k2, "{name}");

		assert_eq!(store.remove_active("sub-2").await.expect("remove"), Some(k2), "{name}");
		assert_eq!(store.remove_active("sub-2").await.expect("remove missing"), None, "{name}");
	}
}

#[tokio::test]
async fn diff_joins_on_channel_and_topic() {
	for (name, store) in backends().await {
		let wanted = key("100", "stream.online");
		let both = key("200", "stream.offline");
		let orphan = key("300", "stream.online");

		store.add_desired(&wanted).await.expect("add");
		store.add_desired(&both).await.expect("add");
		store
			.record_active("a", &both, SubscriptionStatus::Enabled, 1)
			.await
			.expect("record");
		store
			.record_active("b", &orphan, SubscriptionStatus::Enabled, 1)
			.await
			.expect("record");

		let diff = store.diff().await.expect("diff");
		assert_eq!(diff.to_create.into_iter().collect::<Vec<_>>(), vec![wanted], "{name}");
		assert_eq!(diff.to_delete.into_iter().collect::<Vec<_>>(), vec![orphan], "{name}");
	}
}

#[tokio::test]
async fn stale_marking_promotion_and_clear() {
	for (name, store) in backends().await {
		let a = key("100", "stream.online");
		let b = key("100", "stream.offline");
		store.record_active("a", &a, SubscriptionStatus::Pending, 1).await.expect("record");
		store.record_active("b", &b, SubscriptionStatus::Enabled, 1).await.expect("record");

		assert!(store.promote_pending(&a).await.expect("promote"), "{name}");
		assert!(!store.promote_pending(&a).await.expect("promote again"), "{name}");

		assert_eq!(store.mark_all_active_stale().await.expect("stale"), 2, "{name}");
		assert!(
			store
				.list_active()
				.await
				.expect("list")
				.iter()
				.all(|r| r.status == SubscriptionStatus::Stale),
			"{name}"
		);

		assert!(store.set_active_status("b", SubscriptionStatus::Error).await.expect("set"), "{name}");
		assert!(!store.set_active_status("zzz", SubscriptionStatus::Error).await.expect("set"), "{name}");

		assert_eq!(store.clear_active().await.expect("clear"), 2, "{name}");
		assert!(store.list_active().await.expect("list").is_empty(), "{name}");
	}
}

#[tokio::test]
async fn attention_flags_per_channel() {
	for (name, store) in backends().await {
		let a = key("bad-auth", "stream.online");
		let b = key("bad-auth", "stream.offline");
		let c = key("ok", "stream.online");
		for k in [&a, &b, &c] {
			store.add_desired(k).await.expect("add");
		}

		assert!(store.flag_attention(&a, "401 unauthorized").await.expect("flag"), "{name}");
		assert!(store.flag_attention(&c, "403 forbidden").await.expect("flag"), "{name}");
		assert!(
			!store
				.flag_attention(&key("missing", "x"), "nope")
				.await
				.expect("flag missing"),
			"{name}"
		);

		let bad = ChannelId::new("bad-auth").expect("channel");
		assert_eq!(store.clear_attention(Some(&bad)).await.expect("clear"), 1, "{name}");

		let desired = store.list_desired().await.expect("list");
		let flagged: Vec<_> = desired.iter().filter(|d| d.needs_attention.is_some()).collect();
		assert_eq!(flagged.len(), 1, "{name}");
		assert_eq!(flagged[0].key(), c, "{name}");

		assert_eq!(store.clear_attention(None).await.expect("clear all"), 1, "{name}");
	}
}

#[tokio::test]
async fn hub_state_and_audit_roundtrip() {
	for (name, store) in backends().await {
		store
			.put_state(&[("reconnect_count", "2".to_string()), ("connection", "up".to_string())])
			.await
			.expect("put");
		store
			.put_state(&[("reconnect_count", "3".to_string())])
			.await
			.expect("put");

		let state = store.load_state().await.expect("load");
		assert_eq!(state.get("reconnect_count").map(String::as_str), Some("3"), "{name}");
		assert_eq!(state.get("connection").map(String::as_str), Some("up"), "{name}");

		store
			.record_audit("reconcile", &serde_json::json!({"created": 1}), AuditSeverity::Info)
			.await
			.expect("audit");
		store
			.record_audit(
				"subscription_create_failed",
				&serde_json::json!({"channel_id": "100"}),
				AuditSeverity::Warning,
			)
			.await
			.expect("audit");

		let recent = store.recent_audit(10).await.expect("recent");
		assert_eq!(recent.len(), 2, "{name}");
		assert_eq!(recent[0].event_type, "subscription_create_failed", "{name}");
		assert_eq!(recent[0].severity, "warning", "{name}");
		assert_eq!(recent[1].details["created"], 1, "{name}");
	}
}

#[tokio::test]
async fn sqlite_file_survives_reopen() {
	let dir = tempfile::tempdir().expect("tempdir");
	let url = format!("sqlite://{}", dir.path().join("nested").join("hub.db").display());
	let k = key("100", "stream.online");

	{
		let store = SqliteStore::connect(&url).await.expect("open");
		store.add_desired(&k).await.expect("add");
		store
			.record_active("sub-1", &k, SubscriptionStatus::Enabled, 1)
			.await
			.expect("record");
		store.close().await;
	}

	let store = SqliteStore::connect(&url).await.expect("reopen");
	assert_eq!(store.list_desired().await.expect("list")[0].key(), k);
	assert_eq!(store.list_active().await.expect("list")[0].provider_subscription_id, "sub-1");
}

fn arb_keys() -> impl Strategy<Value = Vec<SubscriptionKey>> {
	proptest::collection::vec((0u8..6, 0u8..3), 0..12).prop_map(|pairs| {
		pairs
			.into_iter()
			.map(|(c, t)| key(&format!("ch{c}"), &format!("topic.{t}")))
			.collect()
	})
}

proptest! {
	#[test]
	fn diff_is_set_difference_and_converges(desired in arb_keys(), active in arb_keys()) {
		let d: BTreeSet<_> = desired.iter().cloned().collect();
		let a: BTreeSet<_> = active.iter().cloned().collect();

		let diff = compute_diff(desired, active);

		prop_assert_eq!(&diff.to_create, &d.difference(&a).cloned().collect::<BTreeSet<_>>());
		prop_assert_eq!(&diff.to_delete, &a.difference(&d).cloned().collect::<BTreeSet<_>>());

		let mut applied = a.clone();
		for k in &diff.to_delete {
			applied.remove(k);
		}
		applied.extend(diff.to_create.iter().cloned());
		prop_assert_eq!(&applied, &d);
		prop_assert!(compute_diff(applied.iter().cloned(), d.iter().cloned()).is_empty());
	}
}
