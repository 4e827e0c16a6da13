#![forbid(unsafe_code)]
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use evhub_client::HubClient;
use evhub_domain::{ActiveSubscription, ChannelId, DesiredSubscription, SubscriptionKey, SubscriptionStatus, Topic};
use evhub_provider::fake::FakeProvider;
use evhub_server::config::{HubConfig, MEMORY_DATABASE_URL};
use evhub_server::server::store::memory::MemoryStore;
use evhub_server::server::store::{AuditEntry, AuditSeverity, StoreError, SubscriptionStore, open_store};
use evhub_server::{Hub, HubHandle};

static LOG_INIT: OnceLock<()> = OnceLock::new();

pub fn init_test_logging() {
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

/// Fast pacing, no periodic passes: passes run on connect, on consumer changes and on resync.
pub fn test_config(dir: &Path) -> HubConfig {
	let mut cfg = HubConfig::default();
	cfg.server.socket = format!("unix://{}", dir.join("hub.sock").display());
	cfg.scheduler.rate_per_sec = 1000.0;
	cfg.scheduler.jitter = Duration::ZERO;
	cfg.transport.backoff_base = Duration::from_millis(20);
	cfg.transport.backoff_max = Duration::from_millis(200);
	cfg.transport.startup_connect_timeout = Duration::from_secs(5);
	cfg.reconcile.interval = Duration::from_secs(3600);
	cfg.reconcile.interval_jitter = Duration::ZERO;
	cfg.reconcile.burst_threshold = 3;
	cfg.reconcile.burst_window = Duration::from_secs(60);
	cfg.reconcile.backoff_base = Duration::from_secs(30);
	cfg.reconcile.backoff_max = Duration::from_secs(60);
	cfg.persistence.database_url = MEMORY_DATABASE_URL.to_string();
	cfg.persistence.audit_enabled = true;
	cfg
}

pub struct TestHub {
	pub dir: tempfile::TempDir,
	pub fake: FakeProvider,
	pub hub: HubHandle,
}

impl TestHub {
	pub async fn start() -> Self {
		Self::start_with(FakeProvider::new(), |_| {}).await
	}

	pub async fn start_with(fake: FakeProvider, tweak: impl FnOnce(&mut HubConfig)) -> Self {
		init_test_logging();
		let dir = tempfile::tempdir().expect("tempdir");
		let mut cfg = test_config(dir.path());
		tweak(&mut cfg);
		let hub = start_hub(&fake, cfg).await;
		Self { dir, fake, hub }
	}

	pub fn store(&self) -> Arc<dyn SubscriptionStore> {
		self.hub.store()
	}

	pub async fn client(&self) -> HubClient {
		HubClient::connect(self.hub.endpoint()).await.expect("connect to hub")
	}

	/// Connect and say hello; every topic must be accepted.
	pub async fn consumer(&self, channel_id: &str, topics: &[&str]) -> HubClient {
		let mut client = self.client().await;
		let replies = client
			.hello(&format!("chan-{channel_id}"), channel_id, topics)
			.await
			.expect("hello");
		assert_eq!(replies.len(), topics.len());
		assert!(replies.iter().all(|r| r.is_ok()), "{replies:?}");
		client
	}

	pub async fn shutdown(self) -> (tempfile::TempDir, FakeProvider) {
		self.hub.shutdown().await.expect("shutdown");
		(self.dir, self.fake)
	}
}

pub async fn start_hub(fake: &FakeProvider, cfg: HubConfig) -> HubHandle {
	let store = open_store(&cfg.persistence).await.expect("open store");
	Hub::start(cfg, store, Arc::new(fake.clone()), Arc::new(fake.clone()))
		.await
		.expect("start hub")
}

pub fn key(channel_id: &str, topic: &str) -> SubscriptionKey {
	SubscriptionKey::new(ch(channel_id), Topic::new(topic).expect("topic"))
}

pub fn ch(channel_id: &str) -> ChannelId {
	ChannelId::new(channel_id).expect("channel id")
}

pub async fn desired_keys(store: &Arc<dyn SubscriptionStore>) -> Vec<SubscriptionKey> {
	store
		.list_desired()
		.await
		.expect("list_desired")
		.iter()
		.map(|d| d.key())
		.collect()
}

pub async fn active_keys(store: &Arc<dyn SubscriptionStore>) -> Vec<SubscriptionKey> {
	store
		.list_active()
		.await
		.expect("list_active")
		.iter()
		.map(|a| a.key())
		.collect()
}

/// Active keys that have been confirmed upstream; persisted rows awaiting revalidation
/// are left out.
pub async fn enabled_keys(store: &Arc<dyn SubscriptionStore>) -> Vec<SubscriptionKey> {
	store
		.list_active()
		.await
		.expect("list_active")
		.iter()
		.filter(|a| a.status == SubscriptionStatus::Enabled)
		.map(|a| a.key())
		.collect()
}

/// Poll `check` until it holds, failing the test after five seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
	F: FnMut() -> Fut,
	Fut: Future<Output = bool>,
{
	let polled = tokio::time::timeout(Duration::from_secs(5), async {
		loop {
			if check().await {
				return;
			}
			tokio::time::sleep(Duration::from_millis(20)).await;
		}
	})
	.await;
	assert!(polled.is_ok(), "timed out waiting for {what}");
}

/// In-memory store whose subscription tables can be switched to failing.
///
/// Hub-state and audit writes keep working so only the subscription paths are affected.
#[derive(Default)]
pub struct FailingStore {
	inner: MemoryStore,
	broken: AtomicBool,
}

impl FailingStore {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn set_broken(&self, broken: bool) {
		self.broken.store(broken, Ordering::SeqCst);
	}

	fn check(&self) -> Result<(), StoreError> {
		if self.broken.load(Ordering::SeqCst) {
			return Err(StoreError::Corrupt("storage unavailable".to_string()));
		}
		Ok(())
	}
}

#[async_trait::async_trait]
impl SubscriptionStore for FailingStore {
	async fn add_desired(&self, key: &SubscriptionKey) -> Result<bool, StoreError> {
		self.check()?;
		self.inner.add_desired(key).await
	}

	async fn remove_desired(&self, key: &SubscriptionKey) -> Result<bool, StoreError> {
		self.check()?;
		self.inner.remove_desired(key).await
	}

	async fn list_desired(&self) -> Result<Vec<DesiredSubscription>, StoreError> {
		self.check()?;
		self.inner.list_desired().await
	}

	async fn record_active(
		&self,
		provider_subscription_id: &str,
		key: &SubscriptionKey,
		status: SubscriptionStatus,
		cost: i64,
	) -> Result<(), StoreError> {
		self.check()?;
		self.inner.record_active(provider_subscription_id, key, status, cost).await
	}

	async fn remove_active(&self, provider_subscription_id: &str) -> Result<Option<SubscriptionKey>, StoreError> {
		self.check()?;
		self.inner.remove_active(provider_subscription_id).await
	}

	async fn list_active(&self) -> Result<Vec<ActiveSubscription>, StoreError> {
		self.check()?;
		self.inner.list_active().await
	}

	async fn set_active_status(
		&self,
		provider_subscription_id: &str,
		status: SubscriptionStatus,
	) -> Result<bool, StoreError> {
		self.check()?;
		self.inner.set_active_status(provider_subscription_id, status).await
	}

	async fn promote_pending(&self, key: &SubscriptionKey) -> Result<bool, StoreError> {
		self.check()?;
		self.inner.promote_pending(key).await
	}

	async fn mark_all_active_stale(&self) -> Result<u64, StoreError> {
		self.check()?;
		self.inner.mark_all_active_stale().await
	}

	async fn clear_active(&self) -> Result<u64, StoreError> {
		self.check()?;
		self.inner.clear_active().await
	}

	async fn flag_attention(&self, key: &SubscriptionKey, reason: &str) -> Result<bool, StoreError> {
		self.check()?;
		self.inner.flag_attention(key, reason).await
	}

	async fn clear_attention(&self, channel_id: Option<&ChannelId>) -> Result<u64, StoreError> {
		self.check()?;
		self.inner.clear_attention(channel_id).await
	}

	async fn put_state(&self, pairs: &[(&'static str, String)]) -> Result<(), StoreError> {
		self.inner.put_state(pairs).await
	}

	async fn load_state(&self) -> Result<BTreeMap<String, String>, StoreError> {
		self.inner.load_state().await
	}

	async fn record_audit(
		&self,
		event_type: &str,
		details: &serde_json::Value,
		severity: AuditSeverity,
	) -> Result<(), StoreError> {
		self.inner.record_audit(event_type, details, severity).await
	}

	async fn recent_audit(&self, limit: usize) -> Result<Vec<AuditEntry>, StoreError> {
		self.inner.recent_audit(limit).await
	}

	async fn close(&self) {
		self.inner.close().await
	}
}
