#![forbid(unsafe_code)]

pub mod memory;
pub mod sqlite;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::Context as _;
use evhub_domain::{ActiveSubscription, ChannelId, DesiredSubscription, SubscriptionKey, SubscriptionStatus};
use thiserror::Error;
use tracing::info;

use crate::config::PersistenceSettings;

/// Persistence failures. Callers log these and fail only the current operation.
#[derive(Debug, Error)]
pub enum StoreError {
	#[error("database error: {0}")]
	Database(#[from] sqlx::Error),

	#[error("migration failed: {0}")]
	Migrate(#[from] sqlx::migrate::MigrateError),

	#[error("corrupt row: {0}")]
	Corrupt(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditSeverity {
	Info,
	Warning,
	Error,
}

impl AuditSeverity {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Info => "info",
			Self::Warning => "warning",
			Self::Error => "error",
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
	pub event_type: String,
	pub details: serde_json::Value,
	pub severity: String,
	pub created_at: i64,
}

/// Work needed to move the active set onto the desired set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionDiff {
	pub to_create: BTreeSet<SubscriptionKey>,
	pub to_delete: BTreeSet<SubscriptionKey>,
}

impl SubscriptionDiff {
	pub fn is_empty(&self) -> bool {
		self.to_create.is_empty() && self.to_delete.is_empty()
	}
}

/// `to_create = desired - active`, `to_delete = active - desired`, joined on `(channel_id, topic)`.
pub fn compute_diff<D, A>(desired: D, active: A) -> SubscriptionDiff
where
	D: IntoIterator<Item = SubscriptionKey>,
	A: IntoIterator<Item = SubscriptionKey>,
{
	let desired: BTreeSet<SubscriptionKey> = desired.into_iter().collect();
	let active: BTreeSet<SubscriptionKey> = active.into_iter().collect();

	SubscriptionDiff {
		to_create: desired.difference(&active).cloned().collect(),
		to_delete: active.difference(&desired).cloned().collect(),
	}
}

/// Durable desired/active subscription sets plus the hub-state and audit tables.
#[async_trait::async_trait]
pub trait SubscriptionStore: Send + Sync + 'static {
	/// Returns true if the entry was inserted.
	async fn add_desired(&self, key: &SubscriptionKey) -> Result<bool, StoreError>;

	/// Returns true if an entry was removed.
	async fn remove_desired(&self, key: &SubscriptionKey) -> Result<bool, StoreError>;

	async fn list_desired(&self) -> Result<Vec<DesiredSubscription>, StoreError>;

	/// Upsert. Any row sharing the key or the provider id is replaced.
	async fn record_active(
		&self,
		provider_subscription_id: &str,
		key: &SubscriptionKey,
		status: SubscriptionStatus,
		cost: i64,
	) -> Result<(), StoreError>;

	/// Returns the key of the removed row.
	async fn remove_active(&self, provider_subscription_id: &str) -> Result<Option<SubscriptionKey>, StoreError>;

	async fn list_active(&self) -> Result<Vec<ActiveSubscription>, StoreError>;

	async fn set_active_status(
		&self,
		provider_subscription_id: &str,
		status: SubscriptionStatus,
	) -> Result<bool, StoreError>;

	/// `pending` -> `enabled` for the row with this key.
	async fn promote_pending(&self, key: &SubscriptionKey) -> Result<bool, StoreError>;

	async fn mark_all_active_stale(&self) -> Result<u64, StoreError>;

	async fn clear_active(&self) -> Result<u64, StoreError>;

	async fn flag_attention(&self, key: &SubscriptionKey, reason: &str) -> Result<bool, StoreError>;

	/// Clear flags for one channel, or every channel when `None`.
	async fn clear_attention(&self, channel_id: Option<&ChannelId>) -> Result<u64, StoreError>;

	async fn put_state(&self, pairs: &[(&'static str, String)]) -> Result<(), StoreError>;

	async fn load_state(&self) -> Result<BTreeMap<String, String>, StoreError>;

	async fn record_audit(
		&self,
		event_type: &str,
		details: &serde_json::Value,
		severity: AuditSeverity,
	) -> Result<(), StoreError>;

	/// Newest first.
	async fn recent_audit(&self, limit: usize) -> Result<Vec<AuditEntry>, StoreError>;

	async fn close(&self);

	async fn diff(&self) -> Result<SubscriptionDiff, StoreError> {
		let desired = self.list_desired().await?;
		let active = self.list_active().await?;
		Ok(compute_diff(
			desired.iter().map(DesiredSubscription::key),
			active.iter().map(ActiveSubscription::key),
		))
	}
}

/// Open the configured backend: `memory` or a `sqlite:` URL.
pub async fn open_store(settings: &PersistenceSettings) -> anyhow::Result<Arc<dyn SubscriptionStore>> {
	if settings.is_memory() {
		info!("persistence: using in-memory store (state is lost on restart)");
		return Ok(Arc::new(memory::MemoryStore::new()));
	}

	let store = sqlite::SqliteStore::connect(&settings.database_url)
		.await
		.with_context(|| format!("open store at {}", settings.database_url))?;
	info!(url = %settings.database_url, "persistence: sqlite store ready");
	Ok(Arc::new(store))
}

#[cfg(test)]
mod store_tests;
