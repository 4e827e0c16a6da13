#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use evhub_domain::{
	ActiveSubscription, ChannelId, DesiredSubscription, SubscriptionKey, SubscriptionStatus, TRANSPORT_WEBSOCKET,
};
use evhub_util::time::unix_secs_now;
use tokio::sync::Mutex;

use super::{AuditEntry, AuditSeverity, StoreError, SubscriptionStore};

/// Non-durable store for local development and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
	inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
	desired: BTreeMap<SubscriptionKey, DesiredSubscription>,
	/// Keyed by provider subscription id.
	active: BTreeMap<String, ActiveSubscription>,
	state: BTreeMap<String, String>,
	audit: Vec<AuditEntry>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait::async_trait]
impl SubscriptionStore for MemoryStore {
	async fn add_desired(&self, key: &SubscriptionKey) -> Result<bool, StoreError> {
		let mut inner = self.inner.lock().await;
		if inner.desired.contains_key(key) {
			return Ok(false);
		}
		let now = unix_secs_now();
		inner.desired.insert(
			key.clone(),
			DesiredSubscription {
				channel_id: key.channel_id.clone(),
				topic: key.topic.clone(),
				transport: TRANSPORT_WEBSOCKET.to_string(),
				needs_attention: None,
				created_at: now,
				updated_at: now,
			},
		);
		Ok(true)
	}

	async fn remove_desired(&self, key: &SubscriptionKey) -> Result<bool, StoreError> {
		Ok(self.inner.lock().await.desired.remove(key).is_some())
	}

	async fn list_desired(&self) -> Result<Vec<DesiredSubscription>, StoreError> {
		Ok(self.inner.lock().await.desired.values().cloned().collect())
	}

	async fn record_active(
		&self,
		provider_subscription_id: &str,
		key: &SubscriptionKey,
		status: SubscriptionStatus,
		cost: i64,
	) -> Result<(), StoreError> {
		let mut inner = self.inner.lock().await;
		let now = unix_secs_now();

		let created_at = inner
			.active
			.get(provider_subscription_id)
			.map(|a| a.created_at)
			.unwrap_or(now);
		inner
			.active
			.retain(|id, a| id != provider_subscription_id && a.key() != *key);

		inner.active.insert(
			provider_subscription_id.to_string(),
			ActiveSubscription {
				provider_subscription_id: provider_subscription_id.to_string(),
				channel_id: key.channel_id.clone(),
				topic: key.topic.clone(),
				status,
				cost,
				created_at,
				updated_at: now,
			},
		);
		Ok(())
	}

	async fn remove_active(&self, provider_subscription_id: &str) -> Result<Option<SubscriptionKey>, StoreError> {
		Ok(self
			.inner
			.lock()
			.await
			.active
			.remove(provider_subscription_id)
			.map(|a| a.key()))
	}

	async fn list_active(&self) -> Result<Vec<ActiveSubscription>, StoreError> {
		Ok(self.inner.lock().await.active.values().cloned().collect())
	}

	async fn set_active_status(
		&self,
		provider_subscription_id: &str,
		status: SubscriptionStatus,
	) -> Result<bool, StoreError> {
		let mut inner = self.inner.lock().await;
		let Some(row) = inner.active.get_mut(provider_subscription_id) else {
			return Ok(false);
		};
		row.status = status;
		row.updated_at = unix_secs_now();
		Ok(true)
	}

	async fn promote_pending(&self, key: &SubscriptionKey) -> Result<bool, StoreError> {
		let mut inner = self.inner.lock().await;
		let now = unix_secs_now();
		let mut promoted = false;
		for row in inner.active.values_mut() {
			if row.status == SubscriptionStatus::Pending && row.key() == *key {
				row.status = SubscriptionStatus::Enabled;
				row.updated_at = now;
				promoted = true;
			}
		}
		Ok(promoted)
	}

	async fn mark_all_active_stale(&self) -> Result<u64, StoreError> {
		let mut inner = self.inner.lock().await;
		let now = unix_secs_now();
		for row in inner.active.values_mut() {
			row.status = SubscriptionStatus::Stale;
			row.updated_at = now;
		}
		Ok(inner.active.len() as u64)
	}

	async fn clear_active(&self) -> Result<u64, StoreError> {
		let mut inner = self.inner.lock().await;
		let n = inner.active.len() as u64;
		inner.active.clear();
		Ok(n)
	}

	async fn flag_attention(&self, key: &SubscriptionKey, reason: &str) -> Result<bool, StoreError> {
		let mut inner = self.inner.lock().await;
		let Some(row) = inner.desired.get_mut(key) else {
			return Ok(false);
		};
		row.needs_attention = Some(reason.to_string());
		row.updated_at = unix_secs_now();
		Ok(true)
	}

	async fn clear_attention(&self, channel_id: Option<&ChannelId>) -> Result<u64, StoreError> {
		let mut inner = self.inner.lock().await;
		let now = unix_secs_now();
		let mut cleared = 0;
		for row in inner.desired.values_mut() {
			if row.needs_attention.is_none() {
				continue;
			}
			if channel_id.is_some_and(|ch| *ch != row.channel_id) {
				continue;
			}
			row.needs_attention = None;
			row.updated_at = now;
			cleared += 1;
		}
		Ok(cleared)
	}

	async fn put_state(&self, pairs: &[(&'static str, String)]) -> Result<(), StoreError> {
		let mut inner = self.inner.lock().await;
		for (k, v) in pairs {
			inner.state.insert((*k).to_string(), v.clone());
		}
		Ok(())
	}

	async fn load_state(&self) -> Result<BTreeMap<String, String>, StoreError> {
		Ok(self.inner.lock().await.state.clone())
	}

	async fn record_audit(
		&self,
		event_type: &str,
		details: &serde_json::Value,
		severity: AuditSeverity,
	) -> Result<(), StoreError> {
		self.inner.lock().await.audit.push(AuditEntry {
			event_type: event_type.to_string(),
			details: details.clone(),
			severity: severity.as_str().to_string(),
			created_at: unix_secs_now(),
		});
		Ok(())
	}

	async fn recent_audit(&self, limit: usize) -> Result<Vec<AuditEntry>, StoreError> {
		let inner = self.inner.lock().await;
		Ok(inner.audit.iter().rev().take(limit).cloned().collect())
	}

	async fn close(&self) {}
}
