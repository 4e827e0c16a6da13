#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use evhub_domain::{
	ActiveSubscription, ChannelId, DesiredSubscription, SubscriptionKey, SubscriptionStatus, TRANSPORT_WEBSOCKET, Topic,
};
use evhub_util::time::unix_secs_now;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::debug;

use super::{AuditEntry, AuditSeverity, StoreError, SubscriptionStore};

/// Durable store on an embedded sqlite database in WAL mode.
#[derive(Clone)]
pub struct SqliteStore {
	pool: SqlitePool,
}

type DesiredRow = (String, String, String, Option<String>, i64, i64);
type ActiveRow = (String, String, String, String, i64, i64, i64);

impl SqliteStore {
	/// Open (creating if needed) and migrate. Accepts `sqlite://path`, `sqlite:path` and
	/// `sqlite::memory:`.
	pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
		let in_memory = database_url.contains(":memory:");

		if !in_memory
			&& let Some(parent) = sqlite_file_path(database_url).and_then(|p| p.parent().map(Path::to_path_buf))
			&& !parent.as_os_str().is_empty()
		{
			tokio::fs::create_dir_all(&parent)
				.await
				.map_err(|e| StoreError::Database(sqlx::Error::Io(e)))?;
		}

		let mut opts = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
		if !in_memory {
			opts = opts.journal_mode(SqliteJournalMode::Wal);
		}

		// every connection to `:memory:` is a separate database
		let max_connections = if in_memory { 1 } else { 4 };
		let pool = SqlitePoolOptions::new()
			.max_connections(max_connections)
			.connect_with(opts)
			.await?;

		sqlx::migrate!("migrations/sqlite").run(&pool).await?;
		debug!(url = %database_url, "sqlite store migrated");

		Ok(Self { pool })
	}

	pub fn pool(&self) -> &SqlitePool {
		&self.pool
	}
}

fn sqlite_file_path(url: &str) -> Option<&Path> {
	let rest = url.strip_prefix("sqlite://").or_else(|| url.strip_prefix("sqlite:"))?;
	let path = rest.split('?').next().unwrap_or(rest);
	if path.is_empty() { None } else { Some(Path::new(path)) }
}

fn parse_key(channel_id: String, topic: String) -> Result<SubscriptionKey, StoreError> {
	let channel_id = ChannelId::new(channel_id).map_err(|e| StoreError::Corrupt(format!("channel_id: {e}")))?;
	let topic = Topic::new(topic).map_err(|e| StoreError::Corrupt(format!("topic: {e}")))?;
	Ok(SubscriptionKey::new(channel_id, topic))
}

fn desired_from_row(row: DesiredRow) -> Result<DesiredSubscription, StoreError> {
	let (channel_id, topic, transport, needs_attention, created_at, updated_at) = row;
	let key = parse_key(channel_id, topic)?;
	Ok(DesiredSubscription {
		channel_id: key.channel_id,
		topic: key.topic,
		transport,
		needs_attention,
		created_at,
		updated_at,
	})
}

fn active_from_row(row: ActiveRow) -> Result<ActiveSubscription, StoreError> {
	let (id, channel_id, topic, status, cost, created_at, updated_at) = row;
	let key = parse_key(channel_id, topic)?;
	let status = status
		.parse::<SubscriptionStatus>()
		.map_err(|e| StoreError::Corrupt(format!("status for {id}: {e}")))?;
	Ok(ActiveSubscription {
		provider_subscription_id: id,
		channel_id: key.channel_id,
		topic: key.topic,
		status,
		cost,
		created_at,
		updated_at,
	})
}

#[async_trait::async_trait]
impl SubscriptionStore for SqliteStore {
	async fn add_desired(&self, key: &SubscriptionKey) -> Result<bool, StoreError> {
		let now = unix_secs_now();
		let res = sqlx::query(
			"INSERT INTO desired_subscriptions (channel_id, topic, transport, created_at, updated_at) \
			VALUES (?, ?, ?, ?, ?) ON CONFLICT(channel_id, topic) DO NOTHING",
		)
		.bind(key.channel_id.as_str())
		.bind(key.topic.as_str())
		.bind(TRANSPORT_WEBSOCKET)
		.bind(now)
		.bind(now)
		.execute(&self.pool)
		.await?;
		Ok(res.rows_affected() > 0)
	}

	async fn remove_desired(&self, key: &SubscriptionKey) -> Result<bool, StoreError> {
		let res = sqlx::query("DELETE FROM desired_subscriptions WHERE channel_id = ? AND topic = ?")
			.bind(key.channel_id.as_str())
			.bind(key.topic.as_str())
			.execute(&self.pool)
			.await?;
		Ok(res.rows_affected() > 0)
	}

	async fn list_desired(&self) -> Result<Vec<DesiredSubscription>, StoreError> {
		let rows: Vec<DesiredRow> = sqlx::query_as(
			"SELECT channel_id, topic, transport, needs_attention, created_at, updated_at \
			FROM desired_subscriptions ORDER BY channel_id, topic",
		)
		.fetch_all(&self.pool)
		.await?;
		rows.into_iter().map(desired_from_row).collect()
	}

	async fn record_active(
		&self,
		provider_subscription_id: &str,
		key: &SubscriptionKey,
		status: SubscriptionStatus,
		cost: i64,
	) -> Result<(), StoreError> {
		let now = unix_secs_now();
		let mut tx = self.pool.begin().await?;

		let existing: Option<(i64,)> =
			sqlx::query_as("SELECT created_at FROM active_subscriptions WHERE provider_subscription_id = ?")
				.bind(provider_subscription_id)
				.fetch_optional(&mut *tx)
				.await?;
		let created_at = existing.map(|(ts,)| ts).unwrap_or(now);

		sqlx::query(
			"DELETE FROM active_subscriptions WHERE provider_subscription_id = ? OR (channel_id = ? AND topic = ?)",
		)
		.bind(provider_subscription_id)
		.bind(key.channel_id.as_str())
		.bind(key.topic.as_str())
		.execute(&mut *tx)
		.await?;

		sqlx::query(
			"INSERT INTO active_subscriptions \
			(provider_subscription_id, channel_id, topic, status, cost, created_at, updated_at) \
			VALUES (?, ?, ?, ?, ?, ?, ?)",
		)
		.bind(provider_subscription_id)
		.bind(key.channel_id.as_str())
		.bind(key.topic.as_str())
		.bind(status.as_str())
		.bind(cost)
		.bind(created_at)
		.bind(now)
		.execute(&mut *tx)
		.await?;

		tx.commit().await?;
		Ok(())
	}

	async fn remove_active(&self, provider_subscription_id: &str) -> Result<Option<SubscriptionKey>, StoreError> {
		let row: Option<(String, String)> = sqlx::query_as(
			"DELETE FROM active_subscriptions WHERE provider_subscription_id = ? RETURNING channel_id, topic",
		)
		.bind(provider_subscription_id)
		.fetch_optional(&self.pool)
		.await?;
		row.map(|(ch, topic)| parse_key(ch, topic)).transpose()
	}

	async fn list_active(&self) -> Result<Vec<ActiveSubscription>, StoreError> {
		let rows: Vec<ActiveRow> = sqlx::query_as(
			"SELECT provider_subscription_id, channel_id, topic, status, cost, created_at, updated_at \
			FROM active_subscriptions ORDER BY channel_id, topic",
		)
		.fetch_all(&self.pool)
		.await?;
		rows.into_iter().map(active_from_row).collect()
	}

	async fn set_active_status(
		&self,
		provider_subscription_id: &str,
		status: SubscriptionStatus,
	) -> Result<bool, StoreError> {
		let res = sqlx::query(
			"UPDATE active_subscriptions SET status = ?, updated_at = ? WHERE provider_subscription_id = ?",
		)
		.bind(status.as_str())
		.bind(unix_secs_now())
		.bind(provider_subscription_id)
		.execute(&self.pool)
		.await?;
		Ok(res.rows_affected() > 0)
	}

	async fn promote_pending(&self, key: &SubscriptionKey) -> Result<bool, StoreError> {
		let res = sqlx::query(
			"UPDATE active_subscriptions SET status = ?, updated_at = ? \
			WHERE channel_id = ? AND topic = ? AND status = ?",
		)
		.bind(SubscriptionStatus::Enabled.as_str())
		.bind(unix_secs_now())
		.bind(key.channel_id.as_str())
		.bind(key.topic.as_str())
		.bind(SubscriptionStatus::Pending.as_str())
		.execute(&self.pool)
		.await?;
		Ok(res.rows_affected() > 0)
	}

	async fn mark_all_active_stale(&self) -> Result<u64, StoreError> {
		let res = sqlx::query("UPDATE active_subscriptions SET status = ?, updated_at = ?")
			.bind(SubscriptionStatus::Stale.as_str())
			.bind(unix_secs_now())
			.execute(&self.pool)
			.await?;
		Ok(res.rows_affected())
	}

	async fn clear_active(&self) -> Result<u64, StoreError> {
		let res = sqlx::query("DELETE FROM active_subscriptions")
			.execute(&self.pool)
			.await?;
		Ok(res.rows_affected())
	}

	async fn flag_attention(&self, key: &SubscriptionKey, reason: &str) -> Result<bool, StoreError> {
		let res = sqlx::query(
			"UPDATE desired_subscriptions SET needs_attention = ?, updated_at = ? WHERE channel_id = ? AND topic = ?",
		)
		.bind(reason)
		.bind(unix_secs_now())
		.bind(key.channel_id.as_str())
		.bind(key.topic.as_str())
		.execute(&self.pool)
		.await?;
		Ok(res.rows_affected() > 0)
	}

	async fn clear_attention(&self, channel_id: Option<&ChannelId>) -> Result<u64, StoreError> {
		let now = unix_secs_now();
		let res = match channel_id {
			Some(ch) => {
				sqlx::query(
					"UPDATE desired_subscriptions SET needs_attention = NULL, updated_at = ? \
					WHERE needs_attention IS NOT NULL AND channel_id = ?",
				)
				.bind(now)
				.bind(ch.as_str())
				.execute(&self.pool)
				.await?
			}
			None => {
				sqlx::query(
					"UPDATE desired_subscriptions SET needs_attention = NULL, updated_at = ? \
					WHERE needs_attention IS NOT NULL",
				)
				.bind(now)
				.execute(&self.pool)
				.await?
			}
		};
		Ok(res.rows_affected())
	}

	async fn put_state(&self, pairs: &[(&'static str, String)]) -> Result<(), StoreError> {
		let now = unix_secs_now();
		let mut tx = self.pool.begin().await?;
		for (key, value) in pairs {
			sqlx::query(
				"INSERT INTO hub_state (key, value, updated_at) VALUES (?, ?, ?) \
				ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
			)
			.bind(*key)
			.bind(value)
			.bind(now)
			.execute(&mut *tx)
			.await?;
		}
		tx.commit().await?;
		Ok(())
	}

	async fn load_state(&self) -> Result<BTreeMap<String, String>, StoreError> {
		let rows: Vec<(String, String)> = sqlx::query_as("SELECT key, value FROM hub_state")
			.fetch_all(&self.pool)
			.await?;
		Ok(rows.into_iter().collect())
	}

	async fn record_audit(
		&self,
		event_type: &str,
		details: &serde_json::Value,
		severity: AuditSeverity,
	) -> Result<(), StoreError> {
		sqlx::query("INSERT INTO audit_log (event_type, details, severity, created_at) VALUES (?, ?, ?, ?)")
			.bind(event_type)
			.bind(details.to_string())
			.bind(severity.as_str())
			.bind(unix_secs_now())
			.execute(&self.pool)
			.await?;
		Ok(())
	}

	async fn recent_audit(&self, limit: usize) -> Result<Vec<AuditEntry>, StoreError> {
		let rows: Vec<(String, String, String, i64)> = sqlx::query_as(
			"SELECT event_type, details, severity, created_at FROM audit_log ORDER BY id DESC LIMIT ?",
		)
		.bind(limit as i64)
		.fetch_all(&self.pool)
		.await?;

		rows.into_iter()
			.map(|(event_type, details, severity, created_at)| {
				let details = serde_json::from_str(&details)
					.map_err(|e| StoreError::Corrupt(format!("audit details: {e}")))?;
				Ok(AuditEntry {
					event_type,
					details,
					severity,
					created_at,
				})
			})
			.collect()
	}

	async fn close(&self) {
		self.pool.close().await;
	}
}
