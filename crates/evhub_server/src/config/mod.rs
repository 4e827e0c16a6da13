#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use evhub_provider::SecretString;
use serde::Deserialize;
use tracing::{info, warn};

pub const DEFAULT_SOCKET: &str = "unix:///tmp/evhub.sock";
pub const DEFAULT_ALLOWED_TOPICS: &[&str] = &["stream.online", "stream.offline"];
/// `persistence.database_url` value that selects the in-memory store.
pub const MEMORY_DATABASE_URL: &str = "memory";

/// Default config path: `~/.evhub/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".evhub").join("config.toml"))
}

/// Default database: `sqlite://~/.evhub/hub.db`, or the in-memory store without a home dir.
pub fn default_database_url() -> String {
	match dirs::home_dir() {
		Some(home) => format!("sqlite://{}", home.join(".evhub").join("hub.db").display()),
		None => MEMORY_DATABASE_URL.to_string(),
	}
}

/// Load the hub config from TOML and env overrides. A missing file is not an error.
pub fn load_config_from_path(path: &Path) -> anyhow::Result<HubConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = HubConfig::from_file(file_cfg);
	apply_env_overrides(&mut cfg, |k| std::env::var(k).ok());
	cfg.normalize();

	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct HubConfig {
	pub server: ServerSettings,
	pub scheduler: SchedulerSettings,
	pub transport: TransportSettings,
	pub reconcile: ReconcileSettings,
	pub persistence: PersistenceSettings,
	pub provider: ProviderSettings,
}

/// IPC listener and consumer session settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// `unix:///path`, bare absolute path, or `tcp://host:port`.
	pub socket: String,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	pub max_frame_bytes: usize,
	pub consumer_queue_capacity: usize,
	/// A consumer without a ping inside this window is reported as not alive.
	pub ping_timeout: Duration,
	/// How often a silent connection is checked; it is closed only once its writer has failed.
	pub idle_timeout: Duration,
	pub malformed_limit: u32,
	pub malformed_window: Duration,
	/// Empty means any topic is accepted.
	pub allowed_topics: Vec<String>,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			socket: DEFAULT_SOCKET.to_string(),
			metrics_bind: None,
			health_bind: None,
			max_frame_bytes: evhub_protocol::DEFAULT_MAX_FRAME_SIZE,
			consumer_queue_capacity: 256,
			ping_timeout: Duration::from_secs(30),
			idle_timeout: Duration::from_secs(120),
			malformed_limit: 5,
			malformed_window: Duration::from_secs(10),
			allowed_topics: DEFAULT_ALLOWED_TOPICS.iter().map(|s| s.to_string()).collect(),
		}
	}
}

/// Outbound request pacing.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
	pub rate_per_sec: f64,
	/// Upper bound of the uniform jitter added before each dispatch.
	pub jitter: Duration,
}

impl SchedulerSettings {
	/// Minimum spacing between two dispatches.
	pub fn interval(&self) -> Duration {
		if self.rate_per_sec > 0.0 {
			Duration::from_secs_f64(1.0 / self.rate_per_sec)
		} else {
			Duration::ZERO
		}
	}
}

impl Default for SchedulerSettings {
	fn default() -> Self {
		Self {
			rate_per_sec: 2.0,
			jitter: Duration::from_millis(200),
		}
	}
}

/// Upstream connection supervision.
#[derive(Debug, Clone)]
pub struct TransportSettings {
	pub backoff_base: Duration,
	pub backoff_max: Duration,
	/// A connection alive this long resets the reconnect backoff.
	pub stable_after: Duration,
	/// Dead-connection timeout as a multiple of the provider keepalive interval.
	pub keepalive_grace: f64,
	pub startup_connect_timeout: Duration,
}

impl Default for TransportSettings {
	fn default() -> Self {
		Self {
			backoff_base: Duration::from_millis(2_000),
			backoff_max: Duration::from_millis(60_000),
			stable_after: Duration::from_secs(60),
			keepalive_grace: 2.5,
			startup_connect_timeout: Duration::from_secs(10),
		}
	}
}

#[derive(Debug, Clone)]
pub struct ReconcileSettings {
	pub interval: Duration,
	pub interval_jitter: Duration,
	/// Failures inside `burst_window` that put a channel into backoff.
	pub burst_threshold: u32,
	pub burst_window: Duration,
	pub backoff_base: Duration,
	pub backoff_max: Duration,
}

impl Default for ReconcileSettings {
	fn default() -> Self {
		Self {
			interval: Duration::from_secs(60),
			interval_jitter: Duration::from_secs(5),
			burst_threshold: 3,
			burst_window: Duration::from_secs(300),
			backoff_base: Duration::from_secs(30),
			backoff_max: Duration::from_secs(900),
		}
	}
}

#[derive(Debug, Clone)]
pub struct PersistenceSettings {
	/// `sqlite://...` or `memory`.
	pub database_url: String,
	pub audit_enabled: bool,
}

impl Default for PersistenceSettings {
	fn default() -> Self {
		Self {
			database_url: default_database_url(),
			audit_enabled: true,
		}
	}
}

impl PersistenceSettings {
	pub fn is_memory(&self) -> bool {
		self.database_url.trim().eq_ignore_ascii_case(MEMORY_DATABASE_URL)
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProviderKind {
	#[default]
	EventSub,
	Fake,
}

impl ProviderKind {
	pub fn parse(s: &str) -> Option<Self> {
		match s.trim().to_ascii_lowercase().as_str() {
			"eventsub" => Some(Self::EventSub),
			"fake" => Some(Self::Fake),
			_ => None,
		}
	}
}

#[derive(Debug, Clone)]
pub struct ProviderSettings {
	pub kind: ProviderKind,
	pub client_id: Option<String>,
	pub access_token: Option<SecretString>,
	pub ws_url: Option<String>,
	pub api_base_url: Option<String>,
	pub condition_key: String,
	pub topic_versions: BTreeMap<String, String>,
}

impl Default for ProviderSettings {
	fn default() -> Self {
		Self {
			kind: ProviderKind::EventSub,
			client_id: None,
			access_token: None,
			ws_url: None,
			api_base_url: None,
			condition_key: evhub_provider::eventsub::DEFAULT_CONDITION_KEY.to_string(),
			topic_versions: BTreeMap::new(),
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,
	#[serde(default)]
	scheduler: FileSchedulerSettings,
	#[serde(default)]
	transport: FileTransportSettings,
	#[serde(default)]
	reconcile: FileReconcileSettings,
	#[serde(default)]
	persistence: FilePersistenceSettings,
	#[serde(default)]
	provider: FileProviderSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	socket: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	max_frame_bytes: Option<usize>,
	consumer_queue_capacity: Option<usize>,
	ping_timeout_secs: Option<u64>,
	idle_timeout_secs: Option<u64>,
	malformed_limit: Option<u32>,
	malformed_window_secs: Option<u64>,
	allowed_topics: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileSchedulerSettings {
	rate_per_sec: Option<f64>,
	jitter_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileTransportSettings {
	backoff_base_ms: Option<u64>,
	backoff_max_ms: Option<u64>,
	stable_after_secs: Option<u64>,
	keepalive_grace: Option<f64>,
	startup_connect_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileReconcileSettings {
	interval_secs: Option<u64>,
	interval_jitter_secs: Option<u64>,
	burst_threshold: Option<u32>,
	burst_window_secs: Option<u64>,
	backoff_base_secs: Option<u64>,
	backoff_max_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	database_url: Option<String>,
	audit_enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileProviderSettings {
	kind: Option<String>,
	client_id: Option<String>,
	access_token: Option<String>,
	ws_url: Option<String>,
	api_base_url: Option<String>,
	condition_key: Option<String>,
	#[serde(default)]
	topic_versions: BTreeMap<String, String>,
}

fn non_empty(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl HubConfig {
	fn from_file(file: FileConfig) -> Self {
		let server_d = ServerSettings::default();
		let sched_d = SchedulerSettings::default();
		let transport_d = TransportSettings::default();
		let reconcile_d = ReconcileSettings::default();

		let kind = match non_empty(file.provider.kind) {
			Some(k) => ProviderKind::parse(&k).unwrap_or_else(|| {
				warn!(kind = %k, "provider config: unknown kind; using eventsub");
				ProviderKind::EventSub
			}),
			None => ProviderKind::EventSub,
		};

		Self {
			server: ServerSettings {
				socket: non_empty(file.server.socket).unwrap_or(server_d.socket),
				metrics_bind: non_empty(file.server.metrics_bind),
				health_bind: non_empty(file.server.health_bind),
				max_frame_bytes: file.server.max_frame_bytes.unwrap_or(server_d.max_frame_bytes),
				consumer_queue_capacity: file
					.server
					.consumer_queue_capacity
					.unwrap_or(server_d.consumer_queue_capacity),
				ping_timeout: file
					.server
					.ping_timeout_secs
					.map(Duration::from_secs)
					.unwrap_or(server_d.ping_timeout),
				idle_timeout: file
					.server
					.idle_timeout_secs
					.map(Duration::from_secs)
					.unwrap_or(server_d.idle_timeout),
				malformed_limit: file.server.malformed_limit.unwrap_or(server_d.malformed_limit),
				malformed_window: file
					.server
					.malformed_window_secs
					.map(Duration::from_secs)
					.unwrap_or(server_d.malformed_window),
				allowed_topics: file
					.server
					.allowed_topics
					.map(|v| {
						v.into_iter()
							.map(|s| s.trim().to_string())
							.filter(|s| !s.is_empty())
							.collect()
					})
					.unwrap_or(server_d.allowed_topics),
			},
			scheduler: SchedulerSettings {
				rate_per_sec: file.scheduler.rate_per_sec.unwrap_or(sched_d.rate_per_sec),
				jitter: file.scheduler.jitter_ms.map(Duration::from_millis).unwrap_or(sched_d.jitter),
			},
			transport: TransportSettings {
				backoff_base: file
					.transport
					.backoff_base_ms
					.map(Duration::from_millis)
					.unwrap_or(transport_d.backoff_base),
				backoff_max: file
					.transport
					.backoff_max_ms
					.map(Duration::from_millis)
					.unwrap_or(transport_d.backoff_max),
				stable_after: file
					.transport
					.stable_after_secs
					.map(Duration::from_secs)
					.unwrap_or(transport_d.stable_after),
				keepalive_grace: file.transport.keepalive_grace.unwrap_or(transport_d.keepalive_grace),
				startup_connect_timeout: file
					.transport
					.startup_connect_timeout_secs
					.map(Duration::from_secs)
					.unwrap_or(transport_d.startup_connect_timeout),
			},
			reconcile: ReconcileSettings {
				interval: file
					.reconcile
					.interval_secs
					.map(Duration::from_secs)
					.unwrap_or(reconcile_d.interval),
				interval_jitter: file
					.reconcile
					.interval_jitter_secs
					.map(Duration::from_secs)
					.unwrap_or(reconcile_d.interval_jitter),
				burst_threshold: file.reconcile.burst_threshold.unwrap_or(reconcile_d.burst_threshold),
				burst_window: file
					.reconcile
					.burst_window_secs
					.map(Duration::from_secs)
					.unwrap_or(reconcile_d.burst_window),
				backoff_base: file
					.reconcile
					.backoff_base_secs
					.map(Duration::from_secs)
					.unwrap_or(reconcile_d.backoff_base),
				backoff_max: file
					.reconcile
					.backoff_max_secs
					.map(Duration::from_secs)
					.unwrap_or(reconcile_d.backoff_max),
			},
			persistence: PersistenceSettings {
				database_url: non_empty(file.persistence.database_url).unwrap_or_else(default_database_url),
				audit_enabled: file.persistence.audit_enabled.unwrap_or(true),
			},
			provider: ProviderSettings {
				kind,
				client_id: non_empty(file.provider.client_id),
				access_token: non_empty(file.provider.access_token).map(SecretString::new),
				ws_url: non_empty(file.provider.ws_url),
				api_base_url: non_empty(file.provider.api_base_url),
				condition_key: non_empty(file.provider.condition_key)
					.unwrap_or_else(|| evhub_provider::eventsub::DEFAULT_CONDITION_KEY.to_string()),
				topic_versions: file.provider.topic_versions,
			},
		}
	}

	/// Clamp values that would stall the hub and swap inverted min/max pairs.
	pub fn normalize(&mut self) {
		if !self.scheduler.rate_per_sec.is_finite() || self.scheduler.rate_per_sec <= 0.0 {
			warn!(
				rate = self.scheduler.rate_per_sec,
				"scheduler config: rate_per_sec must be > 0; using 2.0"
			);
			self.scheduler.rate_per_sec = 2.0;
		}

		if self.transport.backoff_base > self.transport.backoff_max {
			warn!(
				min_ms = self.transport.backoff_base.as_millis(),
				max_ms = self.transport.backoff_max.as_millis(),
				"transport config: backoff_base > backoff_max; swapping"
			);
			std::mem::swap(&mut self.transport.backoff_base, &mut self.transport.backoff_max);
		}

		if self.reconcile.backoff_base > self.reconcile.backoff_max {
			warn!(
				min_secs = self.reconcile.backoff_base.as_secs(),
				max_secs = self.reconcile.backoff_max.as_secs(),
				"reconcile config: backoff_base > backoff_max; swapping"
			);
			std::mem::swap(&mut self.reconcile.backoff_base, &mut self.reconcile.backoff_max);
		}

		if !self.transport.keepalive_grace.is_finite() || self.transport.keepalive_grace < 1.0 {
			warn!(
				grace = self.transport.keepalive_grace,
				"transport config: keepalive_grace below 1.0; using 2.5"
			);
			self.transport.keepalive_grace = 2.5;
		}

		if self.reconcile.burst_threshold == 0 {
			self.reconcile.burst_threshold = 1;
		}

		if self.server.consumer_queue_capacity == 0 {
			self.server.consumer_queue_capacity = 1;
		}
	}
}

pub(crate) fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

pub(crate) fn apply_env_overrides(cfg: &mut HubConfig, env: impl Fn(&str) -> Option<String>) {
	let var = |k: &str| env(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

	if let Some(v) = var("EVHUB_SOCKET") {
		cfg.server.socket = v;
		info!("server config: socket overridden by env");
	}

	if let Some(v) = var("EVHUB_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = var("EVHUB_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(v) = var("EVHUB_MAX_FRAME_BYTES")
		&& let Ok(n) = v.parse::<usize>()
	{
		cfg.server.max_frame_bytes = n;
		info!(max_frame_bytes = n, "server config: max_frame_bytes overridden by env");
	}

	if let Some(v) = var("EVHUB_IDLE_TIMEOUT_SECS")
		&& let Ok(secs) = v.parse::<u64>()
	{
		cfg.server.idle_timeout = Duration::from_secs(secs);
		info!(secs, "server config: idle_timeout overridden by env");
	}

	if let Some(v) = var("EVHUB_REQ_RATE_PER_SEC")
		&& let Ok(rate) = v.parse::<f64>()
	{
		cfg.scheduler.rate_per_sec = rate;
		info!(rate, "scheduler config: rate_per_sec overridden by env");
	}

	if let Some(v) = var("EVHUB_REQ_JITTER_MS")
		&& let Ok(ms) = v.parse::<u64>()
	{
		cfg.scheduler.jitter = Duration::from_millis(ms);
		info!(ms, "scheduler config: jitter overridden by env");
	}

	if let Some(v) = var("EVHUB_BACKOFF_BASE_MS")
		&& let Ok(ms) = v.parse::<u64>()
	{
		cfg.transport.backoff_base = Duration::from_millis(ms);
		info!(ms, "transport config: backoff_base overridden by env");
	}

	if let Some(v) = var("EVHUB_BACKOFF_MAX_MS")
		&& let Ok(ms) = v.parse::<u64>()
	{
		cfg.transport.backoff_max = Duration::from_millis(ms);
		info!(ms, "transport config: backoff_max overridden by env");
	}

	if let Some(v) = var("EVHUB_RECONCILE_INTERVAL_SECS")
		&& let Ok(secs) = v.parse::<u64>()
	{
		cfg.reconcile.interval = Duration::from_secs(secs);
		info!(secs, "reconcile config: interval overridden by env");
	}

	if let Some(v) = var("EVHUB_DATABASE_URL") {
		cfg.persistence.database_url = v;
		info!("persistence: database_url overridden by env");
	}

	if let Some(v) = var("EVHUB_AUDIT_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.persistence.audit_enabled = enabled;
		info!(enabled, "persistence: audit_enabled overridden by env");
	}

	if let Some(v) = var("EVHUB_PROVIDER") {
		match ProviderKind::parse(&v) {
			Some(kind) => {
				cfg.provider.kind = kind;
				info!(?kind, "provider config: kind overridden by env");
			}
			None => warn!(kind = %v, "provider config: unknown EVHUB_PROVIDER ignored"),
		}
	}

	if let Some(v) = var("EVHUB_CLIENT_ID") {
		cfg.provider.client_id = Some(v);
		info!("provider config: client_id overridden by env");
	}

	if let Some(v) = var("EVHUB_ACCESS_TOKEN") {
		cfg.provider.access_token = Some(SecretString::new(v));
		info!("provider config: access_token overridden by env");
	}

	if let Some(v) = var("EVHUB_WS_URL") {
		cfg.provider.ws_url = Some(v);
		info!("provider config: ws_url overridden by env");
	}

	if let Some(v) = var("EVHUB_API_BASE_URL") {
		cfg.provider.api_base_url = Some(v);
		info!("provider config: api_base_url overridden by env");
	}
}

#[cfg(test)]
mod config_tests;
