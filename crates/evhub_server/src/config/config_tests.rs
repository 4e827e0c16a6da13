#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::io::Write as _;
use std::time::Duration;

use super::*;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
	let mut f = tempfile::NamedTempFile::new().expect("tempfile");
	f.write_all(contents.as_bytes()).expect("write config");
	f
}

fn from_toml(contents: &str) -> HubConfig {
	let f = write_config(contents);
	let file_cfg = read_toml_if_exists(f.path()).expect("read").expect("some");
	HubConfig::from_file(file_cfg)
}

#[test]
fn missing_file_yields_defaults() {
	let dir = tempfile::tempdir().expect("tempdir");
	let path = dir.path().join("nope.toml");
	assert!(read_toml_if_exists(&path).expect("read").is_none());

	let cfg = HubConfig::from_file(FileConfig::default());
	assert_eq!(cfg.server.socket, DEFAULT_SOCKET);
	assert_eq!(cfg.server.max_frame_bytes, 64 * 1024);
	assert_eq!(cfg.scheduler.interval(), Duration::from_millis(500));
	assert_eq!(cfg.reconcile.burst_threshold, 3);
	assert_eq!(cfg.provider.kind, ProviderKind::EventSub);
	assert_eq!(cfg.server.allowed_topics, vec!["stream.online", "stream.offline"]);
}

#[test]
fn file_values_override_defaults() {
	let cfg = from_toml(
		r#"
[server]
socket = "tcp://127.0.0.1:7450"
allowed_topics = []
ping_timeout_secs = 5

[scheduler]
rate_per_sec = 1.0
jitter_ms = 300

[reconcile]
interval_secs = 15
burst_threshold = 4

[persistence]
database_url = "memory"
audit_enabled = false

[provider]
kind = "fake"
access_token = "sekrit"

[provider.topic_versions]
"channel.follow" = "2"
"#,
	);

	assert_eq!(cfg.server.socket, "tcp://127.0.0.1:7450");
	assert!(cfg.server.allowed_topics.is_empty());
	assert_eq!(cfg.server.ping_timeout, Duration::from_secs(5));
	assert_eq!(cfg.scheduler.interval(), Duration::from_secs(1));
	assert_eq!(cfg.scheduler.jitter, Duration::from_millis(300));
	assert_eq!(cfg.reconcile.interval, Duration::from_secs(15));
	assert_eq!(cfg.reconcile.burst_threshold, 4);
	assert!(cfg.persistence.is_memory());
	assert!(!cfg.persistence.audit_enabled);
	assert_eq!(cfg.provider.kind, ProviderKind::Fake);
	assert_eq!(cfg.provider.access_token.as_ref().map(|s| s.expose()), Some("sekrit"));
	assert_eq!(cfg.provider.topic_versions.get("channel.follow").map(String::as_str), Some("2"));
	assert!(!format!("{cfg:?}").contains("sekrit"));
}

#[test]
fn invalid_toml_is_an_error() {
	let f = write_config("[server\nsocket = ");
	assert!(load_config_from_path(f.path()).is_err());
}

#[test]
fn env_overrides_apply_and_unknown_values_are_ignored() {
	let env: HashMap<&str, &str> = HashMap::from([
		("EVHUB_SOCKET", "unix:///run/evhub.sock"),
		("EVHUB_REQ_RATE_PER_SEC", "4"),
		("EVHUB_AUDIT_ENABLED", "off"),
		("EVHUB_PROVIDER", "carrier-pigeon"),
		("EVHUB_RECONCILE_INTERVAL_SECS", "not-a-number"),
		("EVHUB_ACCESS_TOKEN", "  "),
	]);

	let mut cfg = HubConfig::default();
	apply_env_overrides(&mut cfg, |k| env.get(k).map(|v| v.to_string()));

	assert_eq!(cfg.server.socket, "unix:///run/evhub.sock");
	assert_eq!(cfg.scheduler.interval(), Duration::from_millis(250));
	assert!(!cfg.persistence.audit_enabled);
	assert_eq!(cfg.provider.kind, ProviderKind::EventSub);
	assert_eq!(cfg.reconcile.interval, Duration::from_secs(60));
	assert!(cfg.provider.access_token.is_none());
}

#[test]
fn normalize_swaps_inverted_backoff_and_fixes_rate() {
	let mut cfg = HubConfig::default();
	cfg.transport.backoff_base = Duration::from_secs(90);
	cfg.transport.backoff_max = Duration::from_secs(3);
	cfg.scheduler.rate_per_sec = 0.0;
	cfg.transport.keepalive_grace = 0.5;

	cfg.normalize();

	assert_eq!(cfg.transport.backoff_base, Duration::from_secs(3));
	assert_eq!(cfg.transport.backoff_max, Duration::from_secs(90));
	assert_eq!(cfg.scheduler.rate_per_sec, 2.0);
	assert_eq!(cfg.transport.keepalive_grace, 2.5);
}

#[test]
fn env_bool_parsing() {
	assert_eq!(parse_env_bool("YES"), Some(true));
	assert_eq!(parse_env_bool(" 0 "), Some(false));
	assert_eq!(parse_env_bool("maybe"), None);
}
