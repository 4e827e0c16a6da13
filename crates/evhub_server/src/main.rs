#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use evhub_provider::eventsub::{self, EventSubConfig};
use evhub_provider::fake::FakeProvider;
use evhub_provider::{SubscriptionApi, Transport};
use evhub_server::Hub;
use evhub_server::config::{HubConfig, ProviderKind, default_config_path, load_config_from_path};
use evhub_server::server::store::open_store;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: evhub_server [--config path] [--socket endpoint]\n\
\n\
Options:\n\
\t--config   Config file (default: ~/.evhub/config.toml)\n\
\t--socket   Consumer socket, overrides server.socket\n\
\t          Format: unix:///path | /path | tcp://host:port\n\
\t--help     Show this help\n\
"
	);
	std::process::exit(2)
}

struct Args {
	config: Option<PathBuf>,
	socket: Option<String>,
}

fn parse_args() -> Args {
	let mut args = Args {
		config: None,
		socket: None,
	};

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				args.config = Some(PathBuf::from(v));
			}
			"--socket" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if let Err(e) = evhub_util::endpoint::IpcEndpoint::parse(&v) {
					eprintln!("{e}");
					usage_and_exit();
				}
				args.socket = Some(v);
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,evhub_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("evhub_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

fn build_provider(cfg: &HubConfig) -> anyhow::Result<(Arc<dyn Transport>, Arc<dyn SubscriptionApi>)> {
	match cfg.provider.kind {
		ProviderKind::Fake => {
			warn!("using the in-process fake provider; no upstream traffic");
			let fake = FakeProvider::new();
			Ok((Arc::new(fake.clone()), Arc::new(fake)))
		}
		ProviderKind::EventSub => {
			let (Some(client_id), Some(token)) = (cfg.provider.client_id.clone(), cfg.provider.access_token.clone())
			else {
				anyhow::bail!("eventsub provider requires provider.client_id and provider.access_token");
			};

			let mut es = EventSubConfig::new(client_id, token);
			if let Some(url) = cfg.provider.ws_url.clone() {
				es.ws_url = url;
			}
			if let Some(url) = cfg.provider.api_base_url.clone() {
				es.api_base_url = url;
			}
			es.condition_key = cfg.provider.condition_key.clone();
			es.topic_versions = cfg.provider.topic_versions.clone();
			info!(ws_url = %es.ws_url, api = %es.api_base_url, "eventsub provider configured");

			let (transport, api) = eventsub::build(es)?;
			Ok((Arc::new(transport), Arc::new(api)))
		}
	}
}

async fn wait_for_signal() {
	#[cfg(unix)]
	{
		use tokio::signal::unix::{SignalKind, signal};
		match signal(SignalKind::terminate()) {
			Ok(mut term) => {
				tokio::select! {
					_ = tokio::signal::ctrl_c() => info!("received ctrl-c"),
					_ = term.recv() => info!("received SIGTERM"),
				}
				return;
			}
			Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
		}
	}

	if let Err(e) = tokio::signal::ctrl_c().await {
		warn!(error = %e, "failed to wait for ctrl-c");
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let args = parse_args();

	let config_path = match args.config {
		Some(p) => p,
		None => default_config_path()?,
	};
	let mut cfg = load_config_from_path(&config_path)?;
	if let Some(socket) = args.socket {
		cfg.server.socket = socket;
	}
	info!(path = %config_path.display(), "loaded hub config (toml + env overrides)");

	init_metrics(cfg.server.metrics_bind.as_deref());

	let (transport, api) = build_provider(&cfg)?;
	let store = open_store(&cfg.persistence).await.context("open store")?;

	let hub = Hub::start(cfg, store, transport, api).await?;
	info!(endpoint = %hub.endpoint(), "evhub_server ready");

	wait_for_signal().await;
	hub.shutdown().await
}
