#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use evhub_domain::HubState;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::server::wait_shutdown;

/// Ready means the upstream connection is up and the hub is not draining.
#[derive(Clone)]
pub struct HealthState {
	hub: watch::Receiver<HubState>,
	draining: Arc<AtomicBool>,
}

impl HealthState {
	pub fn new(hub: watch::Receiver<HubState>, draining: Arc<AtomicBool>) -> Self {
		Self { hub, draining }
	}

	pub fn is_ready(&self) -> bool {
		self.hub.borrow().connection.is_connected() && !self.draining.load(Ordering::Relaxed)
	}
}

pub fn spawn_health_server(
	listener: TcpListener,
	state: HealthState,
	shutdown_rx: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
	tokio::spawn(async move {
		if let Err(err) = run_health_server(listener, state, shutdown_rx).await {
			warn!(error = %err, "health server stopped");
		}
	})
}

async fn run_health_server(
	listener: TcpListener,
	state: HealthState,
	mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
	loop {
		let (stream, _addr) = tokio::select! {
			_ = wait_shutdown(&mut shutdown_rx) => break,
			accepted = listener.accept() => accepted?,
		};
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_health(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				debug!(error = %err, "health connection error");
			}
		});
	}
	Ok(())
}

fn respond(status: StatusCode, body: &'static [u8]) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(Bytes::from_static(body)));
	*resp.status_mut() = status;
	resp
}

async fn handle_health(req: Request<Incoming>, state: HealthState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	if req.method() != Method::GET {
		return Ok(respond(StatusCode::METHOD_NOT_ALLOWED, b""));
	}

	Ok(match req.uri().path() {
		"/healthz" => respond(StatusCode::OK, b"ok"),
		"/readyz" if state.is_ready() => respond(StatusCode::OK, b"ready"),
		"/readyz" => respond(StatusCode::SERVICE_UNAVAILABLE, b"not-ready"),
		_ => respond(StatusCode::NOT_FOUND, b""),
	})
}
