#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context as _, bail};
use evhub_protocol::{ErrorCode, HubMessage, encode_line};
use evhub_util::endpoint::IpcEndpoint;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::server::connection::{ConnectionContext, handle_connection};
use crate::server::wait_shutdown;

/// The consumer-facing socket.
pub enum IpcListener {
	#[cfg(unix)]
	Unix {
		listener: UnixListener,
		path: std::path::PathBuf,
	},
	Tcp {
		listener: TcpListener,
		host: String,
	},
}

enum Accepted {
	#[cfg(unix)]
	Unix(UnixStream),
	Tcp(TcpStream),
}

impl IpcListener {
	/// Bind the endpoint. A leftover unix socket file is replaced unless another hub still
	/// answers on it.
	pub async fn bind(endpoint: &IpcEndpoint) -> anyhow::Result<Self> {
		match endpoint {
			#[cfg(unix)]
			IpcEndpoint::Unix(path) => {
				if path.exists() {
					if UnixStream::connect(path).await.is_ok() {
						bail!("another hub is already listening on {}", path.display());
					}
					std::fs::remove_file(path)
						.with_context(|| format!("remove stale socket {}", path.display()))?;
					debug!(path = %path.display(), "ipc: removed stale socket file");
				}
				if let Some(parent) = path.parent() {
					std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
				}
				let listener =
					UnixListener::bind(path).with_context(|| format!("bind unix socket {}", path.display()))?;
				Ok(Self::Unix {
					listener,
					path: path.clone(),
				})
			}
			#[cfg(not(unix))]
			IpcEndpoint::Unix(path) => bail!("unix sockets are not supported here: {}", path.display()),
			IpcEndpoint::Tcp { host, .. } => {
				let hostport = endpoint.hostport().unwrap_or_default();
				let listener = TcpListener::bind(&hostport)
					.await
					.with_context(|| format!("bind tcp {hostport}"))?;
				Ok(Self::Tcp {
					listener,
					host: host.clone(),
				})
			}
		}
	}

	/// The endpoint consumers should dial (the real port for `tcp://...:0`-style binds).
	pub fn local_endpoint(&self) -> anyhow::Result<IpcEndpoint> {
		match self {
			#[cfg(unix)]
			Self::Unix { path, .. } => Ok(IpcEndpoint::Unix(path.clone())),
			Self::Tcp { listener, host } => Ok(IpcEndpoint::Tcp {
				host: host.clone(),
				port: listener.local_addr().context("tcp local addr")?.port(),
			}),
		}
	}

	async fn accept(&self) -> std::io::Result<Accepted> {
		match self {
			#[cfg(unix)]
			Self::Unix { listener, .. } => listener.accept().await.map(|(s, _)| Accepted::Unix(s)),
			Self::Tcp { listener, .. } => {
				let (s, _) = listener.accept().await?;
				let _ = s.set_nodelay(true);
				Ok(Accepted::Tcp(s))
			}
		}
	}

	fn cleanup(&self) {
		#[cfg(unix)]
		if let Self::Unix { path, .. } = self
			&& let Err(e) = std::fs::remove_file(path)
		{
			debug!(path = %path.display(), error = %e, "ipc: socket file cleanup failed");
		}
	}
}

/// Accept consumers until shutdown, then wait for open sessions to wind down.
///
/// While `draining` is set new connections get a single `draining` error and are closed;
/// existing sessions are untouched.
pub async fn serve(
	listener: IpcListener,
	ctx: Arc<ConnectionContext>,
	draining: Arc<AtomicBool>,
	mut shutdown_rx: watch::Receiver<bool>,
) {
	let mut sessions = JoinSet::new();
	let mut next_id: u64 = 1;
	let session_rx = shutdown_rx.clone();

	if let Ok(ep) = listener.local_endpoint() {
		info!(endpoint = %ep, "ipc: listening");
	}

	loop {
		tokio::select! {
			_ = wait_shutdown(&mut shutdown_rx) => break,

			Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
				match joined {
					Ok(Ok(())) => {}
					Ok(Err(e)) => debug!(error = %e, "ipc: session ended with error"),
					Err(e) => warn!(error = %e, "ipc: session task failed"),
				}
			}

			accepted = listener.accept() => {
				let stream = match accepted {
					Ok(s) => s,
					Err(e) => {
						warn!(error = %e, "ipc: accept failed");
						tokio::time::sleep(Duration::from_millis(50)).await;
						continue;
					}
				};

				if draining.load(Ordering::Relaxed) {
					metrics::counter!("evhub_ipc_rejected_total", "reason" => "draining").increment(1);
					let max = ctx.settings.max_frame_bytes;
					tokio::spawn(async move {
						match stream {
							#[cfg(unix)]
							Accepted::Unix(s) => reject_draining(s, max).await,
							Accepted::Tcp(s) => reject_draining(s, max).await,
						}
					});
					continue;
				}

				let session_id = next_id;
				next_id += 1;
				let ctx = ctx.clone();
				let rx = session_rx.clone();
				sessions.spawn(async move {
					match stream {
						#[cfg(unix)]
						Accepted::Unix(s) => handle_connection(session_id, s, ctx, rx).await,
						Accepted::Tcp(s) => handle_connection(session_id, s, ctx, rx).await,
					}
				});
			}
		}
	}

	// stop accepting before waiting on the sessions
	listener.cleanup();
	drop(listener);

	let open = sessions.len();
	if open > 0 {
		debug!(open, "ipc: waiting for sessions to close");
	}
	if tokio::time::timeout(Duration::from_secs(10), async {
		while sessions.join_next().await.is_some() {}
	})
	.await
	.is_err()
	{
		warn!("ipc: sessions did not close in time; aborting");
		sessions.abort_all();
	}
	info!("ipc: listener stopped");
}

async fn reject_draining<S: AsyncWrite + Unpin>(mut stream: S, max_frame_bytes: usize) {
	let msg = HubMessage::error("connect", None, ErrorCode::Draining, "hub is draining; try again later");
	if let Ok(line) = encode_line(&msg, max_frame_bytes) {
		let _ = stream.write_all(&line).await;
	}
	let _ = stream.shutdown().await;
}
