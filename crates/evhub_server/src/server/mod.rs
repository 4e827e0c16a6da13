#![forbid(unsafe_code)]

pub mod connection;
pub mod fanout;
pub mod health;
pub mod hub;
pub mod hub_state;
pub mod listener;
pub mod reconcile;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod transport;

use tokio::sync::watch;

/// Resolves once the flag is set. The borrow guard is dropped before returning, so the
/// future stays `Send` inside `select!`.
pub(crate) async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
	let _ = rx.wait_for(|v| *v).await;
}
