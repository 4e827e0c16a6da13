#![forbid(unsafe_code)]

pub mod endpoint {
	use std::fmt;
	use std::net::SocketAddr;
	use std::path::PathBuf;

	/// Local IPC endpoint: a Unix socket path or a loopback TCP `host:port`.
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub enum IpcEndpoint {
		Unix(PathBuf),
		Tcp { host: String, port: u16 },
	}

	impl IpcEndpoint {
		/// Parse `unix:///abs/path`, a bare absolute path, or `tcp://host:port`.
		pub fn parse(s: &str) -> Result<Self, String> {
			let s = s.trim();
			if s.is_empty() {
				return Err("endpoint must be non-empty (expected unix:///path or tcp://host:port)".to_string());
			}

			if let Some(path) = s.strip_prefix("unix://") {
				return Self::parse_unix_path(path, s);
			}

			if s.starts_with('/') {
				return Self::parse_unix_path(s, s);
			}

			if let Some(rest) = s.strip_prefix("tcp://") {
				return Self::parse_tcp(rest, s);
			}

			Err(format!("invalid endpoint (expected unix:///path or tcp://host:port): {s}"))
		}

		fn parse_unix_path(path: &str, original: &str) -> Result<Self, String> {
			if !path.starts_with('/') {
				return Err(format!("unix socket path must be absolute: {original}"));
			}
			if path.ends_with('/') {
				return Err(format!("unix socket path must name a file: {original}"));
			}
			Ok(Self::Unix(PathBuf::from(path)))
		}

		fn parse_tcp(rest: &str, original: &str) -> Result<Self, String> {
			if rest.contains('/') || rest.contains('?') || rest.contains('#') {
				return Err(format!(
					"invalid endpoint (expected tcp://host:port without path/query/fragment): {original}"
				));
			}

			let (host, port_str) = rest
				.rsplit_once(':')
				.ok_or_else(|| format!("invalid endpoint (missing :port, expected tcp://host:port): {original}"))?;

			let host = host.trim();
			if host.is_empty() {
				return Err(format!("invalid endpoint host (expected tcp://host:port): {original}"));
			}

			if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
				return Err(format!(
					"invalid endpoint host (IPv6 must be bracketed like tcp://[::1]:7450): {original}"
				));
			}

			let port: u16 = port_str
				.trim()
				.parse()
				.map_err(|_| format!("invalid endpoint port (expected 1..=65535): {original}"))?;

			if port == 0 {
				return Err(format!("invalid endpoint port (expected 1..=65535): {original}"));
			}

			Ok(Self::Tcp {
				host: host.to_string(),
				port,
			})
		}

		/// Returns `host:port` for TCP endpoints.
		pub fn hostport(&self) -> Option<String> {
			match self {
				Self::Tcp { host, port } => Some(format!("{host}:{port}")),
				Self::Unix(_) => None,
			}
		}

		/// Convert a TCP endpoint to `SocketAddr` only if the host is an IP literal.
		pub fn to_socket_addr_if_ip_literal(&self) -> Result<SocketAddr, String> {
			match self {
				Self::Tcp { host, .. } => self
					.hostport()
					.unwrap_or_default()
					.parse()
					.map_err(|_| format!("host must be an IP literal (DNS names not supported here): {host}")),
				Self::Unix(path) => Err(format!("not a tcp endpoint: {}", path.display())),
			}
		}
	}

	impl fmt::Display for IpcEndpoint {
		fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
			match self {
				Self::Unix(path) => write!(f, "unix://{}", path.display()),
				Self::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
			}
		}
	}

}

pub mod time {
	use std::time::{Duration, SystemTime, UNIX_EPOCH};

	/// Current Unix time in seconds.
	#[inline]
	pub fn unix_secs_now() -> i64 {
		SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.unwrap_or(Duration::from_secs(0))
			.as_secs() as i64
	}

	/// Current Unix time in milliseconds.
	#[inline]
	pub fn unix_ms_now() -> i64 {
		SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.unwrap_or(Duration::from_secs(0))
			.as_millis() as i64
	}
}
