#![forbid(unsafe_code)]

pub mod endpoint {
	use std::net::SocketAddr;

	/// Parsed `ws://host:port` or `wss://host:port` endpoint.
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct WsEndpoint {
		pub secure: bool,
		pub host: String,
		pub port: u16,
	}

	impl WsEndpoint {
		/// Returns `host:port` (host preserved, IPv6 stays bracketed).
		pub fn hostport(&self) -> String {
			format!("{}:{}", self.host, self.port)
		}

		/// Full URL suitable for a WebSocket client.
		pub fn url(&self) -> String {
			let scheme = if self.secure { "wss" } else { "ws" };
			format!("{scheme}://{}", self.hostport())
		}

		/// Convert to `SocketAddr` only if the host is an IP literal.
		pub fn to_socket_addr_if_ip_literal(&self) -> Result<SocketAddr, String> {
			self.hostport()
				.parse()
				.map_err(|_| format!("host must be an IP literal (DNS names not supported here): {}", self.host))
		}

		/// Parse `ws://host:port` or `wss://host:port`. A bare `/` path is tolerated.
		pub fn parse(s: &str) -> Result<Self, String> {
			let s = s.trim();
			if s.is_empty() {
				return Err("endpoint must be non-empty (expected ws://host:port)".to_string());
			}

			let (secure, rest) = if let Some(rest) = s.strip_prefix("ws://") {
				(false, rest)
			} else if let Some(rest) = s.strip_prefix("wss://") {
				(true, rest)
			} else {
				return Err(format!("invalid endpoint (expected ws://host:port): {s}"));
			};
			let rest = rest.strip_suffix('/').unwrap_or(rest);

			if rest.contains('/') || rest.contains('?') || rest.contains('#') {
				return Err(format!(
					"invalid endpoint (expected ws://host:port without path/query/fragment): {s}"
				));
			}

			let (host, port_str) = rest
				.rsplit_once(':')
				.ok_or_else(|| format!("invalid endpoint (missing :port, expected ws://host:port): {s}"))?;

			let host = host.trim();
			if host.is_empty() {
				return Err(format!("invalid endpoint host (expected ws://host:port): {s}"));
			}

			if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
				return Err(format!(
					"invalid endpoint host (IPv6 must be bracketed like ws://[::1]:5001): {s}"
				));
			}

			let port: u16 = port_str
				.trim()
				.parse()
				.map_err(|_| format!("invalid endpoint port (expected 1..=65535): {s}"))?;

			if port == 0 {
				return Err(format!("invalid endpoint port (expected 1..=65535): {s}"));
			}

			Ok(Self {
				secure,
				host: host.to_string(),
				port,
			})
		}
	}

	/// Listener address: plain `ws://` with an IP literal host.
	pub fn parse_bind_endpoint(s: &str) -> Result<SocketAddr, String> {
		let e = WsEndpoint::parse(s)?;
		if e.secure {
			return Err(format!("bind endpoint must use ws:// (terminate TLS in front): {s}"));
		}
		e.to_socket_addr_if_ip_literal()
	}

}
