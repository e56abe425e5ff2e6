#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use futures::{SinkExt, StreamExt};
use multitwitch_domain::SessionId;
use multitwitch_protocol::{ClientEvent, DEFAULT_MAX_EVENT_SIZE, ServerEvent, decode_event, encode_event};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use crate::server::lifecycle::SubscriptionManager;

/// Client requests buffered per session while an earlier one is still running.
const COMMAND_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	/// Accepted `Origin` values. Empty accepts any.
	pub allowed_origins: Vec<String>,
	pub max_event_bytes: usize,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			allowed_origins: Vec::new(),
			max_event_bytes: DEFAULT_MAX_EVENT_SIZE,
		}
	}
}

impl ConnectionSettings {
	/// Requests without an `Origin` header are not from a browser and pass.
	fn origin_allowed(&self, origin: Option<&str>) -> bool {
		if self.allowed_origins.is_empty() {
			return true;
		}
		match origin {
			Some(origin) => self
				.allowed_origins
				.iter()
				.any(|allowed| allowed == "*" || allowed.eq_ignore_ascii_case(origin.trim_end_matches('/'))),
			None => true,
		}
	}
}

/// Accept sessions until the listener fails.
pub async fn run_accept_loop(
	listener: TcpListener,
	manager: SubscriptionManager,
	settings: Arc<ConnectionSettings>,
) -> anyhow::Result<()> {
	let mut next_conn_id: u64 = 1;

	loop {
		let (stream, peer) = listener.accept().await.context("accept tcp connection")?;

		let conn_id = next_conn_id;
		next_conn_id += 1;

		let manager = manager.clone();
		let settings = Arc::clone(&settings);
		tokio::spawn(async move {
			if let Err(e) = handle_connection(conn_id, stream, peer, manager, settings).await {
				warn!(conn_id, %peer, error = %e, "connection handler exited with error");
			}
		});
	}
}

/// Serve one browser session: WebSocket handshake, then a writer task draining the
/// session's outbound queue, a worker applying join/leave requests in order, and
/// the reader in this task. Socket close or read failure releases every channel
/// the session wanted.
pub async fn handle_connection(
	conn_id: u64,
	stream: TcpStream,
	peer: SocketAddr,
	manager: SubscriptionManager,
	settings: Arc<ConnectionSettings>,
) -> anyhow::Result<()> {
	let origin_settings = Arc::clone(&settings);
	let ws = tokio_tungstenite::accept_hdr_async(stream, move |req: &Request, resp: Response| {
		let origin = req.headers().get("origin").and_then(|v| v.to_str().ok());
		if origin_settings.origin_allowed(origin) {
			Ok(resp)
		} else {
			warn!(conn_id, origin = origin.unwrap_or_default(), "rejected websocket origin");
			let mut err = ErrorResponse::new(Some("origin not allowed".to_string()));
			*err.status_mut() = StatusCode::FORBIDDEN;
			Err(err)
		}
	})
	.await
	.context("websocket handshake")?;

	struct SessionGaugeGuard;
	impl Drop for SessionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("multitwitch_active_sessions").decrement(1.0);
		}
	}

	metrics::gauge!("multitwitch_active_sessions").increment(1.0);
	metrics::counter!("multitwitch_sessions_total").increment(1);
	let _session_guard = SessionGaugeGuard;

	let session = SessionId::new_v4();
	info!(conn_id, %peer, session_id = %session, "session opened");

	let mut outbound = manager.register_subscriber(session).await;
	let (mut ws_tx, mut ws_rx) = ws.split();

	let max_event_bytes = settings.max_event_bytes;
	let writer = tokio::spawn(async move {
		while let Some(event) = outbound.recv().await {
			let text = match encode_event(&event, max_event_bytes) {
				Ok(text) => text,
				Err(e) => {
					warn!(session_id = %session, event = event.name(), error = %e, "dropping unencodable event");
					continue;
				}
			};
			if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
				debug!(session_id = %session, error = %e, "session write failed");
				break;
			}
		}
		let _ = ws_tx.close().await;
	});

	let (cmd_tx, mut cmd_rx) = mpsc::channel::<ClientEvent>(COMMAND_QUEUE_CAPACITY);
	let worker_manager = manager.clone();
	let worker = tokio::spawn(async move {
		while let Some(event) = cmd_rx.recv().await {
			debug!(session_id = %session, event = ?event, "client request");
			worker_manager.handle_client_event(session, event).await;
		}
	});

	while let Some(frame) = ws_rx.next().await {
		match frame {
			Ok(Message::Text(text)) => match decode_event::<ClientEvent>(text.as_str(), max_event_bytes) {
				Ok(event) => {
					if cmd_tx.send(event).await.is_err() {
						break;
					}
				}
				Err(e) => {
					metrics::counter!("multitwitch_malformed_frames_total").increment(1);
					debug!(session_id = %session, error = %e, "malformed client frame");
					manager
						.notify(session, ServerEvent::error("", format!("Malformed event: {e}")))
						.await;
				}
			},
			Ok(Message::Binary(_)) => {
				manager
					.notify(session, ServerEvent::error("", "Binary frames are not supported"))
					.await;
			}
			Ok(Message::Close(frame)) => {
				debug!(session_id = %session, ?frame, "session closed by peer");
				break;
			}
			Ok(_) => {}
			Err(e) => {
				debug!(session_id = %session, error = %e, "session read failed");
				break;
			}
		}
	}

	drop(cmd_tx);
	manager.disconnect_subscriber(session).await;
	let _ = worker.await;
	let _ = writer.await;

	info!(conn_id, session_id = %session, "session closed");
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_allow_list_accepts_everything() {
		let settings = ConnectionSettings::default();
		assert!(settings.origin_allowed(Some("https://evil.example")));
		assert!(settings.origin_allowed(None));
	}

	#[test]
	fn allow_list_matches_exact_origins() {
		let settings = ConnectionSettings {
			allowed_origins: vec!["http://localhost:3000".to_string()],
			..ConnectionSettings::default()
		};
		assert!(settings.origin_allowed(Some("http://localhost:3000")));
		assert!(settings.origin_allowed(Some("HTTP://LOCALHOST:3000/")));
		assert!(!settings.origin_allowed(Some("http://localhost:3001")));
		assert!(settings.origin_allowed(None));
	}
}
