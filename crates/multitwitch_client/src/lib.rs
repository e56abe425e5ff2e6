#![forbid(unsafe_code)]

use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use multitwitch_protocol::{ClientEvent, CodecError, DEFAULT_MAX_EVENT_SIZE, ServerEvent, decode_event, encode_event};
use multitwitch_util::endpoint::WsEndpoint;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

mod dedupe;

pub use dedupe::MessageDeduper;

/// Local dev server endpoint.
pub const DEFAULT_SERVER_ENDPOINT: &str = "ws://127.0.0.1:5001";

/// Message ids remembered for duplicate suppression.
pub const DEFAULT_DEDUPE_CAPACITY: usize = 4096;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct ClientConfig {
	/// Server endpoint in `ws://host:port` or `wss://host:port` form.
	pub endpoint: String,

	/// Largest event accepted or sent.
	pub max_event_bytes: usize,

	/// Timeout for TCP connect plus the WebSocket handshake.
	pub connect_timeout: Duration,

	pub dedupe_capacity: usize,
}

impl Default for ClientConfig {
	fn default() -> Self {
		Self {
			endpoint: DEFAULT_SERVER_ENDPOINT.to_string(),
			max_event_bytes: DEFAULT_MAX_EVENT_SIZE,
			connect_timeout: Duration::from_secs(15),
			dedupe_capacity: DEFAULT_DEDUPE_CAPACITY,
		}
	}
}

impl ClientConfig {
	pub fn from_endpoint(endpoint: impl Into<String>) -> Self {
		Self {
			endpoint: endpoint.into(),
			..Self::default()
		}
	}
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
	#[error("invalid endpoint: {0}")]
	Endpoint(String),

	#[error("failed to connect: {0}")]
	Connect(String),

	#[error(transparent)]
	Codec(#[from] CodecError),

	#[error("io error: {0}")]
	Io(String),
}

/// One WebSocket session against the aggregation server.
pub struct ChatClient {
	sink: SplitSink<WsStream, Message>,
	stream: SplitStream<WsStream>,
	max_event_bytes: usize,
	deduper: MessageDeduper,
}

impl ChatClient {
	/// Connect with default settings.
	pub async fn connect(endpoint: &str) -> Result<Self, ClientError> {
		Self::connect_with(ClientConfig::from_endpoint(endpoint)).await
	}

	pub async fn connect_with(cfg: ClientConfig) -> Result<Self, ClientError> {
		let endpoint = WsEndpoint::parse(&cfg.endpoint).map_err(ClientError::Endpoint)?;
		if endpoint.secure {
			let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
		}
		let url = endpoint.url();

		let (ws, _response) = tokio::time::timeout(cfg.connect_timeout, tokio_tungstenite::connect_async(url.as_str()))
			.await
			.map_err(|_| ClientError::Connect(format!("timeout after {:?} ({url})", cfg.connect_timeout)))?
			.map_err(|e| ClientError::Connect(format!("{url}: {e}")))?;

		info!(server = %url, "connected");

		let (sink, stream) = ws.split();
		Ok(Self {
			sink,
			stream,
			max_event_bytes: cfg.max_event_bytes,
			deduper: MessageDeduper::new(cfg.dedupe_capacity),
		})
	}

	/// Ask the server to start relaying `channel`. The outcome arrives as a `chat-status` event.
	pub async fn join(&mut self, channel: &str) -> Result<(), ClientError> {
		self.send(ClientEvent::JoinChannelChat(channel.to_string())).await
	}

	/// Ask the server to stop relaying `channel`.
	pub async fn leave(&mut self, channel: &str) -> Result<(), ClientError> {
		self.send(ClientEvent::LeaveChannelChat(channel.to_string())).await
	}

	pub async fn send(&mut self, event: ClientEvent) -> Result<(), ClientError> {
		let text = encode_event(&event, self.max_event_bytes)?;
		debug!(event = ?event, "sending client event");
		self.sink
			.send(Message::Text(text.into()))
			.await
			.map_err(|e| ClientError::Io(e.to_string()))
	}

	/// Next server event, or `None` once the server closes the session.
	///
	/// Chat messages already seen (same id) are skipped, including inside
	/// `chat-history` batches.
	pub async fn next_event(&mut self) -> Result<Option<ServerEvent>, ClientError> {
		while let Some(frame) = self.stream.next().await {
			let text = match frame {
				Ok(Message::Text(text)) => text,
				Ok(Message::Close(frame)) => {
					debug!(?frame, "server closed session");
					return Ok(None);
				}
				Ok(Message::Binary(_)) => {
					warn!("ignoring unexpected binary frame");
					continue;
				}
				Ok(_) => continue,
				Err(e) => return Err(ClientError::Io(e.to_string())),
			};

			let event = match decode_event::<ServerEvent>(text.as_str(), self.max_event_bytes) {
				Ok(event) => event,
				Err(e) => {
					warn!(error = %e, "ignoring undecodable server event");
					continue;
				}
			};

			match event {
				ServerEvent::ChatMessage(msg) => {
					if self.deduper.insert(&msg.id) {
						return Ok(Some(ServerEvent::ChatMessage(msg)));
					}
					debug!(id = %msg.id, channel = %msg.channel, "dropping duplicate message");
				}
				ServerEvent::ChatHistory { channel, mut messages } => {
					messages.retain(|m| self.deduper.insert(&m.id));
					return Ok(Some(ServerEvent::ChatHistory { channel, messages }));
				}
				other => return Ok(Some(other)),
			}
		}
		Ok(None)
	}

	pub async fn close(mut self) -> Result<(), ClientError> {
		self.sink.close().await.map_err(|e| ClientError::Io(e.to_string()))
	}
}
