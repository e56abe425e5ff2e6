#![forbid(unsafe_code)]

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, warn};
use url::Url;

/// Line capacity of each direction of an `IrcLink`.
pub const LINK_CAPACITY: usize = 1024;

/// One open line-oriented connection to the chat network.
///
/// `outbound` takes lines without CR-LF. `inbound` yields one IRC line per item and
/// ends when the remote side goes away.
#[derive(Debug)]
pub struct IrcLink {
	pub outbound: mpsc::Sender<String>,
	pub inbound: mpsc::Receiver<String>,
}

impl IrcLink {
	/// Create a linked pair: the returned `IrcLink` for the client and the raw
	/// halves for whoever plays the remote side.
	pub fn pair(capacity: usize) -> (IrcLink, mpsc::Receiver<String>, mpsc::Sender<String>) {
		let (outbound, remote_rx) = mpsc::channel(capacity);
		let (remote_tx, inbound) = mpsc::channel(capacity);
		(IrcLink { outbound, inbound }, remote_rx, remote_tx)
	}
}

/// Opens transport connections for the pool.
#[async_trait::async_trait]
pub trait IrcConnector: Send + Sync + 'static {
	/// Open a fresh connection. The IRC handshake is the caller's job.
	async fn connect(&self) -> anyhow::Result<IrcLink>;

	/// Human readable endpoint for logs.
	fn describe(&self) -> String;
}

/// IRC over WebSocket, one text frame per batch of CR-LF separated lines.
#[derive(Debug, Clone)]
pub struct WsIrcConnector {
	url: Url,
}

impl WsIrcConnector {
	pub fn new(url: Url) -> Self {
		Self { url }
	}

	pub fn parse(url: &str) -> anyhow::Result<Self> {
		let url = Url::parse(url).with_context(|| format!("invalid chat ws url: {url}"))?;
		match url.scheme() {
			"ws" | "wss" => Ok(Self::new(url)),
			other => anyhow::bail!("unsupported chat url scheme: {other}"),
		}
	}
}

#[async_trait::async_trait]
impl IrcConnector for WsIrcConnector {
	async fn connect(&self) -> anyhow::Result<IrcLink> {
		let (ws, _resp) = tokio_tungstenite::connect_async(self.url.as_str())
			.await
			.with_context(|| format!("connect_async to {}", self.url))?;

		let (link, mut outbound_rx, inbound_tx) = IrcLink::pair(LINK_CAPACITY);
		let (mut ws_tx, mut ws_rx) = ws.split();
		let endpoint = self.url.to_string();

		tokio::spawn(async move {
			loop {
				tokio::select! {
					line = outbound_rx.recv() => {
						let Some(line) = line else {
							let _ = ws_tx.send(Message::Close(None)).await;
							break;
						};
						if let Err(e) = ws_tx.send(Message::Text(line.into())).await {
							warn!(endpoint = %endpoint, error = %e, "chat ws send failed");
							break;
						}
					}
					frame = ws_rx.next() => {
						match frame {
							Some(Ok(Message::Text(text))) => {
								for line in text.as_str().split("\r\n").filter(|l| !l.is_empty()) {
									if inbound_tx.send(line.to_string()).await.is_err() {
										return;
									}
								}
							}
							Some(Ok(Message::Ping(payload))) => {
								let _ = ws_tx.send(Message::Pong(payload)).await;
							}
							Some(Ok(Message::Close(frame))) => {
								debug!(endpoint = %endpoint, ?frame, "chat ws closed by remote");
								break;
							}
							Some(Ok(_)) => {}
							Some(Err(e)) => {
								warn!(endpoint = %endpoint, error = %e, "chat ws read failed");
								break;
							}
							None => break,
						}
					}
				}
			}
		});

		Ok(link)
	}

	fn describe(&self) -> String {
		self.url.to_string()
	}
}
