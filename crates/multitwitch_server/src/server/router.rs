#![forbid(unsafe_code)]

use multitwitch_platform::{ConnectionPool, PoolEvent};
use multitwitch_protocol::ServerEvent;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::server::history::RecentHistory;
use crate::server::room_hub::ChannelHub;

/// Settings for the ingest router.
#[derive(Debug, Clone)]
pub struct RouterConfig {
	pub debug_log_events: bool,

	pub log_upstream_lag: bool,
}

impl Default for RouterConfig {
	fn default() -> Self {
		Self {
			debug_log_events: false,
			log_upstream_lag: true,
		}
	}
}

/// Single consumer of the pool broadcast. Records messages in the history buffer
/// and republishes everything into the channel hub in arrival order.
#[derive(Debug)]
pub struct IngestRouter {
	cfg: RouterConfig,
	hub: ChannelHub,
	history: RecentHistory,
	events_rx: broadcast::Receiver<PoolEvent>,
}

impl IngestRouter {
	pub fn new(
		events_rx: broadcast::Receiver<PoolEvent>,
		hub: ChannelHub,
		history: RecentHistory,
		cfg: RouterConfig,
	) -> Self {
		Self {
			cfg,
			hub,
			history,
			events_rx,
		}
	}

	pub fn from_pool(pool: &ConnectionPool, hub: ChannelHub, history: RecentHistory, cfg: RouterConfig) -> Self {
		Self::new(pool.subscribe(), hub, history, cfg)
	}

	/// Run the routing loop until the pool broadcast closes.
	pub async fn run(mut self) {
		info!("ingest router started");

		loop {
			let event = match self.events_rx.recv().await {
				Ok(ev) => ev,
				Err(broadcast::error::RecvError::Lagged(n)) => {
					if self.cfg.log_upstream_lag {
						warn!(
							lagged = n,
							"ingest router lagged on pool broadcast; some chat messages were dropped before routing"
						);
					}
					continue;
				}
				Err(broadcast::error::RecvError::Closed) => {
					info!("ingest router exiting (pool broadcast closed)");
					break;
				}
			};

			route_one(&self.hub, &self.history, event, self.cfg.debug_log_events).await;
		}
	}
}

/// Route a single pool event.
pub async fn route_one(hub: &ChannelHub, history: &RecentHistory, event: PoolEvent, debug_log_events: bool) {
	match event {
		PoolEvent::Message(msg) => {
			if debug_log_events {
				debug!(channel = %msg.channel, id = %msg.id, user = %msg.login, "routing chat message");
			}
			history.push(msg.clone());
			let channel = msg.channel.clone();
			hub.publish(&channel, ServerEvent::ChatMessage(msg)).await;
		}
		PoolEvent::ConnectionLost { detail, channels } => {
			for channel in channels {
				hub.publish(
					&channel,
					ServerEvent::error(channel.as_str(), format!("Lost connection to {channel} chat: {detail}")),
				)
				.await;
			}
		}
		PoolEvent::Connected { rejoined } => {
			debug!(rejoining = rejoined.len(), "chat connection up");
		}
		PoolEvent::Rejoined { channel } => {
			hub.publish(&channel, ServerEvent::connected(&channel)).await;
		}
		// Subscribers are told by the lifecycle manager once their wants are dropped.
		PoolEvent::ChannelLost { channel, reason } => {
			debug!(channel = %channel, reason, "pool lost channel");
		}
	}
}

/// Spawn the routing task.
pub fn spawn_ingest_router(
	pool: &ConnectionPool,
	hub: ChannelHub,
	history: RecentHistory,
	cfg: RouterConfig,
) -> JoinHandle<()> {
	let router = IngestRouter::from_pool(pool, hub, history, cfg);
	tokio::spawn(router.run())
}
