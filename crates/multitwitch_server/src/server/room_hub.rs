#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use multitwitch_domain::{ChannelName, SessionId};
use multitwitch_protocol::ServerEvent;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

/// Per-channel fan-out of server events to browser sessions.
///
/// Every session owns one bounded queue. Publishing never waits on a queue: a full
/// queue drops the event and the session later receives a `chat-lagged` marker with
/// the number of events it missed.
#[derive(Debug, Clone)]
pub struct ChannelHub {
	inner: Arc<Mutex<Inner>>,
	cfg: ChannelHubConfig,
}

#[derive(Debug, Clone)]
pub struct ChannelHubConfig {
	/// Maximum number of queued events per session.
	pub subscriber_queue_capacity: usize,

	pub debug_logs: bool,
}

impl Default for ChannelHubConfig {
	fn default() -> Self {
		Self {
			subscriber_queue_capacity: 1024,
			debug_logs: false,
		}
	}
}

#[derive(Debug, Default)]
struct Inner {
	sessions: HashMap<SessionId, SessionSlot>,
	channels: HashMap<ChannelName, BTreeSet<SessionId>>,
}

#[derive(Debug)]
struct SessionSlot {
	tx: mpsc::Sender<ServerEvent>,

	/// Events dropped since the last lag marker went out.
	pending_lag: u64,
}

enum Delivery {
	Sent,
	Dropped,
	Closed,
}

impl SessionSlot {
	fn deliver(&mut self, event: ServerEvent) -> Delivery {
		match self.tx.try_send(event) {
			Ok(()) => {
				if self.pending_lag > 0
					&& self
						.tx
						.try_send(ServerEvent::ChatLagged {
							dropped: self.pending_lag,
						})
						.is_ok()
				{
					self.pending_lag = 0;
				}
				Delivery::Sent
			}
			Err(mpsc::error::TrySendError::Full(_)) => {
				self.pending_lag = self.pending_lag.saturating_add(1);
				Delivery::Dropped
			}
			Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
		}
	}
}

impl ChannelHub {
	pub fn new(cfg: ChannelHubConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			cfg,
		}
	}

	/// Create the outbound queue for a session. Re-registering replaces the old queue.
	pub async fn register_session(&self, session: SessionId) -> mpsc::Receiver<ServerEvent> {
		let (tx, rx) = mpsc::channel(self.cfg.subscriber_queue_capacity.max(1));
		let mut inner = self.inner.lock().await;
		inner.sessions.insert(session, SessionSlot { tx, pending_lag: 0 });
		if self.cfg.debug_logs {
			debug!(session_id = %session, sessions = inner.sessions.len(), "channel hub: session registered");
		}
		rx
	}

	/// Forget a session and all of its channel memberships.
	pub async fn remove_session(&self, session: SessionId) {
		let mut inner = self.inner.lock().await;
		inner.remove_session(session);
	}

	/// Start delivering `channel` to `session`.
	///
	/// `backlog` runs under the hub lock and its events are queued before any event
	/// published after the attach, so a history snapshot taken there cannot miss a
	/// message (it may repeat one; clients dedupe by id).
	pub async fn attach_with<F>(&self, session: SessionId, channel: &ChannelName, backlog: F) -> bool
	where
		F: FnOnce() -> Vec<ServerEvent>,
	{
		let mut inner = self.inner.lock().await;
		let Some(slot) = inner.sessions.get_mut(&session) else {
			return false;
		};

		for event in backlog() {
			if let Delivery::Closed = slot.deliver(event) {
				inner.remove_session(session);
				return false;
			}
		}

		inner.channels.entry(channel.clone()).or_default().insert(session);
		if self.cfg.debug_logs {
			debug!(session_id = %session, channel = %channel, "channel hub: attached");
		}
		true
	}

	#[cfg(test)]
	pub async fn attach(&self, session: SessionId, channel: &ChannelName) -> bool {
		self.attach_with(session, channel, Vec::new).await
	}

	/// Stop delivering `channel` to `session`.
	pub async fn detach(&self, session: SessionId, channel: &ChannelName) {
		let mut inner = self.inner.lock().await;
		if let Some(members) = inner.channels.get_mut(channel) {
			members.remove(&session);
			if members.is_empty() {
				inner.channels.remove(channel);
			}
		}
	}

	/// Deliver `event` to every session attached to `channel`. Returns how many
	/// sessions accepted it.
	pub async fn publish(&self, channel: &ChannelName, event: ServerEvent) -> usize {
		let mut inner = self.inner.lock().await;
		let Some(members) = inner.channels.get(channel) else {
			return 0;
		};
		let members: Vec<SessionId> = members.iter().copied().collect();

		let mut delivered = 0usize;
		let mut dropped = 0u64;
		let mut closed = Vec::new();

		for session in members {
			let Some(slot) = inner.sessions.get_mut(&session) else {
				closed.push(session);
				continue;
			};
			match slot.deliver(event.clone()) {
				Delivery::Sent => delivered += 1,
				Delivery::Dropped => dropped += 1,
				Delivery::Closed => closed.push(session),
			}
		}

		for session in closed {
			inner.remove_session(session);
		}

		if dropped > 0 {
			metrics::counter!("multitwitch_hub_dropped_total").increment(dropped);
			if self.cfg.debug_logs {
				debug!(
					channel = %channel,
					dropped,
					"channel hub: dropped due to full session queues"
				);
			}
		}

		delivered
	}

	/// Queue an event for one session regardless of channel membership.
	pub async fn send_to_session(&self, session: SessionId, event: ServerEvent) -> bool {
		let mut inner = self.inner.lock().await;
		let Some(slot) = inner.sessions.get_mut(&session) else {
			return false;
		};
		match slot.deliver(event) {
			Delivery::Sent => true,
			Delivery::Dropped => {
				metrics::counter!("multitwitch_hub_dropped_total").increment(1);
				false
			}
			Delivery::Closed => {
				inner.remove_session(session);
				false
			}
		}
	}

	#[cfg(test)]
	pub async fn is_attached(&self, session: SessionId, channel: &ChannelName) -> bool {
		let inner = self.inner.lock().await;
		inner.channels.get(channel).is_some_and(|m| m.contains(&session))
	}

	/// Snapshot of attached session counts per channel.
	#[cfg(test)]
	pub async fn channel_subscriber_counts(&self) -> HashMap<ChannelName, usize> {
		let inner = self.inner.lock().await;
		inner.channels.iter().map(|(k, v)| (k.clone(), v.len())).collect()
	}

	#[cfg(test)]
	pub async fn session_count(&self) -> usize {
		self.inner.lock().await.sessions.len()
	}
}

impl Inner {
	fn remove_session(&mut self, session: SessionId) {
		self.sessions.remove(&session);
		self.channels.retain(|_, members| {
			members.remove(&session);
			!members.is_empty()
		});
	}
}
