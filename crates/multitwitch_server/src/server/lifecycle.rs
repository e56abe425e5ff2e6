#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use multitwitch_domain::{ChannelName, ChatStatusKind, SessionId};
use multitwitch_platform::{ConnectionPool, PoolError, PoolEvent};
use multitwitch_protocol::{ClientEvent, ServerEvent};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::server::history::RecentHistory;
use crate::server::room_hub::ChannelHub;
use crate::server::state::{StateError, SubscriptionState, UnwantOutcome, WantOutcome};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubscribeError {
	#[error("invalid channel name: {0}")]
	InvalidChannel(String),

	#[error("unknown subscriber")]
	UnknownSubscriber,

	#[error("subscriber is disconnecting")]
	SubscriberClosed,

	#[error(transparent)]
	Pool(#[from] PoolError),
}

impl From<StateError> for SubscribeError {
	fn from(e: StateError) -> Self {
		match e {
			StateError::UnknownSubscriber => SubscribeError::UnknownSubscriber,
			StateError::SubscriberClosed => SubscribeError::SubscriberClosed,
		}
	}
}

impl SubscribeError {
	/// Status a client sees for this failure.
	pub fn status_kind(&self) -> ChatStatusKind {
		match self {
			SubscribeError::InvalidChannel(_)
			| SubscribeError::Pool(PoolError::JoinTimeout(_))
			| SubscribeError::Pool(PoolError::LeaveTimeout(_))
			| SubscribeError::Pool(PoolError::JoinRejected { .. })
			| SubscribeError::Pool(PoolError::Busy(_)) => ChatStatusKind::Failed,
			SubscribeError::UnknownSubscriber
			| SubscribeError::SubscriberClosed
			| SubscribeError::Pool(PoolError::Connection(_))
			| SubscribeError::Pool(PoolError::Shutdown) => ChatStatusKind::Error,
		}
	}
}

type ChannelLocks = HashMap<ChannelName, Arc<tokio::sync::Mutex<()>>>;

/// Keeps the pool's joined set in line with what subscribers want.
///
/// Refcount bookkeeping happens under one synchronous lock. Each channel also has an
/// async lock held across the pool call, so the 0→1 / 1→0 decision and the
/// matching JOIN/PART never interleave with another operation on that channel.
/// Different channels proceed concurrently.
#[derive(Clone)]
pub struct SubscriptionManager {
	pool: ConnectionPool,
	hub: ChannelHub,
	history: RecentHistory,
	state: Arc<Mutex<SubscriptionState>>,
	channel_locks: Arc<Mutex<ChannelLocks>>,
}

impl SubscriptionManager {
	pub fn new(pool: ConnectionPool, hub: ChannelHub, history: RecentHistory) -> Self {
		Self {
			pool,
			hub,
			history,
			state: Arc::new(Mutex::new(SubscriptionState::default())),
			channel_locks: Arc::new(Mutex::new(HashMap::new())),
		}
	}

	/// Create the subscriber record and its outbound queue.
	pub async fn register_subscriber(&self, session: SessionId) -> mpsc::Receiver<ServerEvent> {
		let fresh = self.state.lock().register(session);
		if !fresh {
			warn!(session_id = %session, "subscriber registered twice");
		}
		self.hub.register_session(session).await
	}

	/// Start delivering `channel` to `session`, joining it on the pool on the 0→1
	/// transition. On success the session is queued a `connected` status followed by
	/// the channel's recent history. On failure nothing changes, so a retry joins again.
	pub async fn subscribe(&self, session: SessionId, channel: &ChannelName) -> Result<(), SubscribeError> {
		let lock = self.channel_lock(channel);
		let result = {
			let _guard = lock.lock().await;
			self.subscribe_locked(session, channel).await
		};
		self.release_channel_lock(channel, lock);
		result
	}

	async fn subscribe_locked(&self, session: SessionId, channel: &ChannelName) -> Result<(), SubscribeError> {
		let outcome = self.state.lock().want(session, channel)?;

		match outcome {
			WantOutcome::AlreadyWanted => {
				debug!(session_id = %session, channel = %channel, "already subscribed");
				self.hub.send_to_session(session, ServerEvent::connected(channel)).await;
				return Ok(());
			}
			WantOutcome::Added { first: true } => {
				if let Err(e) = self.pool.join_channel(channel).await {
					let _ = self.state.lock().unwant(session, channel);
					warn!(session_id = %session, channel = %channel, error = %e, "join failed; subscription rolled back");
					return Err(e.into());
				}
			}
			WantOutcome::Added { first: false } => {}
		}

		let history = self.history.clone();
		let backlog_channel = channel.clone();
		self.hub
			.attach_with(session, channel, move || {
				let mut events = vec![ServerEvent::connected(&backlog_channel)];
				let messages = history.snapshot(&backlog_channel);
				if !messages.is_empty() {
					events.push(ServerEvent::ChatHistory {
						channel: backlog_channel,
						messages,
					});
				}
				events
			})
			.await;

		info!(
			session_id = %session,
			channel = %channel,
			refcount = self.refcount(channel),
			"subscribed"
		);
		Ok(())
	}

	/// Stop delivering `channel` to `session`, leaving it on the pool on the 1→0
	/// transition. The want is gone even when the leave fails; the reconciler retries
	/// the PART later.
	pub async fn unsubscribe(&self, session: SessionId, channel: &ChannelName) -> Result<(), SubscribeError> {
		let lock = self.channel_lock(channel);
		let result = {
			let _guard = lock.lock().await;
			self.unsubscribe_locked(session, channel).await
		};
		self.release_channel_lock(channel, lock);
		result
	}

	async fn unsubscribe_locked(&self, session: SessionId, channel: &ChannelName) -> Result<(), SubscribeError> {
		let outcome = self.state.lock().unwant(session, channel)?;
		self.hub.detach(session, channel).await;

		match outcome {
			UnwantOutcome::NotWanted => Ok(()),
			UnwantOutcome::Removed { last: false } => {
				info!(session_id = %session, channel = %channel, refcount = self.refcount(channel), "unsubscribed");
				Ok(())
			}
			UnwantOutcome::Removed { last: true } => {
				info!(session_id = %session, channel = %channel, "last subscriber left; leaving channel");
				self.history.forget(channel);
				self.pool.leave_channel(channel).await.map_err(|e| {
					warn!(channel = %channel, error = %e, "leave failed; reconciler will retry");
					SubscribeError::from(e)
				})
			}
		}
	}

	/// Release everything `session` wants and drop its record.
	///
	/// New subscribes for the session are refused from the first await on. Each
	/// channel is drained under its channel lock, so an in-flight subscribe for the
	/// same channel settles first and its outcome is what gets released.
	pub async fn disconnect_subscriber(&self, session: SessionId) {
		let closing = self.state.lock().mark_closing(session);
		let Some(wanted) = closing else {
			self.hub.remove_session(session).await;
			return;
		};
		debug!(session_id = %session, channels = wanted.len(), "subscriber disconnecting");

		loop {
			let next = self.state.lock().wanted(session).into_iter().next();
			let Some(channel) = next else {
				break;
			};
			if let Err(e) = self.unsubscribe(session, &channel).await {
				debug!(session_id = %session, channel = %channel, error = %e, "cleanup leave failed");
			}
		}

		let leftover = self.state.lock().remove(session);
		if !leftover.is_empty() {
			warn!(session_id = %session, channels = leftover.len(), "released channels outside drain");
		}
		self.hub.remove_session(session).await;
		info!(session_id = %session, "subscriber disconnected");
	}

	/// Apply one client request and queue the resulting status for the session.
	pub async fn handle_client_event(&self, session: SessionId, event: ClientEvent) {
		match event {
			ClientEvent::JoinChannelChat(raw) => {
				let result = match ChannelName::new(&raw) {
					Ok(channel) => self.subscribe(session, &channel).await,
					Err(e) => Err(SubscribeError::InvalidChannel(e.to_string())),
				};
				if let Err(e) = result {
					self.hub.send_to_session(session, join_failure_event(&raw, &e)).await;
				}
			}
			ClientEvent::LeaveChannelChat(raw) => {
				let event = match ChannelName::new(&raw) {
					Ok(channel) => match self.unsubscribe(session, &channel).await {
						Ok(()) => ServerEvent::disconnected(&channel),
						Err(e) => leave_failure_event(channel.as_str(), &e),
					},
					Err(e) => leave_failure_event(&raw, &SubscribeError::InvalidChannel(e.to_string())),
				};
				self.hub.send_to_session(session, event).await;
			}
		}
	}

	/// Retry pool operations whose earlier attempt failed: leave joined channels
	/// nobody wants and join wanted channels the pool lost. Returns how many
	/// operations succeeded.
	pub async fn reconcile(&self) -> usize {
		let demanded = self.state.lock().demanded_channels();
		let joined: BTreeSet<ChannelName> = self.pool.joined_channels().into_iter().collect();
		let mut applied = 0usize;

		for channel in joined.difference(&demanded) {
			let lock = self.channel_lock(channel);
			{
				let _guard = lock.lock().await;
				if self.refcount(channel) == 0 && self.pool.is_joined(channel) {
					match self.pool.leave_channel(channel).await {
						Ok(()) => {
							info!(channel = %channel, "reconcile: left unwanted channel");
							applied += 1;
						}
						Err(e) => warn!(channel = %channel, error = %e, "reconcile: leave failed"),
					}
				}
			}
			self.release_channel_lock(channel, lock);
		}

		for channel in demanded.difference(&joined) {
			let lock = self.channel_lock(channel);
			{
				let _guard = lock.lock().await;
				if self.refcount(channel) > 0 && !self.pool.is_joined(channel) {
					match self.pool.join_channel(channel).await {
						Ok(()) => {
							info!(channel = %channel, "reconcile: rejoined wanted channel");
							applied += 1;
							self.hub.publish(channel, ServerEvent::connected(channel)).await;
						}
						Err(e @ PoolError::JoinRejected { .. }) => {
							warn!(channel = %channel, error = %e, "reconcile: join rejected; dropping subscriptions");
							self.drop_channel_locked(channel, &e.to_string()).await;
						}
						Err(e) => {
							warn!(channel = %channel, error = %e, "reconcile: join failed");
							self.hub
								.publish(channel, join_failure_event(channel.as_str(), &SubscribeError::Pool(e)))
								.await;
						}
					}
				}
			}
			self.release_channel_lock(channel, lock);
		}

		applied
	}

	/// Run `reconcile` every `interval` until the returned task is aborted.
	pub fn spawn_reconciler(&self, interval: Duration) -> JoinHandle<()> {
		let manager = self.clone();
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(interval);
			ticker.tick().await;
			loop {
				ticker.tick().await;
				let applied = manager.reconcile().await;
				if applied > 0 {
					debug!(applied, "reconcile pass applied changes");
				}
				let (subscribers, demanded) = {
					let state = manager.state.lock();
					(state.subscriber_count(), state.demanded_channels().len())
				};
				metrics::gauge!("multitwitch_subscribers").set(subscribers as f64);
				metrics::gauge!("multitwitch_demanded_channels").set(demanded as f64);
			}
		})
	}

	/// A channel the pool dropped on its own is unreachable for every subscriber:
	/// they get a `failed` status and lose the want, so refcounts match the pool again.
	pub async fn on_channel_lost(&self, channel: &ChannelName, reason: &str) {
		let lock = self.channel_lock(channel);
		{
			let _guard = lock.lock().await;
			if self.pool.is_joined(channel) {
				debug!(channel = %channel, "lost channel already joined again");
			} else {
				self.drop_channel_locked(channel, reason).await;
			}
		}
		self.release_channel_lock(channel, lock);
	}

	async fn drop_channel_locked(&self, channel: &ChannelName, reason: &str) {
		let sessions = self.state.lock().drop_channel(channel);
		if sessions.is_empty() {
			return;
		}
		warn!(channel = %channel, reason, subscribers = sessions.len(), "channel lost; dropping subscriptions");
		self.hub
			.publish(
				channel,
				ServerEvent::status(channel.as_str(), ChatStatusKind::Failed, format!("Lost {channel} chat: {reason}")),
			)
			.await;
		for session in sessions {
			self.hub.detach(session, channel).await;
		}
		self.history.forget(channel);
	}

	/// Follow pool events and release channels the pool gives up on.
	pub fn spawn_pool_watcher(&self) -> JoinHandle<()> {
		let manager = self.clone();
		let mut events = self.pool.subscribe();
		tokio::spawn(async move {
			loop {
				match events.recv().await {
					Ok(PoolEvent::ChannelLost { channel, reason }) => manager.on_channel_lost(&channel, &reason).await,
					Ok(_) => {}
					Err(broadcast::error::RecvError::Lagged(n)) => {
						// The reconciler notices anything missed here on its next pass.
						warn!(lagged = n, "pool watcher lagged");
					}
					Err(broadcast::error::RecvError::Closed) => {
						debug!("pool watcher exiting");
						break;
					}
				}
			}
		})
	}

	/// Queue an event for one session outside any channel.
	pub async fn notify(&self, session: SessionId, event: ServerEvent) -> bool {
		self.hub.send_to_session(session, event).await
	}

	pub fn refcount(&self, channel: &ChannelName) -> u64 {
		self.state.lock().refcount(channel)
	}

	#[cfg(test)]
	pub fn wanted_channels(&self, session: SessionId) -> Vec<ChannelName> {
		self.state.lock().wanted(session)
	}

	pub fn is_registered(&self, session: SessionId) -> bool {
		self.state.lock().is_registered(session)
	}

	pub fn subscriber_count(&self) -> usize {
		self.state.lock().subscriber_count()
	}

	fn channel_lock(&self, channel: &ChannelName) -> Arc<tokio::sync::Mutex<()>> {
		self.channel_locks.lock().entry(channel.clone()).or_default().clone()
	}

	fn release_channel_lock(&self, channel: &ChannelName, lock: Arc<tokio::sync::Mutex<()>>) {
		let mut locks = self.channel_locks.lock();
		drop(lock);
		if locks.get(channel).is_some_and(|l| Arc::strong_count(l) == 1) {
			locks.remove(channel);
		}
	}
}

fn join_failure_event(channel: &str, err: &SubscribeError) -> ServerEvent {
	match err.status_kind() {
		ChatStatusKind::Failed => ServerEvent::failed(channel, err),
		_ => ServerEvent::error(channel, format!("Chat connection problem for {channel}: {err}")),
	}
}

fn leave_failure_event(channel: &str, err: &SubscribeError) -> ServerEvent {
	match err.status_kind() {
		ChatStatusKind::Failed => {
			ServerEvent::status(channel, ChatStatusKind::Failed, format!("Failed to leave {channel} chat: {err}"))
		}
		_ => ServerEvent::error(channel, format!("Chat connection problem for {channel}: {err}")),
	}
}
