#![forbid(unsafe_code)]

//! Channel connection pool: one shared chat connection and its joined-channel set.
//!
//! An actor task owns every piece of mutable state. `ConnectionPool` is a cheap
//! handle that sends it commands and waits on oneshot replies. Normalized output
//! leaves through a broadcast channel of `PoolEvent`s.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, anyhow};
use multitwitch_domain::ChannelName;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use crate::error::PoolError;
use crate::irc::IrcMessage;
use crate::normalize::normalize_privmsg;
use crate::transport::{IrcConnector, IrcLink};
use crate::{PoolEvent, SecretString, anonymous_nick};

/// NOTICE ids that mean a JOIN will never be acknowledged.
const JOIN_REJECTION_IDS: &[&str] = &[
	"msg_channel_suspended",
	"msg_channel_blocked",
	"msg_banned",
	"msg_room_not_found",
	"msg_requires_verified_phone_number",
	"msg_verified_email",
	"tos_ban",
];

const AUTH_FAILURE_NOTICES: &[&str] = &["Login authentication failed", "Improperly formatted auth"];

/// Retry cadence for JOIN/PART lines the outbound queue had no room for.
const UNSENT_RETRY: Duration = Duration::from_millis(25);

#[derive(Clone)]
pub struct PoolConfig {
	/// Login to use; `None` means an anonymous read-only identity.
	pub nick: Option<String>,
	pub oauth_token: Option<SecretString>,
	/// How long a JOIN/PART may wait for its echo.
	pub ack_timeout: Duration,
	/// Connect plus CAP/PASS/NICK until `001`.
	pub handshake_timeout: Duration,
	pub reconnect_min_delay: Duration,
	pub reconnect_max_delay: Duration,
	/// Own PING cadence; two silent intervals mean the link is dead.
	pub ping_interval: Duration,
	pub command_capacity: usize,
	pub event_capacity: usize,
}

impl Default for PoolConfig {
	fn default() -> Self {
		Self {
			nick: None,
			oauth_token: None,
			ack_timeout: Duration::from_secs(10),
			handshake_timeout: Duration::from_secs(10),
			reconnect_min_delay: Duration::from_millis(500),
			reconnect_max_delay: Duration::from_secs(30),
			ping_interval: Duration::from_secs(60),
			command_capacity: 256,
			event_capacity: 4096,
		}
	}
}

impl std::fmt::Debug for PoolConfig {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PoolConfig")
			.field("nick", &self.nick)
			.field("oauth_token", &self.oauth_token.as_ref().map(|_| "<redacted>"))
			.field("ack_timeout", &self.ack_timeout)
			.field("handshake_timeout", &self.handshake_timeout)
			.field("reconnect_min_delay", &self.reconnect_min_delay)
			.field("reconnect_max_delay", &self.reconnect_max_delay)
			.field("ping_interval", &self.ping_interval)
			.finish()
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
	Disconnected,
	Connecting,
	Connected,
}

impl ConnectionState {
	fn as_gauge(self) -> f64 {
		match self {
			ConnectionState::Disconnected => 0.0,
			ConnectionState::Connecting => 1.0,
			ConnectionState::Connected => 2.0,
		}
	}
}

type Reply = oneshot::Sender<Result<(), PoolError>>;

enum PoolCommand {
	Connect { resp: Reply },
	Join { channel: ChannelName, resp: Reply },
	Leave { channel: ChannelName, resp: Reply },
	Shutdown { resp: oneshot::Sender<()> },
}

/// Handle to the pool actor.
#[derive(Clone)]
pub struct ConnectionPool {
	cmd_tx: mpsc::Sender<PoolCommand>,
	state_rx: watch::Receiver<ConnectionState>,
	events_tx: broadcast::Sender<PoolEvent>,
	joined: Arc<RwLock<BTreeSet<ChannelName>>>,
}

impl ConnectionPool {
	/// Spawn the actor. The pool starts `Disconnected` and connects on first demand.
	pub fn start(cfg: PoolConfig, connector: Arc<dyn IrcConnector>) -> Self {
		let (cmd_tx, cmd_rx) = mpsc::channel(cfg.command_capacity.max(1));
		let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
		let (events_tx, _) = broadcast::channel(cfg.event_capacity.max(1));
		let joined = Arc::new(RwLock::new(BTreeSet::new()));

		let nick = cfg
			.nick
			.as_deref()
			.map(str::trim)
			.filter(|n| !n.is_empty())
			.map(str::to_ascii_lowercase)
			.unwrap_or_else(anonymous_nick);

		info!(endpoint = %connector.describe(), %nick, "chat connection pool starting");

		let actor = PoolActor {
			cfg,
			connector,
			nick,
			cmd_rx,
			state_tx,
			events_tx: events_tx.clone(),
			joined_snapshot: joined.clone(),
			link: None,
			connecting: None,
			connect_waiters: Vec::new(),
			reconnect_at: None,
			reconnect_attempt: 0,
			joined: BTreeSet::new(),
			pending_joins: HashMap::new(),
			pending_leaves: HashMap::new(),
			rejoining: HashMap::new(),
			unsent_retry_at: None,
		};
		tokio::spawn(actor.run());

		Self {
			cmd_tx,
			state_rx,
			events_tx,
			joined,
		}
	}

	/// Bring the shared connection up. Returns immediately when already connected
	/// and shares the in-flight attempt when one is running.
	pub async fn connect(&self) -> Result<(), PoolError> {
		self.request(|resp| PoolCommand::Connect { resp }).await
	}

	/// Join `channel` on the shared connection. Already joined is success without
	/// another JOIN on the wire.
	pub async fn join_channel(&self, channel: &ChannelName) -> Result<(), PoolError> {
		let channel = channel.clone();
		self.request(|resp| PoolCommand::Join { channel, resp }).await
	}

	/// Leave `channel`. Not joined is success without a PART on the wire.
	pub async fn leave_channel(&self, channel: &ChannelName) -> Result<(), PoolError> {
		let channel = channel.clone();
		self.request(|resp| PoolCommand::Leave { channel, resp }).await
	}

	/// Stream of normalized messages and connection changes.
	pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
		self.events_tx.subscribe()
	}

	pub fn state(&self) -> ConnectionState {
		*self.state_rx.borrow()
	}

	pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
		self.state_rx.clone()
	}

	/// Channels acknowledged on the wire, sorted.
	pub fn joined_channels(&self) -> Vec<ChannelName> {
		self.joined.read().iter().cloned().collect()
	}

	pub fn is_joined(&self, channel: &ChannelName) -> bool {
		self.joined.read().contains(channel)
	}

	/// Stop the actor. Outstanding callers get `PoolError::Shutdown`.
	pub async fn shutdown(&self) {
		let (resp, rx) = oneshot::channel();
		if self.cmd_tx.send(PoolCommand::Shutdown { resp }).await.is_ok() {
			let _ = rx.await;
		}
	}

	async fn request(&self, make: impl FnOnce(Reply) -> PoolCommand) -> Result<(), PoolError> {
		let (resp, rx) = oneshot::channel();
		self.cmd_tx.send(make(resp)).await.map_err(|_| PoolError::Shutdown)?;
		rx.await.unwrap_or(Err(PoolError::Shutdown))
	}
}

struct ActiveLink {
	outbound: mpsc::Sender<String>,
	inbound: mpsc::Receiver<String>,
	last_inbound: Instant,
	next_ping: Instant,
}

struct PendingOp {
	/// `None` while the JOIN/PART has not been written yet.
	deadline: Option<Instant>,
	waiters: Vec<Reply>,
}

impl PendingOp {
	fn new(resp: Reply, deadline: Option<Instant>) -> Self {
		Self {
			deadline,
			waiters: vec![resp],
		}
	}

	fn resolve(self, result: Result<(), PoolError>) {
		for w in self.waiters {
			let _ = w.send(result.clone());
		}
	}
}

struct PoolActor {
	cfg: PoolConfig,
	connector: Arc<dyn IrcConnector>,
	nick: String,
	cmd_rx: mpsc::Receiver<PoolCommand>,
	state_tx: watch::Sender<ConnectionState>,
	events_tx: broadcast::Sender<PoolEvent>,
	joined_snapshot: Arc<RwLock<BTreeSet<ChannelName>>>,

	link: Option<ActiveLink>,
	connecting: Option<JoinHandle<anyhow::Result<IrcLink>>>,
	connect_waiters: Vec<Reply>,
	reconnect_at: Option<Instant>,
	reconnect_attempt: u32,

	joined: BTreeSet<ChannelName>,
	pending_joins: HashMap<ChannelName, PendingOp>,
	pending_leaves: HashMap<ChannelName, PendingOp>,
	/// Joined channels whose re-issued JOIN is unacknowledged; `None` until written.
	rejoining: HashMap<ChannelName, Option<Instant>>,
	/// Set while some JOIN/PART is waiting for room in the outbound queue.
	unsent_retry_at: Option<Instant>,
}

impl PoolActor {
	async fn run(mut self) {
		loop {
			let wakeup = self.next_wakeup();

			tokio::select! {
				cmd = self.cmd_rx.recv() => {
					match cmd {
						Some(PoolCommand::Shutdown { resp }) => {
							self.shutdown();
							let _ = resp.send(());
							break;
						}
						Some(cmd) => self.handle_command(cmd),
						None => {
							self.shutdown();
							break;
						}
					}
				}

				res = wait_connecting(&mut self.connecting), if self.connecting.is_some() => {
					self.connecting = None;
					self.on_connect_result(res);
				}

				line = recv_line(&mut self.link), if self.link.is_some() => {
					match line {
						Some(line) => self.handle_line(&line),
						None => self.on_link_lost("connection closed by remote", false),
					}
				}

				_ = sleep_until(wakeup.unwrap_or_else(Instant::now)), if wakeup.is_some() => {
					self.on_timer();
				}
			}
		}

		debug!("chat connection pool stopped");
	}

	fn handle_command(&mut self, cmd: PoolCommand) {
		match cmd {
			PoolCommand::Connect { resp } => {
				if self.link.is_some() {
					let _ = resp.send(Ok(()));
					return;
				}
				self.connect_waiters.push(resp);
				self.ensure_connecting();
			}
			PoolCommand::Join { channel, resp } => self.request_join(channel, resp),
			PoolCommand::Leave { channel, resp } => self.request_leave(channel, resp),
			PoolCommand::Shutdown { resp } => {
				let _ = resp.send(());
			}
		}
	}

	fn request_join(&mut self, channel: ChannelName, resp: Reply) {
		if self.joined.contains(&channel) {
			let _ = resp.send(Ok(()));
			return;
		}
		if self.pending_leaves.contains_key(&channel) {
			let _ = resp.send(Err(PoolError::Busy(channel)));
			return;
		}
		if let Some(pending) = self.pending_joins.get_mut(&channel) {
			pending.waiters.push(resp);
			return;
		}

		let deadline = (self.link.is_some() && self.send_line(format!("JOIN {}", channel.irc_name())))
			.then(|| Instant::now() + self.cfg.ack_timeout);
		debug!(channel = %channel, sent = deadline.is_some(), "join requested");
		self.pending_joins.insert(channel, PendingOp::new(resp, deadline));

		if self.link.is_none() {
			self.ensure_connecting();
		}
	}

	fn request_leave(&mut self, channel: ChannelName, resp: Reply) {
		if self.pending_joins.contains_key(&channel) {
			let _ = resp.send(Err(PoolError::Busy(channel)));
			return;
		}
		if let Some(pending) = self.pending_leaves.get_mut(&channel) {
			pending.waiters.push(resp);
			return;
		}
		if !self.joined.contains(&channel) {
			let _ = resp.send(Ok(()));
			return;
		}
		self.rejoining.remove(&channel);

		let deadline = self
			.send_line(format!("PART {}", channel.irc_name()))
			.then(|| Instant::now() + self.cfg.ack_timeout);
		if self.link.is_none() {
			// The remote forgot the membership with the connection.
			self.joined.remove(&channel);
			self.sync_joined();
			let _ = resp.send(Ok(()));
			return;
		}
		debug!(channel = %channel, sent = deadline.is_some(), "leave requested");
		self.pending_leaves.insert(channel, PendingOp::new(resp, deadline));
	}

	fn ensure_connecting(&mut self) {
		// A scheduled reconnect owns the next attempt; demand arriving during backoff waits for it.
		if self.link.is_some() || self.connecting.is_some() || self.reconnect_at.is_some() {
			return;
		}
		self.set_state(ConnectionState::Connecting);

		let connector = self.connector.clone();
		let nick = self.nick.clone();
		let token = self.cfg.oauth_token.clone();
		let timeout = self.cfg.handshake_timeout;
		self.connecting = Some(tokio::spawn(async move {
			tokio::time::timeout(timeout, open_session(connector, nick, token))
				.await
				.map_err(|_| anyhow!("handshake timed out after {timeout:?}"))?
		}));
	}

	fn on_connect_result(&mut self, res: anyhow::Result<IrcLink>) {
		match res {
			Ok(link) => {
				let now = Instant::now();
				self.link = Some(ActiveLink {
					outbound: link.outbound,
					inbound: link.inbound,
					last_inbound: now,
					next_ping: now + self.cfg.ping_interval,
				});
				let was_reconnect = self.reconnect_attempt > 0 || !self.joined.is_empty();
				self.reconnect_attempt = 0;
				self.set_state(ConnectionState::Connected);

				// Membership does not survive a reconnect; re-issue it before reading anything.
				// Lines the queue cannot take yet stay unsent and are retried from the timer.
				let deadline = now + self.cfg.ack_timeout;
				let rejoined: Vec<ChannelName> = self.joined.iter().cloned().collect();
				for channel in &rejoined {
					let sent = self.send_line(format!("JOIN {}", channel.irc_name()));
					self.rejoining.insert(channel.clone(), sent.then_some(deadline));
				}
				let pending: Vec<ChannelName> = self.pending_joins.keys().cloned().collect();
				for channel in pending {
					let sent = self.send_line(format!("JOIN {}", channel.irc_name()));
					if let Some(op) = self.pending_joins.get_mut(&channel) {
						op.deadline = sent.then_some(deadline);
					}
				}
				if self.link.is_none() {
					self.rejoining.clear();
					return;
				}

				if was_reconnect {
					metrics::counter!("multitwitch_pool_reconnects_total").increment(1);
				}
				info!(nick = %self.nick, rejoined = rejoined.len(), "chat connection established");

				for w in self.connect_waiters.drain(..) {
					let _ = w.send(Ok(()));
				}
				let _ = self.events_tx.send(PoolEvent::Connected { rejoined });
			}
			Err(e) => {
				let detail = format!("{e:#}");
				warn!(error = %detail, attempt = self.reconnect_attempt, "chat connection attempt failed");

				for w in self.connect_waiters.drain(..) {
					let _ = w.send(Err(PoolError::Connection(detail.clone())));
				}
				let unsent: Vec<ChannelName> = self.pending_joins.keys().cloned().collect();
				for channel in unsent {
					if let Some(op) = self.pending_joins.remove(&channel) {
						op.resolve(Err(PoolError::Connection(detail.clone())));
					}
				}

				if self.joined.is_empty() {
					self.reconnect_attempt = 0;
					self.set_state(ConnectionState::Disconnected);
				} else {
					self.schedule_reconnect(false);
				}
			}
		}
	}

	fn schedule_reconnect(&mut self, immediate: bool) {
		self.reconnect_attempt = self.reconnect_attempt.saturating_add(1);
		let delay = if immediate {
			Duration::ZERO
		} else {
			backoff_delay(
				self.reconnect_attempt - 1,
				self.cfg.reconnect_min_delay,
				self.cfg.reconnect_max_delay,
			)
		};
		info!(attempt = self.reconnect_attempt, ?delay, "chat reconnect scheduled");
		self.reconnect_at = Some(Instant::now() + delay);
		self.set_state(ConnectionState::Connecting);
	}

	fn on_link_lost(&mut self, detail: &str, immediate: bool) {
		self.link = None;
		self.rejoining.clear();
		self.unsent_retry_at = None;
		warn!(detail, joined = self.joined.len(), "chat connection lost");

		// A PART in flight is moot once the remote session is gone.
		for (channel, op) in self.pending_leaves.drain() {
			self.joined.remove(&channel);
			op.resolve(Ok(()));
		}
		for op in self.pending_joins.values_mut() {
			op.deadline = None;
		}
		self.sync_joined();

		let mut channels: Vec<ChannelName> = self.joined.iter().cloned().collect();
		channels.extend(self.pending_joins.keys().cloned());
		let _ = self.events_tx.send(PoolEvent::ConnectionLost {
			detail: detail.to_string(),
			channels,
		});

		if self.joined.is_empty() && self.pending_joins.is_empty() {
			self.reconnect_attempt = 0;
			self.set_state(ConnectionState::Disconnected);
		} else {
			self.schedule_reconnect(immediate);
		}
	}

	fn handle_line(&mut self, line: &str) {
		if let Some(link) = self.link.as_mut() {
			link.last_inbound = Instant::now();
		}

		let msg = match IrcMessage::parse(line) {
			Ok(m) => m,
			Err(e) => {
				debug!(error = %e, line, "unparseable chat line");
				return;
			}
		};

		match msg.command.as_str() {
			"PING" => {
				let token = msg.param(0).unwrap_or("tmi.twitch.tv");
				self.send_line(format!("PONG :{token}"));
			}
			"RECONNECT" => {
				info!("chat server requested reconnect");
				self.on_link_lost("server requested reconnect", true);
			}
			"JOIN" if self.is_self(&msg) => self.on_join_echo(&msg),
			"PART" if self.is_self(&msg) => self.on_part_echo(&msg),
			"NOTICE" => self.on_notice(&msg),
			"PRIVMSG" => self.on_privmsg(&msg),
			_ => {}
		}
	}

	fn is_self(&self, msg: &IrcMessage) -> bool {
		msg.nick().is_some_and(|n| n.eq_ignore_ascii_case(&self.nick))
	}

	fn on_join_echo(&mut self, msg: &IrcMessage) {
		let Some(channel) = msg.param(0).and_then(|c| ChannelName::new(c).ok()) else {
			return;
		};

		if let Some(op) = self.pending_joins.remove(&channel) {
			info!(channel = %channel, "joined channel");
			self.joined.insert(channel);
			self.sync_joined();
			op.resolve(Ok(()));
		} else if self.rejoining.remove(&channel).is_some() {
			debug!(channel = %channel, "rejoined channel");
			let _ = self.events_tx.send(PoolEvent::Rejoined { channel });
		} else if !self.joined.contains(&channel) {
			// Acknowledgement for a join that already timed out; nobody wants it now.
			warn!(channel = %channel, "late JOIN acknowledgement; parting");
			self.send_line(format!("PART {}", channel.irc_name()));
		}
	}

	fn on_part_echo(&mut self, msg: &IrcMessage) {
		let Some(channel) = msg.param(0).and_then(|c| ChannelName::new(c).ok()) else {
			return;
		};

		if let Some(op) = self.pending_leaves.remove(&channel) {
			info!(channel = %channel, "left channel");
			self.joined.remove(&channel);
			self.sync_joined();
			op.resolve(Ok(()));
		} else if self.joined.contains(&channel) {
			warn!(channel = %channel, "server parted us from channel");
			self.lose_channel(channel, "removed from the channel by the chat server".to_string());
		}
	}

	fn on_notice(&mut self, msg: &IrcMessage) {
		let Some(msg_id) = msg.tag("msg-id") else {
			debug!(text = msg.param(1).unwrap_or_default(), "chat notice");
			return;
		};
		if !JOIN_REJECTION_IDS.contains(&msg_id) {
			debug!(msg_id, "chat notice");
			return;
		}
		let Some(channel) = msg.param(0).and_then(|c| ChannelName::new(c).ok()) else {
			return;
		};

		let reason = msg.param(1).unwrap_or(msg_id).to_string();
		if let Some(op) = self.pending_joins.remove(&channel) {
			warn!(channel = %channel, msg_id, "join rejected");
			op.resolve(Err(PoolError::JoinRejected { channel, reason }));
		} else if self.joined.contains(&channel) {
			warn!(channel = %channel, msg_id, "rejoin rejected");
			self.lose_channel(channel, reason);
		}
	}

	/// Forget a joined channel nobody asked to leave and tell consumers.
	fn lose_channel(&mut self, channel: ChannelName, reason: String) {
		self.rejoining.remove(&channel);
		if self.joined.remove(&channel) {
			self.sync_joined();
		}
		let _ = self.events_tx.send(PoolEvent::ChannelLost { channel, reason });
	}

	fn on_privmsg(&mut self, msg: &IrcMessage) {
		let joined = msg
			.param(0)
			.and_then(|c| ChannelName::new(c).ok())
			.is_some_and(|c| self.joined.contains(&c));
		if !joined {
			debug!(channel = msg.param(0).unwrap_or_default(), "dropping message for channel not joined");
			return;
		}

		match normalize_privmsg(msg, unix_ms_now()) {
			Ok(chat) => {
				metrics::counter!("multitwitch_messages_ingested_total").increment(1);
				debug!(channel = %chat.channel, user = %chat.login, "chat message");
				let _ = self.events_tx.send(PoolEvent::Message(Arc::new(chat)));
			}
			Err(e) => {
				metrics::counter!("multitwitch_malformed_messages_total").increment(1);
				warn!(error = %e, "dropping malformed chat message");
			}
		}
	}

	fn on_timer(&mut self) {
		let now = Instant::now();

		if self.reconnect_at.is_some_and(|at| at <= now) {
			self.reconnect_at = None;
			self.ensure_connecting();
		}

		if self.unsent_retry_at.is_some_and(|at| at <= now) {
			self.unsent_retry_at = None;
			self.flush_unsent(now);
		}

		let expired_joins: Vec<ChannelName> = self
			.pending_joins
			.iter()
			.filter(|(_, op)| op.deadline.is_some_and(|d| d <= now))
			.map(|(c, _)| c.clone())
			.collect();
		for channel in expired_joins {
			if let Some(op) = self.pending_joins.remove(&channel) {
				metrics::counter!("multitwitch_pool_join_timeouts_total").increment(1);
				warn!(channel = %channel, "join timed out");
				op.resolve(Err(PoolError::JoinTimeout(channel)));
			}
		}

		let expired_rejoins: Vec<ChannelName> = self
			.rejoining
			.iter()
			.filter(|(_, deadline)| deadline.is_some_and(|d| d <= now))
			.map(|(c, _)| c.clone())
			.collect();
		for channel in expired_rejoins {
			metrics::counter!("multitwitch_pool_join_timeouts_total").increment(1);
			warn!(channel = %channel, "rejoin timed out; dropping channel");
			self.lose_channel(channel, "rejoin was not acknowledged".to_string());
		}

		let expired_leaves: Vec<ChannelName> = self
			.pending_leaves
			.iter()
			.filter(|(_, op)| op.deadline.is_some_and(|d| d <= now))
			.map(|(c, _)| c.clone())
			.collect();
		for channel in expired_leaves {
			if let Some(op) = self.pending_leaves.remove(&channel) {
				metrics::counter!("multitwitch_pool_leave_timeouts_total").increment(1);
				warn!(channel = %channel, "leave timed out; channel stays joined");
				op.resolve(Err(PoolError::LeaveTimeout(channel)));
			}
		}

		let ping_interval = self.cfg.ping_interval;
		let mut keepalive_failed = false;
		let mut send_ping = false;
		if let Some(link) = self.link.as_mut() {
			if now.duration_since(link.last_inbound) >= ping_interval * 2 {
				keepalive_failed = true;
			} else if link.next_ping <= now {
				link.next_ping = now + ping_interval;
				send_ping = true;
			}
		}
		if keepalive_failed {
			self.on_link_lost("keepalive watchdog triggered", false);
		} else if send_ping {
			self.send_line("PING :tmi.twitch.tv".to_string());
		}
	}

	/// Write JOIN/PART lines that found the outbound queue full. Stops at the
	/// first line the queue still refuses.
	fn flush_unsent(&mut self, now: Instant) {
		if self.link.is_none() {
			return;
		}
		let deadline = now + self.cfg.ack_timeout;

		let joins: Vec<ChannelName> = self
			.pending_joins
			.iter()
			.filter(|(_, op)| op.deadline.is_none())
			.map(|(c, _)| c.clone())
			.chain(self.rejoining.iter().filter(|(_, d)| d.is_none()).map(|(c, _)| c.clone()))
			.collect();
		for channel in joins {
			if !self.send_line(format!("JOIN {}", channel.irc_name())) {
				return;
			}
			if let Some(op) = self.pending_joins.get_mut(&channel) {
				op.deadline = Some(deadline);
			} else if let Some(d) = self.rejoining.get_mut(&channel) {
				*d = Some(deadline);
			}
		}

		let leaves: Vec<ChannelName> = self
			.pending_leaves
			.iter()
			.filter(|(_, op)| op.deadline.is_none())
			.map(|(c, _)| c.clone())
			.collect();
		for channel in leaves {
			if !self.send_line(format!("PART {}", channel.irc_name())) {
				return;
			}
			if let Some(op) = self.pending_leaves.get_mut(&channel) {
				op.deadline = Some(deadline);
			}
		}
	}

	fn next_wakeup(&self) -> Option<Instant> {
		let pending = self
			.pending_joins
			.values()
			.chain(self.pending_leaves.values())
			.filter_map(|op| op.deadline)
			.chain(self.rejoining.values().flatten().copied());
		let link = self
			.link
			.as_ref()
			.map(|l| l.next_ping.min(l.last_inbound + self.cfg.ping_interval * 2));
		pending
			.chain(self.reconnect_at)
			.chain(link)
			.chain(self.unsent_retry_at)
			.min()
	}

	/// Queue a line without waiting. Returns false when it was not queued.
	fn send_line(&mut self, line: String) -> bool {
		let Some(link) = self.link.as_ref() else {
			return false;
		};
		// Never await the link from the actor: the transport may be blocked handing us input.
		match link.outbound.try_send(line) {
			Ok(()) => true,
			Err(mpsc::error::TrySendError::Full(_)) => {
				metrics::counter!("multitwitch_pool_outbound_full_total").increment(1);
				debug!("chat outbound queue full; line deferred");
				self.unsent_retry_at.get_or_insert_with(|| Instant::now() + UNSENT_RETRY);
				false
			}
			Err(mpsc::error::TrySendError::Closed(_)) => {
				warn!("chat outbound link closed");
				self.on_link_lost("outbound link closed", false);
				false
			}
		}
	}

	fn set_state(&self, state: ConnectionState) {
		metrics::gauge!("multitwitch_pool_state").set(state.as_gauge());
		self.state_tx.send_if_modified(|current| {
			if *current == state {
				false
			} else {
				debug!(from = ?*current, to = ?state, "pool state");
				*current = state;
				true
			}
		});
	}

	fn sync_joined(&self) {
		metrics::gauge!("multitwitch_pool_joined_channels").set(self.joined.len() as f64);
		*self.joined_snapshot.write() = self.joined.clone();
	}

	fn shutdown(&mut self) {
		info!(joined = self.joined.len(), "chat connection pool shutting down");
		if let Some(task) = self.connecting.take() {
			task.abort();
		}
		self.link = None;
		for w in self.connect_waiters.drain(..) {
			let _ = w.send(Err(PoolError::Shutdown));
		}
		for (_, op) in self.pending_joins.drain() {
			op.resolve(Err(PoolError::Shutdown));
		}
		for (_, op) in self.pending_leaves.drain() {
			op.resolve(Err(PoolError::Shutdown));
		}
		self.rejoining.clear();
		self.unsent_retry_at = None;
		self.joined.clear();
		self.sync_joined();
		self.set_state(ConnectionState::Disconnected);
	}
}

/// Connect and run CAP/PASS/NICK until the welcome numeric.
async fn open_session(
	connector: Arc<dyn IrcConnector>,
	nick: String,
	token: Option<SecretString>,
) -> anyhow::Result<IrcLink> {
	let mut link = connector.connect().await.context("open chat transport")?;

	let pass = match &token {
		Some(t) => format!("PASS oauth:{}", t.expose().trim_start_matches("oauth:")),
		None => "PASS SCHMOOPIIE".to_string(),
	};
	for line in [
		"CAP REQ :twitch.tv/tags twitch.tv/commands".to_string(),
		pass,
		format!("NICK {nick}"),
	] {
		link.outbound
			.send(line)
			.await
			.map_err(|_| anyhow!("chat transport closed during handshake"))?;
	}

	loop {
		let line = link
			.inbound
			.recv()
			.await
			.ok_or_else(|| anyhow!("chat transport closed during handshake"))?;
		let Ok(msg) = IrcMessage::parse(&line) else {
			continue;
		};
		match msg.command.as_str() {
			"001" => return Ok(link),
			"NOTICE" => {
				let text = msg.param(1).unwrap_or_default();
				if AUTH_FAILURE_NOTICES.iter().any(|n| text.contains(n)) {
					anyhow::bail!("chat login rejected: {text}");
				}
			}
			"PING" => {
				let _ = link
					.outbound
					.send(format!("PONG :{}", msg.param(0).unwrap_or("tmi.twitch.tv")))
					.await;
			}
			_ => {}
		}
	}
}

async fn wait_connecting(slot: &mut Option<JoinHandle<anyhow::Result<IrcLink>>>) -> anyhow::Result<IrcLink> {
	match slot {
		Some(handle) => match handle.await {
			Ok(res) => res,
			Err(e) => Err(anyhow!("connect task failed: {e}")),
		},
		None => std::future::pending().await,
	}
}

async fn recv_line(link: &mut Option<ActiveLink>) -> Option<String> {
	match link {
		Some(l) => l.inbound.recv().await,
		None => std::future::pending().await,
	}
}

pub(crate) fn backoff_delay(attempt: u32, min: Duration, max: Duration) -> Duration {
	let pow = attempt.min(16);
	let ms = min.as_millis().saturating_mul(1u128 << pow);
	let d = Duration::from_millis(ms.min(u64::MAX as u128) as u64);
	d.min(max).max(min)
}

fn unix_ms_now() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_millis() as i64)
		.unwrap_or_default()
}
