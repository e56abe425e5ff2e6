#![forbid(unsafe_code)]

//! In-process stand-in for the chat network.
//!
//! Answers the CAP/NICK handshake, acknowledges JOIN/PART, answers PING and
//! records every line it receives. Used by tests and by the demo mode of the
//! server, where it also emits synthetic chat for each joined channel.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::irc::IrcMessage;
use crate::transport::{IrcConnector, IrcLink, LINK_CAPACITY};

/// One line received by the loopback server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireLine {
	/// 1-based connection counter.
	pub connection: usize,
	pub line: String,
}

struct LiveSession {
	connection: usize,
	to_client: mpsc::Sender<String>,
	task: JoinHandle<()>,
}

struct LoopbackState {
	connects: usize,
	fail_connects: u32,
	ack_joins: bool,
	ack_parts: bool,
	rejections: HashMap<String, String>,
	wire: Vec<WireLine>,
	live: Option<LiveSession>,
	demo_interval: Option<Duration>,
}

impl Default for LoopbackState {
	fn default() -> Self {
		Self {
			connects: 0,
			fail_connects: 0,
			ack_joins: true,
			ack_parts: true,
			rejections: HashMap::new(),
			wire: Vec::new(),
			live: None,
			demo_interval: None,
		}
	}
}

#[derive(Clone, Default)]
pub struct LoopbackConnector {
	shared: Arc<Mutex<LoopbackState>>,
}

impl LoopbackConnector {
	pub fn new() -> Self {
		Self::default()
	}

	/// Emit one synthetic PRIVMSG per joined channel every `interval`.
	pub fn with_demo_messages(self, interval: Duration) -> Self {
		self.shared.lock().demo_interval = Some(interval);
		self
	}

	pub fn set_ack_joins(&self, ack: bool) {
		self.shared.lock().ack_joins = ack;
	}

	pub fn set_ack_parts(&self, ack: bool) {
		self.shared.lock().ack_parts = ack;
	}

	/// Answer future JOINs for `channel` with a NOTICE carrying `msg_id`.
	pub fn reject_channel(&self, channel: &str, msg_id: &str) {
		let key = format!("#{}", channel.trim_start_matches('#').to_ascii_lowercase());
		self.shared.lock().rejections.insert(key, msg_id.to_string());
	}

	/// Refuse the next `n` connection attempts.
	pub fn fail_next_connects(&self, n: u32) {
		self.shared.lock().fail_connects = n;
	}

	/// Number of successful connects so far.
	pub fn connects(&self) -> usize {
		self.shared.lock().connects
	}

	pub fn is_live(&self) -> bool {
		self.shared.lock().live.is_some()
	}

	pub fn wire_lines(&self) -> Vec<WireLine> {
		self.shared.lock().wire.clone()
	}

	/// Lines received on one connection, in order.
	pub fn lines_for(&self, connection: usize) -> Vec<String> {
		self.shared
			.lock()
			.wire
			.iter()
			.filter(|w| w.connection == connection)
			.map(|w| w.line.clone())
			.collect()
	}

	/// How many received lines equal `line` across all connections.
	pub fn count_sent(&self, line: &str) -> usize {
		self.shared.lock().wire.iter().filter(|w| w.line == line).count()
	}

	/// Push a raw line to the connected client. Returns false when nobody is connected.
	pub fn inject(&self, line: impl Into<String>) -> bool {
		let guard = self.shared.lock();
		match &guard.live {
			Some(live) => live.to_client.try_send(line.into()).is_ok(),
			None => false,
		}
	}

	/// Kill the live connection as if the network dropped it.
	pub fn drop_connection(&self) -> bool {
		let live = self.shared.lock().live.take();
		match live {
			Some(live) => {
				debug!(connection = live.connection, "loopback dropping connection");
				live.task.abort();
				true
			}
			None => false,
		}
	}
}

#[async_trait::async_trait]
impl IrcConnector for LoopbackConnector {
	async fn connect(&self) -> anyhow::Result<IrcLink> {
		let (link, remote_rx, remote_tx) = IrcLink::pair(LINK_CAPACITY);

		let mut guard = self.shared.lock();
		if guard.fail_connects > 0 {
			guard.fail_connects -= 1;
			anyhow::bail!("loopback refused connection");
		}
		guard.connects += 1;
		let connection = guard.connects;
		let demo_interval = guard.demo_interval;

		if let Some(old) = guard.live.take() {
			old.task.abort();
		}

		let task = tokio::spawn(serve(
			self.shared.clone(),
			connection,
			remote_rx,
			remote_tx.clone(),
			demo_interval,
		));
		guard.live = Some(LiveSession {
			connection,
			to_client: remote_tx,
			task,
		});

		Ok(link)
	}

	fn describe(&self) -> String {
		"loopback".to_string()
	}
}

async fn serve(
	shared: Arc<Mutex<LoopbackState>>,
	connection: usize,
	mut from_client: mpsc::Receiver<String>,
	to_client: mpsc::Sender<String>,
	demo_interval: Option<Duration>,
) {
	let mut nick = String::from("justinfan0");
	let mut joined: BTreeSet<String> = BTreeSet::new();
	let mut demo_tick = demo_interval.map(tokio::time::interval);
	let mut demo_seq: u64 = 0;

	loop {
		tokio::select! {
			line = from_client.recv() => {
				let Some(line) = line else {
					break;
				};
				let replies = {
					let mut state = shared.lock();
					state.wire.push(WireLine {
						connection,
						line: line.clone(),
					});
					respond(&state, &line, &mut nick, &mut joined)
				};
				for reply in replies {
					if to_client.send(reply).await.is_err() {
						return;
					}
				}
			}
			_ = tick(&mut demo_tick), if demo_tick.is_some() => {
				for channel in &joined {
					demo_seq += 1;
					if to_client.send(demo_privmsg(channel, demo_seq)).await.is_err() {
						return;
					}
				}
			}
		}
	}

	let mut state = shared.lock();
	if state.live.as_ref().is_some_and(|l| l.connection == connection) {
		state.live = None;
	}
}

async fn tick(interval: &mut Option<tokio::time::Interval>) {
	match interval {
		Some(i) => {
			i.tick().await;
		}
		None => std::future::pending::<()>().await,
	}
}

fn respond(state: &LoopbackState, line: &str, nick: &mut String, joined: &mut BTreeSet<String>) -> Vec<String> {
	let Ok(msg) = IrcMessage::parse(line) else {
		return Vec::new();
	};

	match msg.command.as_str() {
		"CAP" => vec![":tmi.twitch.tv CAP * ACK :twitch.tv/tags twitch.tv/commands".to_string()],
		"NICK" => {
			if let Some(n) = msg.param(0) {
				*nick = n.to_ascii_lowercase();
			}
			vec![
				format!(":tmi.twitch.tv 001 {nick} :Welcome, GLHF!"),
				format!(":tmi.twitch.tv 376 {nick} :>"),
			]
		}
		"JOIN" => {
			let mut out = Vec::new();
			for channel in msg.param(0).unwrap_or_default().split(',').filter(|c| !c.is_empty()) {
				let channel = channel.to_ascii_lowercase();
				if let Some(msg_id) = state.rejections.get(&channel) {
					out.push(format!(
						"@msg-id={msg_id} :tmi.twitch.tv NOTICE {channel} :This channel is unavailable."
					));
					continue;
				}
				joined.insert(channel.clone());
				if state.ack_joins {
					out.push(format!(":{nick}!{nick}@{nick}.tmi.twitch.tv JOIN {channel}"));
				}
			}
			out
		}
		"PART" => {
			let mut out = Vec::new();
			for channel in msg.param(0).unwrap_or_default().split(',').filter(|c| !c.is_empty()) {
				let channel = channel.to_ascii_lowercase();
				joined.remove(&channel);
				if state.ack_parts {
					out.push(format!(":{nick}!{nick}@{nick}.tmi.twitch.tv PART {channel}"));
				}
			}
			out
		}
		"PING" => vec![format!(
			":tmi.twitch.tv PONG tmi.twitch.tv :{}",
			msg.param(0).unwrap_or("tmi.twitch.tv")
		)],
		_ => Vec::new(),
	}
}

fn demo_privmsg(channel: &str, seq: u64) -> String {
	let viewer = seq % 7;
	let login = format!("demoviewer{viewer}");
	let now_ms = SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_millis() as i64)
		.unwrap_or_default();
	let (text, emotes) = if seq % 5 == 0 {
		(format!("Kappa demo message {seq}"), "25:0-4")
	} else {
		(format!("demo message {seq}"), "")
	};
	let badges = if viewer == 0 { "subscriber/6" } else { "" };
	let subscriber = u8::from(viewer == 0);
	format!(
		"@badges={badges};color=;display-name=DemoViewer{viewer};emotes={emotes};id={};mod=0;subscriber={subscriber};tmi-sent-ts={now_ms};user-type= :{login}!{login}@{login}.tmi.twitch.tv PRIVMSG {channel} :{text}",
		uuid::Uuid::new_v4()
	)
}
