#![forbid(unsafe_code)]

pub mod error;
pub mod irc;
pub mod loopback;
pub mod normalize;
pub mod pool;
pub mod transport;


use std::fmt;
use std::sync::Arc;

use multitwitch_domain::{ChannelName, ChatMessage};

pub use error::{IrcParseError, MalformedMessage, PoolError};
pub use irc::IrcMessage;
pub use loopback::LoopbackConnector;
pub use normalize::{derive_color, normalize_privmsg, parse_badges, parse_emotes};
pub use pool::{ConnectionPool, ConnectionState, PoolConfig};
pub use transport::{IrcConnector, IrcLink, WsIrcConnector};

/// Default chat network endpoint (IRC over WebSocket).
pub const DEFAULT_IRC_WS_URL: &str = "wss://irc-ws.chat.twitch.tv:443";

/// Pool → consumer event.
#[derive(Debug, Clone)]
pub enum PoolEvent {
	/// Normalized chat message for a joined channel.
	Message(Arc<ChatMessage>),

	/// Transport is up; `rejoined` lists channels whose JOIN was re-issued.
	/// Each of them later settles as `Rejoined` or `ChannelLost`.
	Connected { rejoined: Vec<ChannelName> },

	/// A re-issued JOIN was acknowledged.
	Rejoined { channel: ChannelName },

	/// The pool dropped `channel` without being asked to and will not rejoin it.
	ChannelLost { channel: ChannelName, reason: String },

	/// Transport dropped; `channels` were joined or pending at that moment.
	ConnectionLost { detail: String, channels: Vec<ChannelName> },
}

/// Wrapper that redacts in logs.
#[derive(Clone)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl serde::Serialize for SecretString {
	fn serialize<S>(&self, serializer: S) -> Result<<S as serde::Serializer>::Ok, <S as serde::Serializer>::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_str("")
	}
}

impl<'de> serde::Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}

/// Generate an anonymous read-only login (`justinfanNNNNN`).
pub fn anonymous_nick() -> String {
	let n = uuid::Uuid::new_v4().as_u128() % 90_000 + 10_000;
	format!("justinfan{n}")
}
