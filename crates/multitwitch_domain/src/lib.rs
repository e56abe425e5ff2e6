#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid channel name: {0}")]
	InvalidChannel(String),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Canonical chat channel name.
///
/// Stored without the leading `#` and lowercased, so two names that differ only
/// in case or in the `#` prefix compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelName(String);

impl ChannelName {
	/// Longest login the chat network hands out.
	pub const MAX_LEN: usize = 25;

	/// Canonicalize and validate a channel name (`#Foo`, ` foo `, `FOO` all yield `foo`).
	pub fn new(raw: impl AsRef<str>) -> Result<Self, ParseIdError> {
		let trimmed = raw.as_ref().trim();
		let trimmed = trimmed.strip_prefix('#').unwrap_or(trimmed).trim();
		if trimmed.is_empty() {
			return Err(ParseIdError::Empty);
		}
		if trimmed.len() > Self::MAX_LEN {
			return Err(ParseIdError::InvalidChannel(trimmed.to_string()));
		}
		if !trimmed.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
			return Err(ParseIdError::InvalidChannel(trimmed.to_string()));
		}
		Ok(Self(trimmed.to_ascii_lowercase()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}

	/// Wire form used by JOIN/PART/PRIVMSG (`#name`).
	pub fn irc_name(&self) -> String {
		format!("#{}", self.0)
	}
}

impl fmt::Display for ChannelName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for ChannelName {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ChannelName::new(s)
	}
}

impl TryFrom<String> for ChannelName {
	type Error = ParseIdError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		ChannelName::new(value)
	}
}

impl From<ChannelName> for String {
	fn from(value: ChannelName) -> Self {
		value.0
	}
}

/// Server-assigned identifier of one downstream client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub uuid::Uuid);

impl SessionId {
	/// Create a new random session id.
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for SessionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for SessionId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		uuid::Uuid::parse_str(s)
			.map(Self)
			.map_err(|e| ParseIdError::InvalidFormat(e.to_string()))
	}
}

/// Outcome reported to a client for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatStatusKind {
	Connected,
	Disconnected,
	Failed,
	Error,
}

impl ChatStatusKind {
	pub const fn as_str(self) -> &'static str {
		match self {
			ChatStatusKind::Connected => "connected",
			ChatStatusKind::Disconnected => "disconnected",
			ChatStatusKind::Failed => "failed",
			ChatStatusKind::Error => "error",
		}
	}
}

impl fmt::Display for ChatStatusKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// A chat badge such as `subscriber/12`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Badge {
	pub name: String,
	pub version: String,
}

/// Inclusive character range of one emote occurrence inside the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CharRange {
	pub start: u32,
	pub end: u32,
}

/// All occurrences of one emote inside a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmoteOccurrence {
	pub id: String,
	pub ranges: Vec<CharRange>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFlags {
	pub is_subscriber: bool,
	pub is_moderator: bool,
	pub is_vip: bool,
}

/// Normalized chat message, immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
	pub id: String,
	pub channel: ChannelName,
	/// Display name, falling back to the login.
	pub username: String,
	pub login: String,
	pub text: String,
	/// `#RRGGBB`.
	pub color: String,
	pub badges: Vec<Badge>,
	pub emotes: Vec<EmoteOccurrence>,
	/// Send time in epoch milliseconds.
	pub sent_at_ms: i64,
	pub flags: MessageFlags,
	pub user_type: String,
}

impl ChatMessage {
	pub fn has_badge(&self, name: &str) -> bool {
		self.badges.iter().any(|b| b.name == name)
	}
}
