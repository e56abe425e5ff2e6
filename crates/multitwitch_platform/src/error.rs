#![forbid(unsafe_code)]

use multitwitch_domain::{ChannelName, ParseIdError};
use thiserror::Error;

/// Failures reported by the connection pool to its callers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PoolError {
	#[error("chat connection error: {0}")]
	Connection(String),

	#[error("timed out waiting for JOIN acknowledgement for #{0}")]
	JoinTimeout(ChannelName),

	#[error("timed out waiting for PART acknowledgement for #{0}")]
	LeaveTimeout(ChannelName),

	#[error("join refused for #{channel}: {reason}")]
	JoinRejected {
		channel: ChannelName,
		reason: String,
	},

	#[error("another operation for #{0} is still in flight")]
	Busy(ChannelName),

	#[error("connection pool is shut down")]
	Shutdown,
}

/// A raw chat line that cannot become a `ChatMessage`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MalformedMessage {
	#[error("expected PRIVMSG, got {0}")]
	UnexpectedCommand(String),

	#[error("missing channel parameter")]
	MissingChannel,

	#[error("invalid channel: {0}")]
	InvalidChannel(#[from] ParseIdError),

	#[error("missing sender prefix")]
	MissingSender,

	#[error("missing message text")]
	MissingText,
}

/// IRC line parse failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IrcParseError {
	#[error("empty line")]
	Empty,

	#[error("tags present but nothing follows them")]
	UnterminatedTags,

	#[error("prefix present but missing command")]
	MissingCommand,
}
