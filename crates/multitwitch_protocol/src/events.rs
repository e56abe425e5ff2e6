#![forbid(unsafe_code)]

use std::sync::Arc;

use multitwitch_domain::{ChannelName, ChatMessage, ChatStatusKind};
use serde::{Deserialize, Serialize};

/// Events a browser session sends to the server.
///
/// Channel names travel as raw strings; the server canonicalizes them and answers
/// an invalid name with a `failed` status that echoes what was sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
	JoinChannelChat(String),
	LeaveChannelChat(String),
}

impl ClientEvent {
	pub fn channel(&self) -> &str {
		match self {
			ClientEvent::JoinChannelChat(c) | ClientEvent::LeaveChannelChat(c) => c,
		}
	}
}

/// Events the server pushes to a browser session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
	ChatMessage(Arc<ChatMessage>),
	ChatStatus {
		channel: String,
		status: ChatStatusKind,
		message: String,
	},
	ChatHistory {
		channel: ChannelName,
		messages: Vec<Arc<ChatMessage>>,
	},
	/// Messages were dropped for this session because its queue was full.
	ChatLagged {
		dropped: u64,
	},
}

impl ServerEvent {
	pub fn status(channel: impl Into<String>, status: ChatStatusKind, message: impl Into<String>) -> Self {
		ServerEvent::ChatStatus {
			channel: channel.into(),
			status,
			message: message.into(),
		}
	}

	pub fn connected(channel: &ChannelName) -> Self {
		Self::status(channel.as_str(), ChatStatusKind::Connected, format!("Connected to {channel} chat"))
	}

	pub fn disconnected(channel: &ChannelName) -> Self {
		Self::status(
			channel.as_str(),
			ChatStatusKind::Disconnected,
			format!("Disconnected from {channel} chat"),
		)
	}

	pub fn failed(channel: impl Into<String>, reason: impl std::fmt::Display) -> Self {
		let channel = channel.into();
		let message = format!("Failed to connect to {channel} chat: {reason}");
		Self::status(channel, ChatStatusKind::Failed, message)
	}

	pub fn error(channel: impl Into<String>, reason: impl std::fmt::Display) -> Self {
		Self::status(channel, ChatStatusKind::Error, reason.to_string())
	}

	/// Stable event name, matching the `event` field on the wire.
	pub const fn name(&self) -> &'static str {
		match self {
			ServerEvent::ChatMessage(_) => "chat-message",
			ServerEvent::ChatStatus { .. } => "chat-status",
			ServerEvent::ChatHistory { .. } => "chat-history",
			ServerEvent::ChatLagged { .. } => "chat-lagged",
		}
	}
}
