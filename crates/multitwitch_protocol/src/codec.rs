#![forbid(unsafe_code)]

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Default maximum size of one JSON event frame.
pub const DEFAULT_MAX_EVENT_SIZE: usize = 64 * 1024; // 64 KiB

#[derive(Debug, Error)]
pub enum CodecError {
	#[error("event exceeds maximum size: len={len} max={max}")]
	EventTooLarge {
		len: usize,
		max: usize,
	},

	#[error("json decode error: {0}")]
	Decode(#[source] serde_json::Error),

	#[error("json encode error: {0}")]
	Encode(#[source] serde_json::Error),
}

/// Encode an event into one text frame.
pub fn encode_event<E: Serialize>(event: &E, max_event_size: usize) -> Result<String, CodecError> {
	let text = serde_json::to_string(event).map_err(CodecError::Encode)?;
	if text.len() > max_event_size {
		return Err(CodecError::EventTooLarge {
			len: text.len(),
			max: max_event_size,
		});
	}
	Ok(text)
}

/// Encode an event using `DEFAULT_MAX_EVENT_SIZE`.
pub fn encode_event_default<E: Serialize>(event: &E) -> Result<String, CodecError> {
	encode_event(event, DEFAULT_MAX_EVENT_SIZE)
}

/// Decode one text frame. The size check runs before any parsing.
pub fn decode_event<E: DeserializeOwned>(text: &str, max_event_size: usize) -> Result<E, CodecError> {
	if text.len() > max_event_size {
		return Err(CodecError::EventTooLarge {
			len: text.len(),
			max: max_event_size,
		});
	}
	serde_json::from_str(text).map_err(CodecError::Decode)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ClientEvent;

	#[test]
	fn rejects_oversized_before_parsing() {
		let text = format!("{{\"event\":\"join-channel-chat\",\"data\":\"{}\"}}", "a".repeat(100));
		let err = decode_event::<ClientEvent>(&text, 32).unwrap_err();
		match err {
			CodecError::EventTooLarge { len, max } => {
				assert_eq!(max, 32);
				assert!(len > max);
			}
			other => panic!("unexpected error: {other:?}"),
		}
	}

	#[test]
	fn encode_respects_limit() {
		let ev = ClientEvent::JoinChannelChat("x".repeat(64));
		assert!(matches!(
			encode_event(&ev, 16),
			Err(CodecError::EventTooLarge { .. })
		));
		assert!(encode_event_default(&ev).is_ok());
	}
}
