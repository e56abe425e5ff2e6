#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use multitwitch_domain::{ChannelName, ChatMessage};
use parking_lot::Mutex;

use crate::util::time::unix_ms_now;

#[derive(Debug, Clone)]
pub struct HistoryConfig {
	/// Messages kept per channel. Zero disables history.
	pub per_channel_capacity: usize,
	pub retention_secs: Option<u64>,
}

impl Default for HistoryConfig {
	fn default() -> Self {
		Self {
			per_channel_capacity: 100,
			retention_secs: None,
		}
	}
}

/// Per-channel ring buffer of recent chat, replayed to late subscribers.
#[derive(Debug, Clone)]
pub struct RecentHistory {
	inner: Arc<Mutex<HashMap<ChannelName, VecDeque<Arc<ChatMessage>>>>>,
	cfg: HistoryConfig,
}

impl RecentHistory {
	pub fn new(cfg: HistoryConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(HashMap::new())),
			cfg,
		}
	}

	pub fn push(&self, msg: Arc<ChatMessage>) {
		if self.cfg.per_channel_capacity == 0 {
			return;
		}

		let mut inner = self.inner.lock();
		let buf = inner.entry(msg.channel.clone()).or_default();
		buf.push_back(msg);

		if let Some(retention) = self.cfg.retention_secs {
			prune_older_than(buf, retention);
		}

		while buf.len() > self.cfg.per_channel_capacity {
			buf.pop_front();
		}
	}

	/// Oldest first.
	pub fn snapshot(&self, channel: &ChannelName) -> Vec<Arc<ChatMessage>> {
		let mut inner = self.inner.lock();
		let Some(buf) = inner.get_mut(channel) else {
			return Vec::new();
		};
		if let Some(retention) = self.cfg.retention_secs {
			prune_older_than(buf, retention);
		}
		buf.iter().cloned().collect()
	}

	/// Drop a channel's buffer once nobody watches it.
	pub fn forget(&self, channel: &ChannelName) {
		self.inner.lock().remove(channel);
	}

	#[cfg(test)]
	pub fn len(&self, channel: &ChannelName) -> usize {
		self.inner.lock().get(channel).map(VecDeque::len).unwrap_or(0)
	}
}

fn prune_older_than(buf: &mut VecDeque<Arc<ChatMessage>>, retention_secs: u64) {
	let threshold_ms = unix_ms_now().saturating_sub((retention_secs as i64).saturating_mul(1000));
	while let Some(front) = buf.front() {
		if front.sent_at_ms < threshold_ms {
			buf.pop_front();
		} else {
			break;
		}
	}
}
