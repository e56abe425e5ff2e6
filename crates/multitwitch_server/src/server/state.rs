#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashMap};

use multitwitch_domain::{ChannelName, SessionId};

/// Refcount table plus every subscriber's wanted set.
///
/// `refcounts[c]` always equals the number of subscribers whose wanted set holds `c`;
/// zero entries are removed. The caller turns `first`/`last` transitions into pool
/// joins and leaves.
#[derive(Debug, Default)]
pub struct SubscriptionState {
	subscribers: HashMap<SessionId, SubscriberRecord>,

	refcounts: HashMap<ChannelName, u64>,
}

#[derive(Debug, Default, Clone)]
pub struct SubscriberRecord {
	pub wanted: BTreeSet<ChannelName>,

	/// Set once disconnect cleanup starts; no new wants are accepted.
	pub closing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WantOutcome {
	/// The subscriber already wanted the channel.
	AlreadyWanted,
	/// Recorded; `first` marks the 0→1 transition.
	Added { first: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwantOutcome {
	NotWanted,
	/// Removed; `last` marks the 1→0 transition.
	Removed { last: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateError {
	UnknownSubscriber,
	SubscriberClosed,
}

impl SubscriptionState {
	/// Returns false when the id is already registered.
	pub fn register(&mut self, session: SessionId) -> bool {
		if self.subscribers.contains_key(&session) {
			return false;
		}
		self.subscribers.insert(session, SubscriberRecord::default());
		true
	}

	pub fn is_registered(&self, session: SessionId) -> bool {
		self.subscribers.contains_key(&session)
	}

	pub fn want(&mut self, session: SessionId, channel: &ChannelName) -> Result<WantOutcome, StateError> {
		let record = self.subscribers.get_mut(&session).ok_or(StateError::UnknownSubscriber)?;
		if record.closing {
			return Err(StateError::SubscriberClosed);
		}
		if !record.wanted.insert(channel.clone()) {
			return Ok(WantOutcome::AlreadyWanted);
		}

		let rc = self.refcounts.entry(channel.clone()).or_insert(0);
		*rc += 1;
		Ok(WantOutcome::Added { first: *rc == 1 })
	}

	pub fn unwant(&mut self, session: SessionId, channel: &ChannelName) -> Result<UnwantOutcome, StateError> {
		let record = self.subscribers.get_mut(&session).ok_or(StateError::UnknownSubscriber)?;
		if !record.wanted.remove(channel) {
			return Ok(UnwantOutcome::NotWanted);
		}
		Ok(UnwantOutcome::Removed {
			last: self.decrement(channel),
		})
	}

	/// Flag the subscriber as closing and return what it still wants.
	pub fn mark_closing(&mut self, session: SessionId) -> Option<Vec<ChannelName>> {
		let record = self.subscribers.get_mut(&session)?;
		record.closing = true;
		Some(record.wanted.iter().cloned().collect())
	}

	#[cfg(test)]
	pub fn is_closing(&self, session: SessionId) -> bool {
		self.subscribers.get(&session).is_some_and(|r| r.closing)
	}

	/// Drop the record, releasing anything it still wants. Returns channels that
	/// reached zero.
	pub fn remove(&mut self, session: SessionId) -> Vec<ChannelName> {
		let Some(record) = self.subscribers.remove(&session) else {
			return Vec::new();
		};

		let mut released = Vec::new();
		for channel in record.wanted {
			if self.decrement(&channel) {
				released.push(channel);
			}
		}
		released
	}

	/// Strip `channel` from every wanted set and zero its refcount. Returns the
	/// subscribers that wanted it, sorted.
	pub fn drop_channel(&mut self, channel: &ChannelName) -> Vec<SessionId> {
		self.refcounts.remove(channel);
		let mut dropped: Vec<SessionId> = self
			.subscribers
			.iter_mut()
			.filter_map(|(id, record)| record.wanted.remove(channel).then_some(*id))
			.collect();
		dropped.sort();
		dropped
	}

	pub fn wanted(&self, session: SessionId) -> Vec<ChannelName> {
		self.subscribers
			.get(&session)
			.map(|r| r.wanted.iter().cloned().collect())
			.unwrap_or_default()
	}

	#[cfg(test)]
	pub fn wants(&self, session: SessionId, channel: &ChannelName) -> bool {
		self.subscribers.get(&session).is_some_and(|r| r.wanted.contains(channel))
	}

	pub fn refcount(&self, channel: &ChannelName) -> u64 {
		self.refcounts.get(channel).copied().unwrap_or(0)
	}

	/// Channels with a non-zero refcount.
	pub fn demanded_channels(&self) -> BTreeSet<ChannelName> {
		self.refcounts.keys().cloned().collect()
	}

	/// Returns the current `(channel -> refcount)` snapshot.
	#[cfg(test)]
	pub fn refcounts_snapshot(&self) -> HashMap<ChannelName, u64> {
		self.refcounts.clone()
	}

	pub fn subscriber_count(&self) -> usize {
		self.subscribers.len()
	}

	fn decrement(&mut self, channel: &ChannelName) -> bool {
		match self.refcounts.get_mut(channel) {
			Some(rc) if *rc > 1 => {
				*rc -= 1;
				false
			}
			Some(_) => {
				self.refcounts.remove(channel);
				true
			}
			None => false,
		}
	}
}
