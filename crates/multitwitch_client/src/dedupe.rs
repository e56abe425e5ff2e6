#![forbid(unsafe_code)]

use std::collections::{HashSet, VecDeque};

/// Remembers the most recent message ids and reports repeats.
///
/// Oldest ids are forgotten first once `capacity` is reached, so a replay older
/// than the window is delivered again.
#[derive(Debug, Clone)]
pub struct MessageDeduper {
	capacity: usize,
	seen: HashSet<String>,
	order: VecDeque<String>,
}

impl MessageDeduper {
	pub fn new(capacity: usize) -> Self {
		let capacity = capacity.max(1);
		Self {
			capacity,
			seen: HashSet::with_capacity(capacity),
			order: VecDeque::with_capacity(capacity),
		}
	}

	/// Record `id`. Returns false when it was already recorded.
	pub fn insert(&mut self, id: &str) -> bool {
		if self.seen.contains(id) {
			return false;
		}
		if self.order.len() >= self.capacity
			&& let Some(oldest) = self.order.pop_front()
		{
			self.seen.remove(&oldest);
		}
		self.seen.insert(id.to_string());
		self.order.push_back(id.to_string());
		true
	}

	pub fn contains(&self, id: &str) -> bool {
		self.seen.contains(id)
	}

	pub fn len(&self) -> usize {
		self.order.len()
	}

	pub fn is_empty(&self) -> bool {
		self.order.is_empty()
	}
}
