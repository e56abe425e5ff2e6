#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashMap};

use multitwitch_domain::{ChannelName, SessionId};
use proptest::prelude::*;

use crate::server::state::{StateError, SubscriptionState, UnwantOutcome, WantOutcome};

fn channel(name: &str) -> ChannelName {
	ChannelName::new(name).expect("valid channel")
}

#[test]
fn first_and_last_transitions_are_reported() {
	let mut st = SubscriptionState::default();
	let s1 = SessionId::new_v4();
	let s2 = SessionId::new_v4();
	let foo = channel("foo");
	st.register(s1);
	st.register(s2);

	assert_eq!(st.want(s1, &foo), Ok(WantOutcome::Added { first: true }));
	assert_eq!(st.want(s2, &foo), Ok(WantOutcome::Added { first: false }));
	assert_eq!(st.refcount(&foo), 2);

	assert_eq!(st.unwant(s1, &foo), Ok(UnwantOutcome::Removed { last: false }));
	assert_eq!(st.unwant(s2, &foo), Ok(UnwantOutcome::Removed { last: true }));
	assert_eq!(st.refcount(&foo), 0);
	assert!(st.demanded_channels().is_empty());
}

#[test]
fn repeated_want_and_unwant_are_noops() {
	let mut st = SubscriptionState::default();
	let s1 = SessionId::new_v4();
	let foo = channel("foo");
	st.register(s1);

	st.want(s1, &foo).unwrap();
	assert_eq!(st.want(s1, &foo), Ok(WantOutcome::AlreadyWanted));
	assert_eq!(st.refcount(&foo), 1);

	st.unwant(s1, &foo).unwrap();
	assert_eq!(st.unwant(s1, &foo), Ok(UnwantOutcome::NotWanted));
	assert_eq!(st.refcount(&foo), 0);
}

#[test]
fn unknown_and_closing_subscribers_are_refused() {
	let mut st = SubscriptionState::default();
	let s1 = SessionId::new_v4();
	let foo = channel("foo");

	assert_eq!(st.want(s1, &foo), Err(StateError::UnknownSubscriber));

	st.register(s1);
	st.want(s1, &foo).unwrap();
	assert!(!st.is_closing(s1));
	assert_eq!(st.mark_closing(s1), Some(vec![foo.clone()]));
	assert!(st.is_closing(s1));
	assert_eq!(st.want(s1, &channel("bar")), Err(StateError::SubscriberClosed));

	// Draining a closing subscriber still works.
	assert_eq!(st.unwant(s1, &foo), Ok(UnwantOutcome::Removed { last: true }));
}

#[test]
fn remove_releases_remaining_wants() {
	let mut st = SubscriptionState::default();
	let s1 = SessionId::new_v4();
	let s2 = SessionId::new_v4();
	st.register(s1);
	st.register(s2);
	st.want(s1, &channel("a")).unwrap();
	st.want(s1, &channel("b")).unwrap();
	st.want(s2, &channel("b")).unwrap();

	let released = st.remove(s1);
	assert_eq!(released, vec![channel("a")]);
	assert_eq!(st.refcount(&channel("b")), 1);
	assert!(!st.is_registered(s1));
	assert!(st.remove(s1).is_empty());
}

#[test]
fn drop_channel_clears_every_want() {
	let mut st = SubscriptionState::default();
	let sessions = [SessionId::new_v4(), SessionId::new_v4(), SessionId::new_v4()];
	for s in &sessions {
		st.register(*s);
	}
	st.want(sessions[0], &channel("a")).unwrap();
	st.want(sessions[0], &channel("b")).unwrap();
	st.want(sessions[1], &channel("a")).unwrap();
	st.want(sessions[2], &channel("b")).unwrap();

	let mut expected = vec![sessions[0], sessions[1]];
	expected.sort();
	assert_eq!(st.drop_channel(&channel("a")), expected);
	assert_eq!(st.refcount(&channel("a")), 0);
	assert_eq!(st.wanted(sessions[0]), vec![channel("b")]);
	assert!(st.wanted(sessions[1]).is_empty());
	assert_eq!(st.refcount(&channel("b")), 2);
	assert!(st.drop_channel(&channel("a")).is_empty());

	// A dropped channel can be wanted again from zero.
	assert_eq!(st.want(sessions[0], &channel("a")), Ok(WantOutcome::Added { first: true }));
}

#[test]
fn register_is_unique() {
	let mut st = SubscriptionState::default();
	let s1 = SessionId::new_v4();
	assert!(st.register(s1));
	assert!(!st.register(s1));
	assert_eq!(st.subscriber_count(), 1);
}

#[derive(Debug, Clone)]
enum Op {
	Want(usize, usize),
	Unwant(usize, usize),
	Remove(usize),
	Lose(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
	prop_oneof![
		4 => (0..4usize, 0..3usize).prop_map(|(s, c)| Op::Want(s, c)),
		3 => (0..4usize, 0..3usize).prop_map(|(s, c)| Op::Unwant(s, c)),
		1 => (0..4usize).prop_map(Op::Remove),
		1 => (0..3usize).prop_map(Op::Lose),
	]
}

proptest! {
	/// Replays the transitions against a model "joined" set: a join for every
	/// 0→1 transition, a leave for every 1→0 transition. Afterwards the joined
	/// set must equal the set of channels somebody wants.
	#[test]
	fn refcounts_track_wanted_sets(ops in proptest::collection::vec(op_strategy(), 0..200)) {
		let sessions: Vec<SessionId> = (0..4).map(|_| SessionId::new_v4()).collect();
		let channels: Vec<ChannelName> = ["a", "b", "c"].iter().map(|c| channel(c)).collect();

		let mut st = SubscriptionState::default();
		let mut joined: BTreeSet<ChannelName> = BTreeSet::new();
		let mut joins: HashMap<ChannelName, u32> = HashMap::new();
		let mut leaves: HashMap<ChannelName, u32> = HashMap::new();

		for s in &sessions {
			st.register(*s);
		}

		for op in ops {
			match op {
				Op::Want(s, c) => {
					if !st.is_registered(sessions[s]) {
						st.register(sessions[s]);
					}
					if let Ok(WantOutcome::Added { first: true }) = st.want(sessions[s], &channels[c]) {
						prop_assert!(joined.insert(channels[c].clone()));
						*joins.entry(channels[c].clone()).or_default() += 1;
					}
				}
				Op::Unwant(s, c) => {
					if let Ok(UnwantOutcome::Removed { last: true }) = st.unwant(sessions[s], &channels[c]) {
						prop_assert!(joined.remove(&channels[c]));
						*leaves.entry(channels[c].clone()).or_default() += 1;
					}
				}
				Op::Remove(s) => {
					for c in st.remove(sessions[s]) {
						prop_assert!(joined.remove(&c));
						*leaves.entry(c).or_default() += 1;
					}
				}
				// The pool dropped the channel on its own; no PART is owed.
				Op::Lose(c) => {
					if !st.drop_channel(&channels[c]).is_empty() {
						prop_assert!(joined.remove(&channels[c]));
						*leaves.entry(channels[c].clone()).or_default() += 1;
					}
				}
			}

			let snapshot = st.refcounts_snapshot();
			for c in &channels {
				let wanted_by = sessions.iter().filter(|s| st.wants(**s, c)).count() as u64;
				prop_assert_eq!(st.refcount(c), wanted_by);
				prop_assert_eq!(snapshot.get(c).copied().unwrap_or(0), wanted_by);
				prop_assert_eq!(wanted_by > 0, joined.contains(c));
			}
			prop_assert!(snapshot.values().all(|rc| *rc > 0));
		}

		for c in &channels {
			let j = joins.get(c).copied().unwrap_or(0);
			let l = leaves.get(c).copied().unwrap_or(0);
			let open = u32::from(joined.contains(c));
			prop_assert_eq!(j, l + open);
		}
	}
}
