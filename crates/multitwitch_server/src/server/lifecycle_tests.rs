#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use multitwitch_domain::{ChannelName, ChatMessage, ChatStatusKind, MessageFlags, SessionId};
use multitwitch_platform::{
	ConnectionPool, ConnectionState, IrcConnector, IrcLink, LoopbackConnector, PoolConfig, PoolError,
};
use multitwitch_protocol::{ClientEvent, ServerEvent};
use tokio::sync::{Semaphore, mpsc};
use tokio::time::{Instant, timeout};

use crate::server::history::{HistoryConfig, RecentHistory};
use crate::server::lifecycle::{SubscribeError, SubscriptionManager};
use crate::server::room_hub::{ChannelHub, ChannelHubConfig};
use crate::server::router::{RouterConfig, spawn_ingest_router};

fn ch(name: &str) -> ChannelName {
	ChannelName::new(name).expect("valid channel")
}

fn test_pool_config() -> PoolConfig {
	PoolConfig {
		nick: Some("tester".to_string()),
		ack_timeout: Duration::from_millis(200),
		handshake_timeout: Duration::from_secs(2),
		reconnect_min_delay: Duration::from_millis(10),
		reconnect_max_delay: Duration::from_millis(50),
		..PoolConfig::default()
	}
}

struct Harness {
	net: LoopbackConnector,
	pool: ConnectionPool,
	hub: ChannelHub,
	history: RecentHistory,
	manager: SubscriptionManager,
}

fn harness_with(connector: Arc<dyn IrcConnector>, net: LoopbackConnector) -> Harness {
	let pool = ConnectionPool::start(test_pool_config(), connector);
	let hub = ChannelHub::new(ChannelHubConfig::default());
	let history = RecentHistory::new(HistoryConfig::default());
	let _router = spawn_ingest_router(&pool, hub.clone(), history.clone(), RouterConfig::default());
	let manager = SubscriptionManager::new(pool.clone(), hub.clone(), history.clone());
	let _watcher = manager.spawn_pool_watcher();
	Harness {
		net,
		pool,
		hub,
		history,
		manager,
	}
}

fn harness() -> Harness {
	let net = LoopbackConnector::new();
	harness_with(Arc::new(net.clone()), net)
}

async fn session(h: &Harness) -> (SessionId, mpsc::Receiver<ServerEvent>) {
	let id = SessionId::new_v4();
	let rx = h.manager.register_subscriber(id).await;
	(id, rx)
}

async fn next_event(rx: &mut mpsc::Receiver<ServerEvent>) -> ServerEvent {
	timeout(Duration::from_secs(2), rx.recv())
		.await
		.expect("event within timeout")
		.expect("queue open")
}

async fn next_status(rx: &mut mpsc::Receiver<ServerEvent>) -> (String, ChatStatusKind, String) {
	loop {
		if let ServerEvent::ChatStatus {
			channel,
			status,
			message,
		} = next_event(rx).await
		{
			return (channel, status, message);
		}
	}
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
	let deadline = Instant::now() + Duration::from_secs(2);
	while Instant::now() < deadline {
		if cond() {
			return;
		}
		tokio::time::sleep(Duration::from_millis(5)).await;
	}
	panic!("timed out waiting for {what}");
}

async fn wait_detached(h: &Harness, session: SessionId, channel: &ChannelName) {
	let deadline = Instant::now() + Duration::from_secs(2);
	while h.hub.is_attached(session, channel).await {
		assert!(Instant::now() < deadline, "{session} still attached to {channel}");
		tokio::time::sleep(Duration::from_millis(5)).await;
	}
}

/// Holds every connect until the test releases a permit.
struct GatedConnector {
	inner: LoopbackConnector,
	gate: Arc<Semaphore>,
}

#[async_trait::async_trait]
impl IrcConnector for GatedConnector {
	async fn connect(&self) -> anyhow::Result<IrcLink> {
		let permit = self.gate.acquire().await?;
		permit.forget();
		self.inner.connect().await
	}

	fn describe(&self) -> String {
		"gated".to_string()
	}
}

fn chat(channel: &str, id: &str) -> Arc<ChatMessage> {
	Arc::new(ChatMessage {
		id: id.to_string(),
		channel: ch(channel),
		username: "Viewer".to_string(),
		login: "viewer".to_string(),
		text: format!("message {id}"),
		color: "#FF4500".to_string(),
		badges: Vec::new(),
		emotes: Vec::new(),
		sent_at_ms: crate::util::time::unix_ms_now(),
		flags: MessageFlags::default(),
		user_type: "viewer".to_string(),
	})
}

#[tokio::test]
async fn two_subscribers_share_one_join_until_the_last_leaves() {
	let net = LoopbackConnector::new();
	let gate = Arc::new(Semaphore::new(0));
	let h = harness_with(
		Arc::new(GatedConnector {
			inner: net.clone(),
			gate: gate.clone(),
		}),
		net,
	);
	let foo = ch("foo");
	let (s1, mut rx1) = session(&h).await;
	let (s2, mut rx2) = session(&h).await;
	assert_eq!(h.pool.state(), ConnectionState::Disconnected);

	let first = {
		let manager = h.manager.clone();
		let foo = foo.clone();
		tokio::spawn(async move { manager.subscribe(s1, &foo).await })
	};

	let mut state = h.pool.state_watch();
	timeout(Duration::from_secs(2), state.wait_for(|s| *s == ConnectionState::Connecting))
		.await
		.expect("reaches Connecting")
		.expect("watch open");

	gate.add_permits(1);
	first.await.expect("subscribe task").expect("subscribe ok");

	assert_eq!(h.pool.state(), ConnectionState::Connected);
	assert_eq!(h.manager.refcount(&foo), 1);
	assert!(h.pool.is_joined(&foo));
	assert_eq!(next_status(&mut rx1).await.1, ChatStatusKind::Connected);

	h.manager.subscribe(s2, &foo).await.expect("second subscribe");
	assert_eq!(h.manager.refcount(&foo), 2);
	assert_eq!(h.net.count_sent("JOIN #foo"), 1);
	assert_eq!(next_status(&mut rx2).await.1, ChatStatusKind::Connected);

	h.manager.disconnect_subscriber(s1).await;
	assert_eq!(h.manager.refcount(&foo), 1);
	assert!(h.pool.is_joined(&foo));
	assert_eq!(h.net.count_sent("PART #foo"), 0);

	h.manager.unsubscribe(s2, &foo).await.expect("unsubscribe");
	assert_eq!(h.manager.refcount(&foo), 0);
	assert!(!h.pool.is_joined(&foo));
	assert_eq!(h.net.count_sent("PART #foo"), 1);
}

#[tokio::test]
async fn concurrent_subscribes_issue_exactly_one_join() {
	let h = harness();
	let foo = ch("foo");

	let mut tasks = Vec::new();
	let mut receivers = Vec::new();
	for _ in 0..8 {
		let (id, rx) = session(&h).await;
		receivers.push(rx);
		let manager = h.manager.clone();
		let foo = foo.clone();
		tasks.push(tokio::spawn(async move { manager.subscribe(id, &foo).await }));
	}
	for result in futures::future::join_all(tasks).await {
		result.expect("task").expect("subscribe ok");
	}

	assert_eq!(h.manager.refcount(&foo), 8);
	assert_eq!(h.net.count_sent("JOIN #foo"), 1);
}

#[tokio::test]
async fn concurrent_unsubscribes_issue_exactly_one_part() {
	let h = harness();
	let foo = ch("foo");

	let mut ids = Vec::new();
	let mut receivers = Vec::new();
	for _ in 0..6 {
		let (id, rx) = session(&h).await;
		h.manager.subscribe(id, &foo).await.expect("subscribe");
		ids.push(id);
		receivers.push(rx);
	}

	let tasks: Vec<_> = ids
		.into_iter()
		.map(|id| {
			let manager = h.manager.clone();
			let foo = foo.clone();
			tokio::spawn(async move { manager.unsubscribe(id, &foo).await })
		})
		.collect();
	for result in futures::future::join_all(tasks).await {
		result.expect("task").expect("unsubscribe ok");
	}

	assert_eq!(h.manager.refcount(&foo), 0);
	assert_eq!(h.net.count_sent("PART #foo"), 1);
	assert!(!h.pool.is_joined(&foo));
}

#[tokio::test]
async fn disconnect_releases_each_wanted_channel_once() {
	let h = harness();
	let (s1, _rx1) = session(&h).await;
	let (s2, _rx2) = session(&h).await;

	h.manager.subscribe(s1, &ch("a")).await.unwrap();
	h.manager.subscribe(s1, &ch("b")).await.unwrap();
	h.manager.subscribe(s2, &ch("b")).await.unwrap();

	h.manager.disconnect_subscriber(s1).await;

	assert_eq!(h.manager.refcount(&ch("a")), 0);
	assert_eq!(h.manager.refcount(&ch("b")), 1);
	assert_eq!(h.net.count_sent("PART #a"), 1);
	assert_eq!(h.net.count_sent("PART #b"), 0);
	assert_eq!(h.pool.joined_channels(), vec![ch("b")]);
	assert!(!h.manager.is_registered(s1));
	assert_eq!(h.manager.subscriber_count(), 1);

	assert_eq!(
		h.manager.subscribe(s1, &ch("c")).await,
		Err(SubscribeError::UnknownSubscriber)
	);
}

#[tokio::test]
async fn failed_join_rolls_back_so_a_retry_joins_again() {
	let h = harness();
	let foo = ch("foo");
	let (s1, mut rx) = session(&h).await;
	h.net.set_ack_joins(false);

	let err = h.manager.subscribe(s1, &foo).await.unwrap_err();
	assert_eq!(err, SubscribeError::Pool(PoolError::JoinTimeout(foo.clone())));
	assert_eq!(err.status_kind(), ChatStatusKind::Failed);
	assert_eq!(h.manager.refcount(&foo), 0);
	assert!(h.manager.wanted_channels(s1).is_empty());
	assert!(!h.pool.is_joined(&foo));

	h.net.set_ack_joins(true);
	h.manager.subscribe(s1, &foo).await.expect("retry succeeds");
	assert_eq!(h.manager.refcount(&foo), 1);
	assert_eq!(h.net.count_sent("JOIN #foo"), 2);
	assert_eq!(next_status(&mut rx).await.1, ChatStatusKind::Connected);
}

#[tokio::test]
async fn rejected_join_is_reported_as_failed() {
	let h = harness();
	let (s1, mut rx) = session(&h).await;
	h.net.reject_channel("banned", "msg_channel_suspended");

	h.manager
		.handle_client_event(s1, ClientEvent::JoinChannelChat("Banned".to_string()))
		.await;

	let (channel, status, message) = next_status(&mut rx).await;
	assert_eq!(channel, "Banned");
	assert_eq!(status, ChatStatusKind::Failed);
	assert!(message.starts_with("Failed to connect to Banned chat"), "{message}");
	assert_eq!(h.manager.refcount(&ch("banned")), 0);
}

#[tokio::test]
async fn invalid_channel_names_fail_without_touching_the_pool() {
	let h = harness();
	let (s1, mut rx) = session(&h).await;

	h.manager
		.handle_client_event(s1, ClientEvent::JoinChannelChat("not a channel!".to_string()))
		.await;

	let (channel, status, _) = next_status(&mut rx).await;
	assert_eq!(channel, "not a channel!");
	assert_eq!(status, ChatStatusKind::Failed);
	assert_eq!(h.net.connects(), 0);
	assert_eq!(h.pool.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn leave_acknowledges_with_disconnected_status() {
	let h = harness();
	let (s1, mut rx) = session(&h).await;

	h.manager
		.handle_client_event(s1, ClientEvent::JoinChannelChat("#Foo".to_string()))
		.await;
	let (channel, status, message) = next_status(&mut rx).await;
	assert_eq!((channel.as_str(), status), ("foo", ChatStatusKind::Connected));
	assert_eq!(message, "Connected to foo chat");

	h.manager
		.handle_client_event(s1, ClientEvent::LeaveChannelChat("foo".to_string()))
		.await;
	let (channel, status, _) = next_status(&mut rx).await;
	assert_eq!((channel.as_str(), status), ("foo", ChatStatusKind::Disconnected));

	// Leaving again is a no-op that still acknowledges.
	h.manager
		.handle_client_event(s1, ClientEvent::LeaveChannelChat("foo".to_string()))
		.await;
	assert_eq!(next_status(&mut rx).await.1, ChatStatusKind::Disconnected);
	assert_eq!(h.net.count_sent("PART #foo"), 1);
}

#[tokio::test]
async fn failed_leave_keeps_channel_joined_until_reconcile() {
	let h = harness();
	let foo = ch("foo");
	let (s1, _rx) = session(&h).await;
	h.manager.subscribe(s1, &foo).await.unwrap();

	h.net.set_ack_parts(false);
	let err = h.manager.unsubscribe(s1, &foo).await.unwrap_err();
	assert_eq!(err, SubscribeError::Pool(PoolError::LeaveTimeout(foo.clone())));
	assert_eq!(h.manager.refcount(&foo), 0);
	assert!(h.pool.is_joined(&foo));

	h.net.set_ack_parts(true);
	assert_eq!(h.manager.reconcile().await, 1);
	assert!(!h.pool.is_joined(&foo));
	assert_eq!(h.manager.reconcile().await, 0);
}

#[tokio::test]
async fn subscribe_replays_recent_history_after_connected() {
	let h = harness();
	let foo = ch("foo");
	h.history.push(chat("foo", "1"));
	h.history.push(chat("foo", "2"));

	let (s1, mut rx) = session(&h).await;
	h.manager.subscribe(s1, &foo).await.unwrap();

	assert_eq!(next_status(&mut rx).await.1, ChatStatusKind::Connected);
	match next_event(&mut rx).await {
		ServerEvent::ChatHistory { channel, messages } => {
			assert_eq!(channel, foo);
			let ids: Vec<&str> = messages.iter().map(|m| m.id.as_str()).collect();
			assert_eq!(ids, vec!["1", "2"]);
		}
		other => panic!("expected chat-history, got: {other:?}"),
	}
}

#[tokio::test]
async fn disconnect_waits_for_in_flight_subscribe_and_releases_it() {
	let h = harness();
	let foo = ch("foo");
	let (s1, _rx) = session(&h).await;
	h.net.set_ack_joins(false);

	let subscribe = {
		let manager = h.manager.clone();
		let foo = foo.clone();
		tokio::spawn(async move { manager.subscribe(s1, &foo).await })
	};
	wait_until("JOIN on the wire", || h.net.count_sent("JOIN #foo") == 1).await;

	let disconnect = {
		let manager = h.manager.clone();
		tokio::spawn(async move { manager.disconnect_subscriber(s1).await })
	};
	tokio::time::sleep(Duration::from_millis(30)).await;
	assert!(!disconnect.is_finished(), "disconnect must wait for the channel lock");

	assert!(h.net.inject(":tester!tester@tester.tmi.twitch.tv JOIN #foo"));
	subscribe.await.expect("subscribe task").expect("join acknowledged");

	timeout(Duration::from_secs(2), disconnect)
		.await
		.expect("disconnect finishes")
		.expect("disconnect task");

	assert_eq!(h.manager.refcount(&foo), 0);
	assert!(!h.pool.is_joined(&foo));
	assert_eq!(h.net.count_sent("PART #foo"), 1);
	assert!(!h.manager.is_registered(s1));
}

#[tokio::test]
async fn routed_messages_reach_only_subscribed_sessions() {
	let h = harness();
	let (s1, mut rx1) = session(&h).await;
	let (s2, mut rx2) = session(&h).await;
	h.manager.subscribe(s1, &ch("a")).await.unwrap();
	h.manager.subscribe(s2, &ch("b")).await.unwrap();
	next_status(&mut rx1).await;
	next_status(&mut rx2).await;

	assert!(h.net.inject("@id=m1;display-name=Viewer :viewer!viewer@viewer.tmi.twitch.tv PRIVMSG #a :hello a"));
	assert!(h.net.inject("@id=m2;display-name=Viewer :viewer!viewer@viewer.tmi.twitch.tv PRIVMSG #b :hello b"));

	match next_event(&mut rx1).await {
		ServerEvent::ChatMessage(m) => assert_eq!((m.id.as_str(), m.text.as_str()), ("m1", "hello a")),
		other => panic!("expected chat-message, got: {other:?}"),
	}
	match next_event(&mut rx2).await {
		ServerEvent::ChatMessage(m) => assert_eq!(m.id, "m2"),
		other => panic!("expected chat-message, got: {other:?}"),
	}
	assert!(timeout(Duration::from_millis(50), rx1.recv()).await.is_err());
}

#[tokio::test]
async fn connection_loss_is_reported_then_recovered() {
	let h = harness();
	let foo = ch("foo");
	let (s1, mut rx) = session(&h).await;
	h.manager.subscribe(s1, &foo).await.unwrap();
	next_status(&mut rx).await;

	assert!(h.net.drop_connection());

	let (channel, status, _) = next_status(&mut rx).await;
	assert_eq!((channel.as_str(), status), ("foo", ChatStatusKind::Error));

	let (channel, status, _) = next_status(&mut rx).await;
	assert_eq!((channel.as_str(), status), ("foo", ChatStatusKind::Connected));
	assert_eq!(h.net.count_sent("JOIN #foo"), 2);
	assert_eq!(h.manager.refcount(&foo), 1);
}

#[tokio::test]
async fn refused_rejoin_fails_the_channel_and_releases_its_subscribers() {
	let h = harness();
	let (s1, mut rx1) = session(&h).await;
	let (s2, mut rx2) = session(&h).await;
	h.manager.subscribe(s1, &ch("foo")).await.unwrap();
	h.manager.subscribe(s1, &ch("bar")).await.unwrap();
	h.manager.subscribe(s2, &ch("bar")).await.unwrap();
	next_status(&mut rx1).await;
	next_status(&mut rx1).await;
	next_status(&mut rx2).await;

	h.net.reject_channel("bar", "msg_channel_suspended");
	assert!(h.net.drop_connection());

	let mut seen = Vec::new();
	while !(seen.contains(&("foo".to_string(), ChatStatusKind::Connected))
		&& seen.contains(&("bar".to_string(), ChatStatusKind::Failed)))
	{
		let (channel, status, _) = next_status(&mut rx1).await;
		seen.push((channel, status));
	}
	assert!(
		!seen.contains(&("bar".to_string(), ChatStatusKind::Connected)),
		"refused channel reported connected: {seen:?}"
	);

	loop {
		let (channel, status, message) = next_status(&mut rx2).await;
		assert_eq!(channel, "bar");
		assert_ne!(status, ChatStatusKind::Connected);
		if status == ChatStatusKind::Failed {
			assert!(message.contains("unavailable"), "{message}");
			break;
		}
	}

	assert_eq!(h.manager.refcount(&ch("bar")), 0);
	assert_eq!(h.manager.refcount(&ch("foo")), 1);
	assert_eq!(h.manager.wanted_channels(s1), vec![ch("foo")]);
	assert!(h.manager.wanted_channels(s2).is_empty());
	assert!(!h.pool.is_joined(&ch("bar")));
	assert!(h.pool.is_joined(&ch("foo")));
	wait_detached(&h, s1, &ch("bar")).await;
	wait_detached(&h, s2, &ch("bar")).await;
	assert!(h.hub.is_attached(s1, &ch("foo")).await);
	assert_eq!(h.manager.reconcile().await, 0);
}

#[tokio::test]
async fn server_part_fails_the_channel_until_resubscribed() {
	let h = harness();
	let foo = ch("foo");
	let (s1, mut rx) = session(&h).await;
	h.manager.subscribe(s1, &foo).await.unwrap();
	next_status(&mut rx).await;

	assert!(h.net.inject(":tester!tester@tester.tmi.twitch.tv PART #foo"));

	let (channel, status, message) = next_status(&mut rx).await;
	assert_eq!((channel.as_str(), status), ("foo", ChatStatusKind::Failed));
	assert!(message.contains("removed from the channel"), "{message}");
	assert_eq!(h.manager.refcount(&foo), 0);
	assert!(h.manager.wanted_channels(s1).is_empty());
	assert!(!h.pool.is_joined(&foo));
	wait_detached(&h, s1, &foo).await;

	assert!(h.net.inject("@id=gone;display-name=Viewer :viewer!viewer@viewer.tmi.twitch.tv PRIVMSG #foo :hi"));
	assert!(timeout(Duration::from_millis(50), rx.recv()).await.is_err());

	h.manager.subscribe(s1, &foo).await.expect("resubscribe");
	assert_eq!(h.net.count_sent("JOIN #foo"), 2);
	assert_eq!(next_status(&mut rx).await.1, ChatStatusKind::Connected);
	assert!(h.hub.is_attached(s1, &foo).await);
}
