#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use overlay_domain::{BroadcasterId, Condition, UserId};
use overlay_twitch::reader::ReaderHandle;
use overlay_twitch::{ChatMessageEvent, Event, EventPayload, EventTx, SecretString};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use crate::server::manager::{ChatManager, ManagerConfig, ReaderSpawner, ReaderSpec};

struct SpawnedReader {
	condition: Condition,
	events_tx: EventTx,
	kill: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct StubState {
	spawned: Vec<SpawnedReader>,
}

/// Spawner whose "readers" are inert tasks the test can feed or kill.
#[derive(Clone, Default)]
struct StubSpawner {
	state: Arc<Mutex<StubState>>,
}

impl StubSpawner {
	fn new() -> Self {
		Self::default()
	}

	fn spawn_count(&self) -> usize {
		self.state.lock().spawned.len()
	}

	fn condition(&self, idx: usize) -> Condition {
		self.state.lock().spawned[idx].condition.clone()
	}

	fn events_tx(&self, idx: usize) -> EventTx {
		self.state.lock().spawned[idx].events_tx.clone()
	}

	/// Simulate the upstream reader dying on its own.
	fn kill(&self, idx: usize) {
		if let Some(tx) = self.state.lock().spawned[idx].kill.take() {
			let _ = tx.send(());
		}
	}
}

impl ReaderSpawner for StubSpawner {
	fn spawn_reader(&self, spec: ReaderSpec) -> ReaderHandle {
		let (cancel_tx, cancel_rx) = oneshot::channel();
		let (done_tx, done_rx) = oneshot::channel();
		let (kill_tx, kill_rx) = oneshot::channel::<()>();

		self.state.lock().spawned.push(SpawnedReader {
			condition: spec.condition,
			events_tx: spec.events_tx,
			kill: Some(kill_tx),
		});

		tokio::spawn(async move {
			// Dropped on exit so the manager observes completion.
			let _done = done_tx;

			tokio::select! {
				_ = cancel_rx => {}
				_ = kill_rx => {}
			}
		});

		ReaderHandle::new(cancel_tx, done_rx)
	}
}

fn channel(name: &str) -> BroadcasterId {
	BroadcasterId::new(name).expect("valid BroadcasterId")
}

fn condition(name: &str) -> Condition {
	Condition::new(channel(name), UserId::new("u1").expect("valid UserId"))
}

fn token() -> SecretString {
	SecretString::new("test-token")
}

fn mk_event(name: &str, text: &str) -> Event {
	Event {
		broadcaster_id: channel(name),
		broadcaster_user_name: name.to_string(),
		received_at: SystemTime::now(),
		payload: EventPayload::ChatMessage(ChatMessageEvent {
			chatter_user_name: "viewer".to_string(),
			text: text.to_string(),
			color: String::new(),
		}),
	}
}

fn chat_text(ev: Event) -> String {
	match ev.payload {
		EventPayload::ChatMessage(m) => m.text,
		other => panic!("expected ChatMessage payload, got: {other:?}"),
	}
}

fn test_config(sweep_interval: Duration) -> ManagerConfig {
	ManagerConfig {
		event_channel_capacity: 64,
		command_channel_capacity: 16,
		sweep_interval,
	}
}

/// A sweep interval long enough to never fire within a test.
const NO_SWEEP: Duration = Duration::from_secs(3600);

#[tokio::test]
async fn join_reuses_the_reader_for_a_channel() {
	let spawner = StubSpawner::new();
	let manager = ChatManager::start(Arc::new(spawner.clone()), test_config(NO_SWEEP));

	let (s1, _r1) = mpsc::channel(16);
	let (s2, _r2) = mpsc::channel(16);

	let id1 = manager.join(token(), condition("abc"), s1).await.expect("join");
	let id2 = manager.join(token(), condition("abc"), s2).await.expect("join");

	assert_ne!(id1, id2, "every join must get a fresh subscriber id");
	assert_eq!(spawner.spawn_count(), 1, "one reader per channel");
	assert_eq!(spawner.condition(0).channel_key().as_str(), "abc");

	let (s3, _r3) = mpsc::channel(16);
	manager.join(token(), condition("xyz"), s3).await.expect("join");
	assert_eq!(spawner.spawn_count(), 2, "distinct channels get distinct readers");
}

#[tokio::test]
async fn events_fan_out_to_all_sinks_for_their_channel_only() {
	let spawner = StubSpawner::new();
	let manager = ChatManager::start(Arc::new(spawner.clone()), test_config(NO_SWEEP));

	let (s1, mut r1) = mpsc::channel(16);
	let (s2, mut r2) = mpsc::channel(16);
	let (s3, mut r3) = mpsc::channel(16);

	manager.join(token(), condition("abc"), s1).await.expect("join");
	manager.join(token(), condition("abc"), s2).await.expect("join");
	manager.join(token(), condition("xyz"), s3).await.expect("join");

	spawner.events_tx(0).send(mk_event("abc", "hello")).await.expect("send");

	let e1 = timeout(Duration::from_millis(250), r1.recv())
		.await
		.expect("delivery within timeout")
		.expect("channel open");
	assert_eq!(chat_text(e1), "hello");

	let e2 = timeout(Duration::from_millis(250), r2.recv())
		.await
		.expect("delivery within timeout")
		.expect("channel open");
	assert_eq!(chat_text(e2), "hello");

	let cross = timeout(Duration::from_millis(100), r3.recv()).await;
	assert!(cross.is_err(), "sink for another channel must not receive the event");
}

#[tokio::test]
async fn a_stalled_subscriber_does_not_block_the_rest() {
	let spawner = StubSpawner::new();
	let manager = ChatManager::start(Arc::new(spawner.clone()), test_config(NO_SWEEP));

	// Capacity one and never drained: saturated after the first event.
	let (stalled, mut stalled_rx) = mpsc::channel(1);
	let (healthy, mut healthy_rx) = mpsc::channel(16);

	manager.join(token(), condition("abc"), stalled).await.expect("join");
	manager.join(token(), condition("abc"), healthy).await.expect("join");

	let tx = spawner.events_tx(0);
	for i in 0..5 {
		tx.send(mk_event("abc", &format!("m{i}"))).await.expect("send");
	}

	// The healthy subscriber gets every event, in emit order.
	for i in 0..5 {
		let ev = timeout(Duration::from_millis(250), healthy_rx.recv())
			.await
			.expect("delivery within timeout")
			.expect("channel open");
		assert_eq!(chat_text(ev), format!("m{i}"));
	}

	// The stalled subscriber kept only what fit in its queue.
	let first = stalled_rx.try_recv().expect("one queued event");
	assert_eq!(chat_text(first), "m0");
	assert!(stalled_rx.try_recv().is_err(), "overflow events are dropped, not queued");
}

#[tokio::test]
async fn idle_sweep_reclaims_the_reader_after_last_part() {
	let spawner = StubSpawner::new();
	let manager = ChatManager::start(Arc::new(spawner.clone()), test_config(Duration::from_millis(50)));

	let (s1, mut r1) = mpsc::channel(16);
	let (s2, mut r2) = mpsc::channel(16);

	let id1 = manager.join(token(), condition("abc"), s1).await.expect("join");
	let id2 = manager.join(token(), condition("abc"), s2).await.expect("join");
	assert_eq!(spawner.spawn_count(), 1);

	spawner.events_tx(0).send(mk_event("abc", "one")).await.expect("send");
	assert_eq!(
		chat_text(
			timeout(Duration::from_millis(250), r1.recv())
				.await
				.expect("delivery within timeout")
				.expect("channel open")
		),
		"one"
	);
	assert_eq!(
		chat_text(
			timeout(Duration::from_millis(250), r2.recv())
				.await
				.expect("delivery within timeout")
				.expect("channel open")
		),
		"one"
	);

	// One subscriber leaves; sweeps pass; the reader must survive.
	manager.part(channel("abc"), id1).await;
	tokio::time::sleep(Duration::from_millis(150)).await;
	assert_eq!(spawner.spawn_count(), 1);

	spawner.events_tx(0).send(mk_event("abc", "two")).await.expect("send");
	assert_eq!(
		chat_text(
			timeout(Duration::from_millis(250), r2.recv())
				.await
				.expect("delivery within timeout")
				.expect("channel open")
		),
		"two"
	);

	// Last subscriber leaves; the next sweep reclaims the reader.
	manager.part(channel("abc"), id2).await;
	tokio::time::sleep(Duration::from_millis(150)).await;

	// A fresh join starts a new reader rather than reusing a stale handle.
	let (s4, _r4) = mpsc::channel(16);
	manager.join(token(), condition("abc"), s4).await.expect("join");
	assert_eq!(spawner.spawn_count(), 2);
}

#[tokio::test]
async fn part_is_idempotent() {
	let spawner = StubSpawner::new();
	let manager = ChatManager::start(Arc::new(spawner.clone()), test_config(NO_SWEEP));

	let (s1, _r1) = mpsc::channel(16);
	let id = manager.join(token(), condition("abc"), s1).await.expect("join");

	manager.part(channel("abc"), id).await;
	manager.part(channel("abc"), id).await;
	manager.part(channel("never-joined"), id).await;

	// The channel still serves new subscribers.
	let (s2, mut r2) = mpsc::channel(16);
	manager.join(token(), condition("abc"), s2).await.expect("join");

	spawner.events_tx(0).send(mk_event("abc", "still-alive")).await.expect("send");
	let ev = timeout(Duration::from_millis(250), r2.recv())
		.await
		.expect("delivery within timeout")
		.expect("channel open");
	assert_eq!(chat_text(ev), "still-alive");

	assert_eq!(spawner.spawn_count(), 1, "no sweep ran, so the reader was never torn down");
}

#[tokio::test]
async fn reader_exit_closes_subscriber_streams_and_next_join_restarts() {
	let spawner = StubSpawner::new();
	let manager = ChatManager::start(Arc::new(spawner.clone()), test_config(NO_SWEEP));

	let (s1, mut r1) = mpsc::channel(16);
	manager.join(token(), condition("abc"), s1).await.expect("join");

	spawner.kill(0);

	// Subscribers observe end-of-stream, not an error.
	let end = timeout(Duration::from_millis(250), r1.recv())
		.await
		.expect("closure within timeout");
	assert!(end.is_none(), "sink must be closed after its reader dies");

	// A later join starts a fresh reader instead of erroring.
	let (s2, _r2) = mpsc::channel(16);
	manager.join(token(), condition("abc"), s2).await.expect("join");
	assert_eq!(spawner.spawn_count(), 2);
}
