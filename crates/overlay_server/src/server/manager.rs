#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use overlay_domain::{BroadcasterId, Condition, SubscriberId};
use overlay_twitch::reader::{ReaderConfig, ReaderHandle};
use overlay_twitch::{Event, EventRx, EventTx, SecretString};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Multiplexer configuration.
///
/// Subscriber sinks are bounded channels created by the caller of
/// [`ChatManager::join`]; their capacity is an adapter concern.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
	/// Capacity of the readers → manager event channel.
	pub event_channel_capacity: usize,

	pub command_channel_capacity: usize,

	/// Period of the idle-reader sweep.
	pub sweep_interval: Duration,
}

impl Default for ManagerConfig {
	fn default() -> Self {
		Self {
			event_channel_capacity: 1024,
			command_channel_capacity: 64,
			sweep_interval: Duration::from_secs(30),
		}
	}
}

/// Everything needed to start one upstream reader.
pub struct ReaderSpec {
	pub access_token: SecretString,
	pub condition: Condition,
	pub events_tx: EventTx,
}

/// Seam for starting upstream readers (stubbed in tests).
pub trait ReaderSpawner: Send + Sync + 'static {
	fn spawn_reader(&self, spec: ReaderSpec) -> ReaderHandle;
}

/// Production spawner backed by the upstream eventsub reader.
pub struct TwitchReaderSpawner {
	cfg: ReaderConfig,
}

impl TwitchReaderSpawner {
	pub fn new(cfg: ReaderConfig) -> Self {
		Self { cfg }
	}
}

impl ReaderSpawner for TwitchReaderSpawner {
	fn spawn_reader(&self, spec: ReaderSpec) -> ReaderHandle {
		overlay_twitch::reader::spawn(self.cfg.clone(), spec.access_token, spec.condition, spec.events_tx)
	}
}

enum ManagerCommand {
	Join {
		access_token: SecretString,
		condition: Condition,
		sink: mpsc::Sender<Event>,
		resp: oneshot::Sender<SubscriberId>,
	},

	Part {
		channel: BroadcasterId,
		subscriber: SubscriberId,
	},

	ReaderExited {
		channel: BroadcasterId,
		reader_id: u64,
	},
}

/// Handle to the connection multiplexer actor.
///
/// One upstream reader exists per broadcaster channel regardless of the
/// number of subscribers; all shared state lives inside the single actor
/// task, reached only through the command channel. Safe to clone and call
/// from any number of connection handlers.
#[derive(Clone)]
pub struct ChatManager {
	cmd_tx: mpsc::Sender<ManagerCommand>,
}

impl ChatManager {
	/// Start the multiplexer actor.
	pub fn start(spawner: Arc<dyn ReaderSpawner>, cfg: ManagerConfig) -> Self {
		let (cmd_tx, cmd_rx) = mpsc::channel(cfg.command_channel_capacity);
		let (events_tx, events_rx) = mpsc::channel(cfg.event_channel_capacity);

		let actor = ManagerActor {
			cfg,
			spawner,
			cmd_tx: cmd_tx.clone(),
			cmd_rx,
			events_tx,
			events_rx,
			readers: HashMap::new(),
			subscribers: HashMap::new(),
			next_reader_id: 0,
		};

		tokio::spawn(actor.run());

		Self { cmd_tx }
	}

	/// Attach `sink` to the broadcaster channel in `condition`, starting
	/// an upstream reader for it when none exists.
	///
	/// Returns the subscriber id the caller passes to [`ChatManager::part`].
	pub async fn join(
		&self,
		access_token: SecretString,
		condition: Condition,
		sink: mpsc::Sender<Event>,
	) -> anyhow::Result<SubscriberId> {
		let (resp_tx, resp_rx) = oneshot::channel();

		self.cmd_tx
			.send(ManagerCommand::Join {
				access_token,
				condition,
				sink,
				resp: resp_tx,
			})
			.await
			.map_err(|_| anyhow!("manager actor stopped"))?;

		resp_rx.await.map_err(|_| anyhow!("manager actor dropped join response"))
	}

	/// Detach one subscriber from a broadcaster channel. Idempotent; the
	/// idle sweep tears the reader down once the channel has no subscribers.
	pub async fn part(&self, channel: BroadcasterId, subscriber: SubscriberId) {
		let _ = self.cmd_tx.send(ManagerCommand::Part { channel, subscriber }).await;
	}
}

struct RunningReader {
	id: u64,
	handle: ReaderHandle,
}

struct Subscriber {
	sink: mpsc::Sender<Event>,

	/// Events dropped for this subscriber because its queue was full.
	dropped: u64,
}

struct ManagerActor {
	cfg: ManagerConfig,
	spawner: Arc<dyn ReaderSpawner>,

	cmd_tx: mpsc::Sender<ManagerCommand>,
	cmd_rx: mpsc::Receiver<ManagerCommand>,

	events_tx: EventTx,
	events_rx: EventRx,

	readers: HashMap<BroadcasterId, RunningReader>,
	subscribers: HashMap<BroadcasterId, HashMap<SubscriberId, Subscriber>>,

	next_reader_id: u64,
}

impl ManagerActor {
	async fn run(mut self) {
		info!(sweep_interval_secs = self.cfg.sweep_interval.as_secs(), "chat manager started");

		let mut sweep = tokio::time::interval(self.cfg.sweep_interval);
		sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

		loop {
			tokio::select! {
				cmd = self.cmd_rx.recv() => {
					let Some(cmd) = cmd else {
						info!("chat manager command channel closed; exiting");
						break;
					};

					match cmd {
						ManagerCommand::Join { access_token, condition, sink, resp } => {
							self.handle_join(access_token, condition, sink, resp);
						}
						ManagerCommand::Part { channel, subscriber } => {
							self.handle_part(channel, subscriber);
						}
						ManagerCommand::ReaderExited { channel, reader_id } => {
							self.handle_reader_exited(channel, reader_id);
						}
					}
				}

				ev = self.events_rx.recv() => {
					if let Some(ev) = ev {
						self.fan_out(ev);
					}
				}

				_ = sweep.tick() => {
					self.sweep_idle();
				}
			}
		}
	}

	fn handle_join(
		&mut self,
		access_token: SecretString,
		condition: Condition,
		sink: mpsc::Sender<Event>,
		resp: oneshot::Sender<SubscriberId>,
	) {
		let channel = condition.channel_key().clone();

		if !self.readers.contains_key(&channel) {
			self.start_reader(access_token, condition);
		}

		let subscriber = SubscriberId::random();
		let subs = self.subscribers.entry(channel.clone()).or_default();
		subs.insert(subscriber, Subscriber { sink, dropped: 0 });

		debug!(%channel, %subscriber, subscribers = subs.len(), "subscriber joined");
		metrics::counter!("overlay_manager_joins_total").increment(1);

		let _ = resp.send(subscriber);
	}

	fn handle_part(&mut self, channel: BroadcasterId, subscriber: SubscriberId) {
		let Some(subs) = self.subscribers.get_mut(&channel) else {
			return;
		};

		if subs.remove(&subscriber).is_some() {
			debug!(%channel, %subscriber, remaining = subs.len(), "subscriber parted");
			metrics::counter!("overlay_manager_parts_total").increment(1);
		}

		// An emptied set lingers until the sweep, the single owner of
		// reader teardown.
	}

	fn handle_reader_exited(&mut self, channel: BroadcasterId, reader_id: u64) {
		if self.readers.get(&channel).map(|r| r.id) != Some(reader_id) {
			// A fresh reader already replaced this one.
			return;
		}

		self.readers.remove(&channel);

		// Dropping the sinks closes every subscriber stream; adapters
		// treat closure as end-of-stream and hang up.
		match self.subscribers.remove(&channel) {
			Some(subs) if !subs.is_empty() => {
				warn!(%channel, subscribers = subs.len(), "upstream reader exited; closing subscriber streams");
			}
			_ => {
				debug!(%channel, "upstream reader exited with no subscribers");
			}
		}
	}

	fn start_reader(&mut self, access_token: SecretString, condition: Condition) {
		let channel = condition.channel_key().clone();

		let reader_id = self.next_reader_id;
		self.next_reader_id += 1;

		let mut handle = self.spawner.spawn_reader(ReaderSpec {
			access_token,
			condition,
			events_tx: self.events_tx.clone(),
		});

		if let Some(done) = handle.take_done() {
			let cmd_tx = self.cmd_tx.clone();
			let exited = channel.clone();

			tokio::spawn(async move {
				let _ = done.await;
				let _ = cmd_tx
					.send(ManagerCommand::ReaderExited {
						channel: exited,
						reader_id,
					})
					.await;
			});
		}

		info!(%channel, reader_id, "started upstream reader");
		metrics::counter!("overlay_manager_readers_started_total").increment(1);

		self.readers.insert(channel, RunningReader { id: reader_id, handle });
	}

	fn fan_out(&mut self, event: Event) {
		let channel = event.broadcaster_id.clone();

		let Some(subs) = self.subscribers.get_mut(&channel) else {
			return;
		};

		// Sinks whose adapters went away without a part call.
		subs.retain(|subscriber, sub| {
			if sub.sink.is_closed() {
				debug!(%channel, %subscriber, "pruning closed subscriber sink");
				false
			} else {
				true
			}
		});

		let mut delivered: u64 = 0;

		for (subscriber, sub) in subs.iter_mut() {
			match sub.sink.try_send(event.clone()) {
				Ok(()) => delivered += 1,

				Err(mpsc::error::TrySendError::Full(_)) => {
					sub.dropped = sub.dropped.saturating_add(1);
					metrics::counter!("overlay_manager_events_dropped_total").increment(1);
					debug!(%channel, %subscriber, dropped = sub.dropped, "subscriber queue full; dropping event");
				}

				Err(mpsc::error::TrySendError::Closed(_)) => {}
			}
		}

		metrics::counter!("overlay_manager_events_fanout_total").increment(delivered);
	}

	fn sweep_idle(&mut self) {
		let idle: Vec<BroadcasterId> = self
			.readers
			.keys()
			.filter(|channel| {
				self.subscribers
					.get(*channel)
					.map(|subs| subs.is_empty())
					.unwrap_or(true)
			})
			.cloned()
			.collect();

		for channel in idle {
			if let Some(mut running) = self.readers.remove(&channel) {
				running.handle.cancel();
				info!(%channel, reader_id = running.id, "sweep: cancelled idle upstream reader");
				metrics::counter!("overlay_manager_readers_swept_total").increment(1);
			}
			self.subscribers.remove(&channel);
		}

		// Empty subscriber sets whose reader is already gone.
		let readers = &self.readers;
		self.subscribers
			.retain(|channel, subs| !subs.is_empty() || readers.contains_key(channel));
	}
}
