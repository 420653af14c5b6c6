#![forbid(unsafe_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use overlay_domain::Condition;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};
use url::Url;

use crate::helix::{CreateSubscriptionError, HelixClient, SubscriptionType};
use crate::{EventTx, SecretString, eventsub};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type TwitchWs = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
pub type WsConnector = Arc<dyn Fn(Url) -> BoxFuture<'static, anyhow::Result<TwitchWs>> + Send + Sync>;

/// Upstream reader configuration.
#[derive(Clone)]
pub struct ReaderConfig {
	pub client_id: String,
	pub eventsub_ws_url: String,
	pub helix_base_url: String,

	/// Also request `channel.ban` / `channel.unban` subscriptions.
	pub subscribe_moderation: bool,

	pub ws_connector: Option<WsConnector>,
}

impl ReaderConfig {
	pub fn new(client_id: impl Into<String>) -> Self {
		Self {
			client_id: client_id.into(),
			eventsub_ws_url: "wss://eventsub.wss.twitch.tv/ws".to_string(),
			helix_base_url: "https://api.twitch.tv".to_string(),
			subscribe_moderation: true,
			ws_connector: None,
		}
	}

	fn connector(&self) -> WsConnector {
		if let Some(c) = &self.ws_connector {
			return c.clone();
		}

		Arc::new(|url: Url| {
			Box::pin(async move {
				let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str())
					.await
					.context("connect_async to eventsub ws")?;
				Ok(ws)
			}) as BoxFuture<'static, anyhow::Result<TwitchWs>>
		})
	}
}

/// Handle to one running upstream reader task.
///
/// Cancellation is cooperative: `cancel` signals the read loop, which
/// revokes its subscriptions and closes the socket on the next cycle.
/// The `done` receiver resolves when the task has exited.
#[derive(Debug)]
pub struct ReaderHandle {
	cancel: Option<oneshot::Sender<()>>,
	done: Option<oneshot::Receiver<()>>,
}

impl ReaderHandle {
	pub fn new(cancel: oneshot::Sender<()>, done: oneshot::Receiver<()>) -> Self {
		Self {
			cancel: Some(cancel),
			done: Some(done),
		}
	}

	/// Signal the reader to shut down. Idempotent.
	pub fn cancel(&mut self) {
		if let Some(tx) = self.cancel.take() {
			let _ = tx.send(());
		}
	}

	/// Take the completion signal (consumed once by the multiplexer).
	pub fn take_done(&mut self) -> Option<oneshot::Receiver<()>> {
		self.done.take()
	}
}

/// Spawn a reader task owning one upstream connection for `condition`.
///
/// Decoded events flow into `events_tx`; the task exits on upstream
/// error, decode error, or cancellation via the returned handle.
pub fn spawn(cfg: ReaderConfig, access_token: SecretString, condition: Condition, events_tx: EventTx) -> ReaderHandle {
	let (cancel_tx, cancel_rx) = oneshot::channel();
	let (done_tx, done_rx) = oneshot::channel();

	tokio::spawn(async move {
		// Dropped on exit so the multiplexer observes completion.
		let _done: oneshot::Sender<()> = done_tx;

		info!(
			channel = %condition.broadcaster_user_id,
			user = %condition.user_id,
			"upstream reader starting"
		);

		match run(cfg, access_token, &condition, events_tx, cancel_rx).await {
			Ok(()) => info!(channel = %condition.broadcaster_user_id, "upstream reader stopped"),
			Err(e) => {
				metrics::counter!("overlay_reader_failures_total").increment(1);
				warn!(channel = %condition.broadcaster_user_id, error = %e, "upstream reader terminated");
			}
		}
	});

	ReaderHandle::new(cancel_tx, done_rx)
}

async fn run(
	cfg: ReaderConfig,
	access_token: SecretString,
	condition: &Condition,
	events_tx: EventTx,
	mut cancel_rx: oneshot::Receiver<()>,
) -> anyhow::Result<()> {
	let helix_base = Url::parse(&cfg.helix_base_url).context("parse helix_base_url")?;
	let helix = HelixClient::new(helix_base, cfg.client_id.clone(), access_token.expose().to_string())?;

	let ws_url = Url::parse(&cfg.eventsub_ws_url).context("parse eventsub ws url")?;
	let mut ws = (cfg.connector())(ws_url).await.context("connect eventsub ws")?;

	let mut subscription_ids: Vec<String> = Vec::new();
	let result = streaming(
		&cfg,
		&helix,
		condition,
		&events_tx,
		&mut cancel_rx,
		&mut ws,
		&mut subscription_ids,
	)
	.await;

	// Teardown revokes whatever was created, on every exit path.
	for id in subscription_ids {
		if let Err(e) = helix.delete_subscription(&id).await {
			debug!(
				channel = %condition.broadcaster_user_id,
				subscription_id = %id,
				error = %e,
				"failed to revoke subscription on teardown"
			);
		}
	}
	let _ = ws.close(None).await;

	result
}

async fn streaming(
	cfg: &ReaderConfig,
	helix: &HelixClient,
	condition: &Condition,
	events_tx: &EventTx,
	cancel_rx: &mut oneshot::Receiver<()>,
	ws: &mut TwitchWs,
	subscription_ids: &mut Vec<String>,
) -> anyhow::Result<()> {
	// Handshake: the first text frame must be session_welcome.
	let Some(session_id) = read_welcome(ws, cancel_rx).await? else {
		return Ok(());
	};

	info!(
		channel = %condition.broadcaster_user_id,
		session_id = %session_id,
		"eventsub session established"
	);

	ensure_subscriptions(cfg, helix, &session_id, condition, subscription_ids).await?;

	loop {
		tokio::select! {
			_ = &mut *cancel_rx => {
				debug!(channel = %condition.broadcaster_user_id, "upstream reader cancelled");
				return Ok(());
			}

			msg = ws.next() => {
				let Some(msg) = msg else {
					anyhow::bail!("eventsub ws ended");
				};

				match msg.context("eventsub ws read")? {
					Message::Text(t) => handle_text(&t, condition, events_tx).await?,

					Message::Ping(p) => {
						let _ = ws.send(Message::Pong(p)).await;
					}

					Message::Close(frame) => {
						info!(channel = %condition.broadcaster_user_id, "eventsub ws closed: {frame:?}");
						return Ok(());
					}

					_ => {}
				}
			}
		}
	}
}

/// Wait for the `session_welcome` frame and return its session id.
///
/// Returns `Ok(None)` when cancelled before the handshake completes.
async fn read_welcome(ws: &mut TwitchWs, cancel_rx: &mut oneshot::Receiver<()>) -> anyhow::Result<Option<String>> {
	loop {
		tokio::select! {
			_ = &mut *cancel_rx => {
				return Ok(None);
			}

			msg = ws.next() => {
				let Some(msg) = msg else {
					anyhow::bail!("eventsub ws closed before welcome");
				};

				match msg.context("eventsub ws read (handshake)")? {
					Message::Text(t) => {
						let ty = eventsub::peek_message_type(&t)?;
						if ty != "session_welcome" {
							anyhow::bail!("handshake: expected session_welcome, got {ty}");
						}

						let welcome = eventsub::parse_welcome(&t)?;
						return Ok(Some(welcome.payload.session.id));
					}

					Message::Ping(p) => {
						let _ = ws.send(Message::Pong(p)).await;
					}

					Message::Close(frame) => {
						anyhow::bail!("eventsub ws closed before welcome: close={frame:?}");
					}

					_ => {}
				}
			}
		}
	}
}

async fn ensure_subscriptions(
	cfg: &ReaderConfig,
	helix: &HelixClient,
	session_id: &str,
	condition: &Condition,
	subscription_ids: &mut Vec<String>,
) -> anyhow::Result<()> {
	let mut wanted = vec![SubscriptionType::ChatMessage];
	if cfg.subscribe_moderation {
		wanted.push(SubscriptionType::ChannelBan);
		wanted.push(SubscriptionType::ChannelUnban);
	}

	for sub_type in wanted {
		match helix.create_subscription(session_id, sub_type, condition).await {
			Ok(id) => {
				debug!(
					channel = %condition.broadcaster_user_id,
					%sub_type,
					subscription_id = %id,
					"created eventsub subscription"
				);
				subscription_ids.push(id);
			}

			Err(CreateSubscriptionError::Forbidden) if sub_type.requires_moderator() => {
				warn!(
					channel = %condition.broadcaster_user_id,
					user = %condition.user_id,
					%sub_type,
					"user is not a moderator in this channel; continuing without this category"
				);
			}

			Err(e) => {
				return Err(anyhow::Error::new(e).context(format!("create subscription type={sub_type}")));
			}
		}
	}

	Ok(())
}

async fn handle_text(raw: &str, condition: &Condition, events_tx: &EventTx) -> anyhow::Result<()> {
	let message_type = eventsub::peek_message_type(raw)?;

	match message_type.as_str() {
		"session_keepalive" => {
			debug!(channel = %condition.broadcaster_user_id, "eventsub keepalive");
		}

		"session_welcome" => {
			debug!(channel = %condition.broadcaster_user_id, "duplicate session_welcome; ignoring");
		}

		// TODO(reconnect): migrate to the reconnect_url instead of riding
		// the old socket until the upstream closes it.
		"session_reconnect" => {
			info!(
				channel = %condition.broadcaster_user_id,
				"received session_reconnect; migration not implemented, continuing on current socket"
			);
		}

		"revocation" => {
			info!(
				channel = %condition.broadcaster_user_id,
				"upstream revoked a subscription for this channel"
			);
		}

		"notification" => {
			if let Some(event) = eventsub::event_from_notification(raw, SystemTime::now())? {
				metrics::counter!("overlay_reader_events_decoded_total").increment(1);
				if events_tx.send(event).await.is_err() {
					anyhow::bail!("event channel closed");
				}
			}
		}

		other => {
			debug!(channel = %condition.broadcaster_user_id, message_type = other, "ignoring unknown eventsub frame");
		}
	}

	Ok(())
}
