#![forbid(unsafe_code)]

use std::net::SocketAddr;

use anyhow::Context;
use futures::{SinkExt, StreamExt};
use overlay_domain::{BroadcasterId, Condition};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request as WsRequest, Response as WsResponse};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};
use url::Url;

use crate::server::manager::ChatManager;
use crate::server::session::{Session, SessionStore, session_from_cookie_header};

/// Settings for the browser-facing event stream listener.
#[derive(Clone)]
pub struct WsSettings {
	pub client_id: String,
	pub helix_base_url: String,

	/// Capacity of each browser connection's delivery sink.
	pub egress_queue_capacity: usize,
}

/// Serve browser WebSocket connections until the listener fails.
///
/// Each accepted connection authenticates via the session cookie, joins
/// the multiplexer for its requested channel, and streams events as JSON
/// text frames until either side hangs up.
pub async fn run_ws_server(
	bind: SocketAddr,
	settings: WsSettings,
	store: SessionStore,
	manager: ChatManager,
) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	info!(%bind, "websocket egress listening");

	loop {
		let (stream, addr) = listener.accept().await?;
		metrics::counter!("overlay_ws_connections_total").increment(1);

		let settings = settings.clone();
		let store = store.clone();
		let manager = manager.clone();

		tokio::spawn(async move {
			if let Err(e) = handle_socket(stream, settings, store, manager).await {
				debug!(%addr, error = %e, "websocket connection ended with error");
			}
		});
	}
}

fn reject(status: StatusCode) -> ErrorResponse {
	let mut resp = ErrorResponse::new(None);
	*resp.status_mut() = status;
	resp
}

/// Handshake-time checks: session cookie and channel query parameter.
fn authorize(req: &WsRequest, store: &SessionStore) -> Result<(Session, String), StatusCode> {
	if req.uri().path() != "/chat" {
		return Err(StatusCode::NOT_FOUND);
	}

	let cookie = req.headers().get("Cookie").and_then(|v| v.to_str().ok());

	let session = match session_from_cookie_header(store, cookie) {
		Ok(Some(s)) => s,
		Ok(None) => return Err(StatusCode::FORBIDDEN),
		Err(_) => return Err(StatusCode::BAD_REQUEST),
	};

	let channel = req
		.uri()
		.query()
		.and_then(|query| {
			url::form_urlencoded::parse(query.as_bytes())
				.find(|(k, _)| k == "channel")
				.map(|(_, v)| v.into_owned())
		})
		.filter(|c| !c.trim().is_empty());

	let Some(channel) = channel else {
		return Err(StatusCode::FORBIDDEN);
	};

	Ok((session, channel))
}

async fn handle_socket(
	stream: TcpStream,
	settings: WsSettings,
	store: SessionStore,
	manager: ChatManager,
) -> anyhow::Result<()> {
	let mut authorized: Option<(Session, String)> = None;

	let mut ws = tokio_tungstenite::accept_hdr_async(stream, |req: &WsRequest, resp: WsResponse| {
		match authorize(req, &store) {
			Ok(ok) => {
				authorized = Some(ok);
				Ok(resp)
			}
			Err(status) => Err(reject(status)),
		}
	})
	.await
	.context("websocket handshake")?;

	let Some((session, channel_login)) = authorized else {
		// Handshake succeeded without authorization state; nothing to serve.
		return Ok(());
	};

	// Resolve the channel login to its broadcaster id before joining.
	let helix_base = Url::parse(&settings.helix_base_url).context("parse helix_base_url")?;
	let helix = overlay_twitch::helix::HelixClient::new(
		helix_base,
		settings.client_id.clone(),
		session.access_token.expose().to_string(),
	)?;

	let broadcaster = match helix.get_user_by_login(&channel_login).await {
		Ok(Some(user)) => BroadcasterId::new(user.id).context("broadcaster id from helix user")?,
		Ok(None) => {
			warn!(channel = %channel_login, "unknown channel login; closing stream");
			let _ = ws.close(None).await;
			return Ok(());
		}
		Err(e) => {
			warn!(channel = %channel_login, error = %e, "failed to resolve channel; closing stream");
			let _ = ws.close(None).await;
			return Ok(());
		}
	};

	let condition = Condition::new(broadcaster.clone(), session.user_id.clone());

	let (sink_tx, mut sink_rx) = mpsc::channel(settings.egress_queue_capacity);
	let subscriber = manager
		.join(session.access_token.clone(), condition, sink_tx)
		.await?;

	info!(
		login = %session.login,
		channel = %channel_login,
		%subscriber,
		"browser stream attached"
	);

	loop {
		tokio::select! {
			item = sink_rx.recv() => {
				// Closure means the upstream reader died or the sweep
				// reclaimed the channel; the stream is over.
				let Some(event) = item else {
					debug!(%subscriber, "delivery sink closed; ending stream");
					break;
				};

				let json = match serde_json::to_string(&event) {
					Ok(j) => j,
					Err(e) => {
						warn!(%subscriber, error = %e, "failed to serialize event; ending stream");
						break;
					}
				};

				if ws.send(Message::Text(json.into())).await.is_err() {
					break;
				}
			}

			msg = ws.next() => {
				match msg {
					Some(Ok(Message::Ping(p))) => {
						let _ = ws.send(Message::Pong(p)).await;
					}
					Some(Ok(Message::Close(_))) | None => break,
					Some(Err(_)) => break,
					// Browser clients only listen; ignore anything they say.
					Some(Ok(_)) => {}
				}
			}
		}
	}

	// A disconnect of any kind must part, or the reader leaks until sweep.
	manager.part(broadcaster, subscriber).await;
	let _ = ws.close(None).await;

	info!(login = %session.login, channel = %channel_login, %subscriber, "browser stream detached");

	Ok(())
}
