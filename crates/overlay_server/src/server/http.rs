#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, COOKIE, LOCATION, SET_COOKIE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use overlay_domain::UserId;
use overlay_twitch::{SecretString, helix};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::server::session::{SESSION_COOKIE_NAME, SessionStore, session_from_cookie_header};

/// Readiness flag surfaced on `/readyz`.
#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
}

impl HealthState {
	pub fn new() -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

/// Settings for the HTTP ingress (login/logout/health).
#[derive(Clone)]
pub struct HttpSettings {
	pub client_id: String,
	pub client_secret: SecretString,

	/// Externally reachable base URL; `<public_url>/login` is the OAuth
	/// redirect target.
	pub public_url: String,
}

/// Serve the HTTP ingress until the listener fails.
pub async fn run_http_server(
	bind: SocketAddr,
	settings: HttpSettings,
	store: SessionStore,
	health: HealthState,
) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	info!(%bind, "http ingress listening");

	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);

		let settings = settings.clone();
		let store = store.clone();
		let health = health.clone();

		tokio::spawn(async move {
			let service = service_fn(move |req| {
				handle_request(req, settings.clone(), store.clone(), health.clone())
			});

			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				debug!(error = %err, "http connection error");
			}
		});
	}
}

async fn handle_request(
	req: Request<Incoming>,
	settings: HttpSettings,
	store: SessionStore,
	health: HealthState,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
	metrics::counter!("overlay_http_requests_total").increment(1);

	let resp = match (req.method(), req.uri().path()) {
		(&Method::GET, "/healthz") => text(StatusCode::OK, "ok"),

		(&Method::GET, "/readyz") => {
			if health.is_ready() {
				text(StatusCode::OK, "ready")
			} else {
				text(StatusCode::SERVICE_UNAVAILABLE, "not-ready")
			}
		}

		(&Method::GET, "/") => handle_root(&req, &settings, &store),

		(&Method::GET, "/login") => handle_login(&req, &settings, &store).await,

		(&Method::POST, "/logout") => handle_logout(&req, &settings, &store).await,

		(_, "/" | "/login" | "/logout" | "/healthz" | "/readyz") => status_only(StatusCode::METHOD_NOT_ALLOWED),

		_ => status_only(StatusCode::NOT_FOUND),
	};

	Ok(resp)
}

fn cookie_header(req: &Request<Incoming>) -> Option<&str> {
	req.headers().get(COOKIE).and_then(|v| v.to_str().ok())
}

fn query_param(req: &Request<Incoming>, name: &str) -> Option<String> {
	let query = req.uri().query()?;
	url::form_urlencoded::parse(query.as_bytes())
		.find(|(k, _)| k == name)
		.map(|(_, v)| v.into_owned())
}

fn authorize_url(settings: &HttpSettings) -> String {
	format!(
		"https://id.twitch.tv/oauth2/authorize?response_type=code&client_id={}&redirect_uri={}&scope={}",
		urlencoding::encode(&settings.client_id),
		urlencoding::encode(&format!("{}/login", settings.public_url)),
		urlencoding::encode("user:read:chat channel:moderate"),
	)
}

/// Landing route: a missing or unknown session is "not logged in", not an
/// error; only a malformed cookie value is a bad request.
fn handle_root(req: &Request<Incoming>, settings: &HttpSettings, store: &SessionStore) -> Response<Full<Bytes>> {
	let session = match session_from_cookie_header(store, cookie_header(req)) {
		Ok(s) => s,
		Err(e) => {
			debug!(error = %e, "rejecting root request");
			return status_only(StatusCode::BAD_REQUEST);
		}
	};

	let body = serde_json::json!({
		"logged_in": session.is_some(),
		"login": session.map(|s| s.login),
		"authorize_url": authorize_url(settings),
	});

	json(StatusCode::OK, &body)
}

/// OAuth redirect target: exchange the code, identify the user, create a
/// session, and hand the browser its cookie.
async fn handle_login(
	req: &Request<Incoming>,
	settings: &HttpSettings,
	store: &SessionStore,
) -> Response<Full<Bytes>> {
	let Some(code) = query_param(req, "code").filter(|c| !c.is_empty()) else {
		return status_only(StatusCode::BAD_REQUEST);
	};

	let redirect_uri = format!("{}/login", settings.public_url);
	let token = match helix::exchange_code(
		&settings.client_id,
		settings.client_secret.expose(),
		&code,
		&redirect_uri,
	)
	.await
	{
		Ok(t) => t,
		Err(e) => {
			warn!(error = %e, "login code exchange failed");
			return status_only(StatusCode::BAD_REQUEST);
		}
	};

	let validation = match helix::validate_user_token(&token.access_token).await {
		Ok(v) => v,
		Err(e) => {
			warn!(error = %e, "login token validation failed");
			return status_only(StatusCode::BAD_REQUEST);
		}
	};

	let user_id = match UserId::new(validation.user_id) {
		Ok(id) => id,
		Err(e) => {
			warn!(error = %e, "login validation returned unusable user id");
			return status_only(StatusCode::BAD_REQUEST);
		}
	};

	let session = store.create(SecretString::new(token.access_token), validation.login, user_id);
	info!(login = %session.login, "user logged in");
	metrics::counter!("overlay_logins_total").increment(1);

	Response::builder()
		.status(StatusCode::FOUND)
		.header(LOCATION, "/")
		.header(
			SET_COOKIE,
			format!("{SESSION_COOKIE_NAME}={}; Path=/; HttpOnly; SameSite=Lax", session.id),
		)
		.body(Full::new(Bytes::new()))
		.unwrap()
}

/// Authenticated action endpoint: malformed cookie is a hard 400, a
/// missing session a hard 403.
async fn handle_logout(
	req: &Request<Incoming>,
	settings: &HttpSettings,
	store: &SessionStore,
) -> Response<Full<Bytes>> {
	let session = match session_from_cookie_header(store, cookie_header(req)) {
		Ok(Some(s)) => s,
		Ok(None) => return status_only(StatusCode::FORBIDDEN),
		Err(e) => {
			debug!(error = %e, "rejecting logout request");
			return status_only(StatusCode::BAD_REQUEST);
		}
	};

	store.delete(&session.id);

	if let Err(e) = helix::revoke_user_token(&settings.client_id, session.access_token.expose()).await {
		warn!(login = %session.login, error = %e, "token revocation failed on logout");
		return status_only(StatusCode::INTERNAL_SERVER_ERROR);
	}

	info!(login = %session.login, "user logged out");
	status_only(StatusCode::NO_CONTENT)
}

fn status_only(status: StatusCode) -> Response<Full<Bytes>> {
	Response::builder().status(status).body(Full::new(Bytes::new())).unwrap()
}

fn text(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
	Response::builder()
		.status(status)
		.body(Full::new(Bytes::from_static(body.as_bytes())))
		.unwrap()
}

fn json(status: StatusCode, body: &serde_json::Value) -> Response<Full<Bytes>> {
	Response::builder()
		.status(status)
		.header(CONTENT_TYPE, "application/json")
		.body(Full::new(Bytes::from(body.to_string())))
		.unwrap()
}
