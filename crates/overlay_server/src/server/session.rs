#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use overlay_domain::{SessionId, UserId};
use overlay_twitch::SecretString;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info};

/// Cookie carrying the session identifier.
pub const SESSION_COOKIE_NAME: &str = "sessionid";

/// Sessions expire once their age reaches this.
pub const SESSION_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Fixed period of the expiry sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// One authenticated user bound to a browser cookie.
#[derive(Debug, Clone)]
pub struct Session {
	pub id: SessionId,
	pub created: SystemTime,
	pub access_token: SecretString,
	pub login: String,
	pub user_id: UserId,
}

/// Process-wide registry of authenticated users.
///
/// The one piece of state touched from many tasks concurrently; a single
/// mutex guards the map and every method holds it for at most one
/// traversal. Callers receive owned copies, never references into the map.
#[derive(Clone, Default)]
pub struct SessionStore {
	inner: Arc<Mutex<HashMap<SessionId, Session>>>,
}

impl SessionStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Create and store a session for a freshly authenticated user.
	pub fn create(&self, access_token: SecretString, login: String, user_id: UserId) -> Session {
		let session = Session {
			id: SessionId::random(),
			created: SystemTime::now(),
			access_token,
			login,
			user_id,
		};

		let mut map = self.inner.lock();
		map.insert(session.id, session.clone());
		metrics::gauge!("overlay_sessions").set(map.len() as f64);

		session
	}

	/// Insert a pre-built session record.
	#[allow(dead_code)]
	pub fn insert(&self, session: Session) {
		self.inner.lock().insert(session.id, session);
	}

	/// Pure read; a missing or unknown identifier is a silent `None`.
	pub fn lookup(&self, id: &SessionId) -> Option<Session> {
		self.inner.lock().get(id).cloned()
	}

	/// Idempotent removal.
	pub fn delete(&self, id: &SessionId) {
		let mut map = self.inner.lock();
		if map.remove(id).is_some() {
			debug!(session = %id, "session deleted");
		}
		metrics::gauge!("overlay_sessions").set(map.len() as f64);
	}

	pub fn len(&self) -> usize {
		self.inner.lock().len()
	}

	#[allow(dead_code)]
	pub fn is_empty(&self) -> bool {
		self.inner.lock().is_empty()
	}

	/// Remove every session whose age at `now` is at least [`SESSION_TTL`].
	///
	/// `now` is injected so expiry is testable against the fixed interval.
	pub fn sweep_expired_at(&self, now: SystemTime) -> usize {
		let mut map = self.inner.lock();
		let before = map.len();

		map.retain(|_, session| match now.duration_since(session.created) {
			Ok(age) => age < SESSION_TTL,
			// Clock went backwards; keep the session.
			Err(_) => true,
		});

		let removed = before - map.len();
		if removed > 0 {
			metrics::gauge!("overlay_sessions").set(map.len() as f64);
		}
		removed
	}
}

/// Spawn the fixed-interval session expiry sweeper.
pub fn spawn_expiry_sweeper(store: SessionStore) -> tokio::task::JoinHandle<()> {
	tokio::spawn(async move {
		let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

		loop {
			ticker.tick().await;

			let removed = store.sweep_expired_at(SystemTime::now());
			if removed > 0 {
				info!(removed, remaining = store.len(), "session sweep removed expired sessions");
			}
		}
	})
}

/// Session cookie present but its value is not a valid identifier.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("malformed session cookie")]
pub struct MalformedCookie;

/// Extract the session id from a `Cookie` header value.
///
/// An absent cookie is a soft `None` ("not logged in"); a present but
/// unparseable value is a hard error callers map to a bad request.
pub fn session_id_from_cookie_header(header: &str) -> Result<Option<SessionId>, MalformedCookie> {
	for part in header.split(';') {
		let Some((name, value)) = part.split_once('=') else {
			continue;
		};

		if name.trim() != SESSION_COOKIE_NAME {
			continue;
		}

		return match SessionId::parse(value.trim()) {
			Ok(id) => Ok(Some(id)),
			Err(_) => Err(MalformedCookie),
		};
	}

	Ok(None)
}

/// Resolve the session for a request's `Cookie` header, if any.
///
/// An unknown (e.g. expired) identifier is a soft `None`, like absence.
pub fn session_from_cookie_header(
	store: &SessionStore,
	header: Option<&str>,
) -> Result<Option<Session>, MalformedCookie> {
	let Some(header) = header else {
		return Ok(None);
	};

	let Some(id) = session_id_from_cookie_header(header)? else {
		return Ok(None);
	};

	Ok(store.lookup(&id))
}
