#![forbid(unsafe_code)]

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use overlay_twitch::SecretString;
use serde::Deserialize;
use tracing::{info, warn};

/// Default config path: `~/.overlay/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".overlay").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
#[allow(dead_code)]
pub fn load_config() -> anyhow::Result<Config> {
	let path = default_config_path()?;
	load_config_from_path(&path)
}

/// Same as `load_config` but with an explicit config path.
pub fn load_config_from_path(path: &Path) -> anyhow::Result<Config> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = Config::from_file(file_cfg)?;

	apply_env_overrides(&mut cfg)?;

	if cfg.twitch.client_id.as_ref().map(|v| !v.trim().is_empty()).unwrap_or(false) {
		info!("twitch config: client_id provided");
	} else {
		warn!("twitch config: no client_id configured; login and upstream readers will fail");
	}

	Ok(cfg)
}

/// Server config.
#[derive(Debug, Clone)]
pub struct Config {
	pub server: ServerSettings,
	pub twitch: TwitchSettings,
	pub manager: ManagerSettings,
}

/// Listener and observability settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// HTTP ingress bind (login/logout/health).
	pub http_bind: SocketAddr,
	/// WebSocket egress bind (browser event streams).
	pub ws_bind: SocketAddr,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Externally reachable base URL, used for the OAuth redirect_uri.
	pub public_url: String,
}

/// Upstream platform settings.
#[derive(Debug, Clone, Default)]
pub struct TwitchSettings {
	/// Twitch App Client ID.
	pub client_id: Option<String>,
	/// Twitch App Client Secret (used for the login code exchange).
	pub client_secret: Option<SecretString>,

	/// EventSub websocket URL (optional override).
	pub eventsub_ws_url: Option<String>,
	/// Helix API base URL (optional override).
	pub helix_base_url: Option<String>,

	/// Also subscribe moderation categories (ban/unban).
	pub subscribe_moderation: bool,
}

/// Multiplexer tuning.
#[derive(Debug, Clone, Default)]
pub struct ManagerSettings {
	/// Maximum queued events per subscriber.
	pub subscriber_queue_capacity: Option<usize>,
	/// Idle-reader sweep period.
	pub sweep_interval: Option<Duration>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	twitch: FileTwitchSettings,

	#[serde(default)]
	manager: FileManagerSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	http_bind: Option<String>,
	ws_bind: Option<String>,
	metrics_bind: Option<String>,
	public_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileTwitchSettings {
	client_id: Option<String>,
	client_secret: Option<String>,
	eventsub_ws_url: Option<String>,
	helix_base_url: Option<String>,
	subscribe_moderation: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileManagerSettings {
	subscriber_queue_capacity: Option<usize>,
	sweep_interval_secs: Option<u64>,
}

impl Config {
	fn from_file(file: FileConfig) -> anyhow::Result<Self> {
		let http_bind = parse_bind(file.server.http_bind.as_deref(), "server.http_bind", "127.0.0.1:8080")?;
		let ws_bind = parse_bind(file.server.ws_bind.as_deref(), "server.ws_bind", "127.0.0.1:8081")?;

		Ok(Self {
			server: ServerSettings {
				http_bind,
				ws_bind,
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				public_url: file
					.server
					.public_url
					.filter(|s| !s.trim().is_empty())
					.map(|s| s.trim_end_matches('/').to_string())
					.unwrap_or_else(|| "http://localhost:8080".to_string()),
			},
			twitch: TwitchSettings {
				client_id: file.twitch.client_id.filter(|s| !s.trim().is_empty()),
				client_secret: file
					.twitch
					.client_secret
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
				eventsub_ws_url: file.twitch.eventsub_ws_url.filter(|s| !s.trim().is_empty()),
				helix_base_url: file.twitch.helix_base_url.filter(|s| !s.trim().is_empty()),
				subscribe_moderation: file.twitch.subscribe_moderation.unwrap_or(true),
			},
			manager: ManagerSettings {
				subscriber_queue_capacity: file.manager.subscriber_queue_capacity,
				sweep_interval: file.manager.sweep_interval_secs.map(Duration::from_secs),
			},
		})
	}
}

fn parse_bind(value: Option<&str>, key: &str, default: &str) -> anyhow::Result<SocketAddr> {
	let raw = value.map(str::trim).filter(|s| !s.is_empty()).unwrap_or(default);
	raw.parse::<SocketAddr>()
		.with_context(|| format!("{key}: invalid bind address {raw:?} (expected host:port)"))
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut Config) -> anyhow::Result<()> {
	if let Ok(v) = std::env::var("OVERLAY_HTTP_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.http_bind = v
				.parse()
				.with_context(|| format!("OVERLAY_HTTP_BIND: invalid bind address {v:?}"))?;
			info!("server config: http_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("OVERLAY_WS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.ws_bind = v
				.parse()
				.with_context(|| format!("OVERLAY_WS_BIND: invalid bind address {v:?}"))?;
			info!("server config: ws_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("OVERLAY_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("OVERLAY_PUBLIC_URL") {
		let v = v.trim().trim_end_matches('/').to_string();
		if !v.is_empty() {
			cfg.server.public_url = v;
			info!("server config: public_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("OVERLAY_TWITCH_CLIENT_ID") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.twitch.client_id = Some(v);
			info!("twitch config: client_id overridden by env");
		}
	}

	if let Ok(v) = std::env::var("OVERLAY_TWITCH_CLIENT_SECRET") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.twitch.client_secret = Some(SecretString::new(v));
			info!("twitch config: client_secret overridden by env");
		}
	}

	if let Ok(v) = std::env::var("OVERLAY_TWITCH_EVENTSUB_WS_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.twitch.eventsub_ws_url = Some(v);
			info!("twitch config: eventsub_ws_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("OVERLAY_TWITCH_HELIX_BASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.twitch.helix_base_url = Some(v);
			info!("twitch config: helix_base_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("OVERLAY_TWITCH_SUBSCRIBE_MODERATION")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.twitch.subscribe_moderation = enabled;
		info!(enabled, "twitch config: subscribe_moderation overridden by env");
	}

	if let Ok(v) = std::env::var("OVERLAY_SUBSCRIBER_QUEUE_CAPACITY")
		&& let Ok(capacity) = v.trim().parse::<usize>()
	{
		cfg.manager.subscriber_queue_capacity = Some(capacity);
		info!(capacity, "manager config: subscriber_queue_capacity overridden by env");
	}

	if let Ok(v) = std::env::var("OVERLAY_SWEEP_INTERVAL_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.manager.sweep_interval = Some(Duration::from_secs(secs));
		info!(secs, "manager config: sweep_interval overridden by env");
	}

	Ok(())
}
