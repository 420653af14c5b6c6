#![forbid(unsafe_code)]

mod config;
mod server;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use overlay_twitch::SecretString;
use overlay_twitch::reader::ReaderConfig;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::server::http::{HealthState, HttpSettings, run_http_server};
use crate::server::manager::{ChatManager, ManagerConfig, TwitchReaderSpawner};
use crate::server::session::{SessionStore, spawn_expiry_sweeper};
use crate::server::ws::{WsSettings, run_ws_server};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: overlay_server [--bind host:port]\n\
\n\
Options:\n\
\t--bind    HTTP ingress bind address (default: 127.0.0.1:8080)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Option<SocketAddr> {
	let mut bind_override = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				match v.trim().parse::<SocketAddr>() {
					Ok(addr) => bind_override = Some(addr),
					Err(e) => {
						eprintln!("--bind: {e} (expected host:port)");
						usage_and_exit();
					}
				}
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	bind_override
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,overlay_server=debug".to_string());

	tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false))
		.init();
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let bind_override = parse_args();

	let config_path = config::default_config_path()?;
	let cfg = config::load_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded config (toml + env overrides)");

	init_metrics(cfg.server.metrics_bind.as_deref());

	let client_id = cfg
		.twitch
		.client_id
		.clone()
		.context("twitch client_id is required (config [twitch].client_id or OVERLAY_TWITCH_CLIENT_ID)")?;
	let client_secret = cfg
		.twitch
		.client_secret
		.clone()
		.unwrap_or_else(|| SecretString::new(String::new()));

	let store = SessionStore::new();
	let _sweeper = spawn_expiry_sweeper(store.clone());

	let mut reader_cfg = ReaderConfig::new(client_id.clone());
	if let Some(ws_url) = cfg.twitch.eventsub_ws_url.clone() {
		reader_cfg.eventsub_ws_url = ws_url;
	}
	if let Some(base_url) = cfg.twitch.helix_base_url.clone() {
		reader_cfg.helix_base_url = base_url;
	}
	reader_cfg.subscribe_moderation = cfg.twitch.subscribe_moderation;

	let mut manager_cfg = ManagerConfig::default();
	if let Some(interval) = cfg.manager.sweep_interval {
		manager_cfg.sweep_interval = interval;
	}

	let egress_queue_capacity = cfg.manager.subscriber_queue_capacity.unwrap_or(256);

	let manager = ChatManager::start(
		Arc::new(TwitchReaderSpawner::new(reader_cfg.clone())),
		manager_cfg,
	);

	let http_bind = bind_override.unwrap_or(cfg.server.http_bind);

	let http_settings = HttpSettings {
		client_id: client_id.clone(),
		client_secret,
		public_url: cfg.server.public_url.clone(),
	};

	let ws_settings = WsSettings {
		client_id,
		helix_base_url: reader_cfg.helix_base_url.clone(),
		egress_queue_capacity,
	};

	let health = HealthState::new();
	health.mark_ready();

	info!(%http_bind, ws_bind = %cfg.server.ws_bind, "overlay server starting");

	tokio::try_join!(
		run_http_server(http_bind, http_settings, store.clone(), health),
		run_ws_server(cfg.server.ws_bind, ws_settings, store, manager),
	)?;

	Ok(())
}
