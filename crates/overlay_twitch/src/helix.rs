#![forbid(unsafe_code)]

use anyhow::Context;
use overlay_domain::Condition;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const EVENTSUB_SUBSCRIPTIONS_PATH: &str = "/helix/eventsub/subscriptions";
const USERS_PATH: &str = "/helix/users";
const TOKEN_URL: &str = "https://id.twitch.tv/oauth2/token";
const TOKEN_VALIDATE_URL: &str = "https://id.twitch.tv/oauth2/validate";
const TOKEN_REVOKE_URL: &str = "https://id.twitch.tv/oauth2/revoke";

/// Event subscription categories requested from the upstream API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionType {
	ChatMessage,
	ChannelBan,
	ChannelUnban,
}

impl SubscriptionType {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::ChatMessage => "channel.chat.message",
			Self::ChannelBan => "channel.ban",
			Self::ChannelUnban => "channel.unban",
		}
	}

	/// Whether this category requires moderator privileges in the channel.
	pub const fn requires_moderator(self) -> bool {
		matches!(self, Self::ChannelBan | Self::ChannelUnban)
	}
}

impl core::fmt::Display for SubscriptionType {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Errors from creating an event subscription.
///
/// A 403 is a distinguished condition: for moderation categories the
/// caller logs and continues rather than failing the whole reader.
#[derive(Debug, Error)]
pub enum CreateSubscriptionError {
	#[error("forbidden (missing moderator privileges)")]
	Forbidden,

	#[error(transparent)]
	Other(#[from] anyhow::Error),
}

/// Authenticated client for the upstream subscription-management API.
#[derive(Clone, Debug)]
pub struct HelixClient {
	http: reqwest::Client,
	base_url: Url,
	client_id: String,
	bearer_token: String,
}

#[derive(Debug, Serialize)]
struct HelixCreateSubscriptionRequest<'a> {
	#[serde(rename = "type")]
	r#type: &'static str,
	version: &'static str,
	condition: &'a Condition,
	transport: HelixWebsocketTransport<'a>,
}

#[derive(Debug, Serialize)]
struct HelixWebsocketTransport<'a> {
	method: &'a str,
	session_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct HelixCreateSubscriptionResponse {
	data: Vec<HelixSubscriptionData>,
}

#[derive(Debug, Deserialize)]
struct HelixSubscriptionData {
	id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct HelixUsersResponse {
	pub(crate) data: Vec<HelixUser>,
}

/// Upstream user record.
#[derive(Debug, Clone, Deserialize)]
pub struct HelixUser {
	pub id: String,
	pub login: String,

	#[serde(default)]
	pub display_name: Option<String>,
}

impl HelixClient {
	pub fn new(base_url: Url, client_id: String, bearer_token: String) -> anyhow::Result<Self> {
		if client_id.trim().is_empty() {
			anyhow::bail!("missing twitch client_id");
		}

		let http = reqwest::Client::builder()
			.user_agent("overlay/0.x (helix)")
			.build()
			.context("build reqwest client")?;

		Ok(Self {
			http,
			base_url,
			client_id,
			bearer_token,
		})
	}

	fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
		req.header("Client-Id", &self.client_id)
			.header("Authorization", format!("Bearer {}", self.bearer_token))
	}

	fn url(&self, path_and_query: &str) -> anyhow::Result<Url> {
		self.base_url.join(path_and_query).context("join helix url")
	}

	/// Create one event subscription bound to a websocket session.
	///
	/// Returns the upstream subscription id, needed later for revocation.
	pub async fn create_subscription(
		&self,
		session_id: &str,
		sub_type: SubscriptionType,
		condition: &Condition,
	) -> Result<String, CreateSubscriptionError> {
		let url = self.url(EVENTSUB_SUBSCRIPTIONS_PATH)?;

		let req = HelixCreateSubscriptionRequest {
			r#type: sub_type.as_str(),
			version: "1",
			condition,
			transport: HelixWebsocketTransport {
				method: "websocket",
				session_id,
			},
		};

		let resp = self
			.authed(self.http.post(url))
			.json(&req)
			.send()
			.await
			.with_context(|| format!("helix POST {EVENTSUB_SUBSCRIPTIONS_PATH} send (type={sub_type})"))?;

		let status = resp.status();

		if status == StatusCode::FORBIDDEN {
			return Err(CreateSubscriptionError::Forbidden);
		}

		let body = resp
			.text()
			.await
			.with_context(|| format!("helix POST {EVENTSUB_SUBSCRIPTIONS_PATH} read body (type={sub_type})"))?;

		if !status.is_success() {
			return Err(anyhow::anyhow!(
				"helix create subscription failed (type={sub_type}): status={status} body={body}"
			)
			.into());
		}

		let parsed: HelixCreateSubscriptionResponse = serde_json::from_str(&body)
			.with_context(|| format!("helix create subscription parse json (type={sub_type})"))?;

		let sub = parsed
			.data
			.into_iter()
			.next()
			.context("helix create subscription returned empty data")?;

		Ok(sub.id)
	}

	/// Delete an event subscription by id.
	pub async fn delete_subscription(&self, subscription_id: &str) -> anyhow::Result<()> {
		let url = self.url(&format!(
			"{base}?id={}",
			urlencoding::encode(subscription_id),
			base = EVENTSUB_SUBSCRIPTIONS_PATH
		))?;

		let resp = self
			.authed(self.http.delete(url))
			.send()
			.await
			.context("helix DELETE /helix/eventsub/subscriptions send")?;

		let status = resp.status();
		if status == StatusCode::NO_CONTENT || status.is_success() {
			return Ok(());
		}

		let body = resp
			.text()
			.await
			.context("helix DELETE /helix/eventsub/subscriptions read body")?;
		anyhow::bail!("helix delete subscription failed: status={status} body={body}");
	}

	/// Look up a user (broadcaster) by login name.
	pub async fn get_user_by_login(&self, login: &str) -> anyhow::Result<Option<HelixUser>> {
		let url = self.url(&format!("{USERS_PATH}?login={}", urlencoding::encode(login)))?;

		let resp = self
			.authed(self.http.get(url))
			.send()
			.await
			.context("helix GET /helix/users send")?;

		let status = resp.status();
		let body = resp.text().await.context("helix GET /helix/users read body")?;

		if !status.is_success() {
			anyhow::bail!("helix GET /helix/users failed: status={status} body={body}");
		}

		let parsed: HelixUsersResponse = serde_json::from_str(&body).context("helix users parse json")?;
		Ok(parsed.data.into_iter().next())
	}
}

/// Successful token validation payload.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenValidation {
	pub client_id: String,
	pub login: String,
	pub user_id: String,
	pub expires_in: u64,
	#[serde(default)]
	pub scopes: Vec<String>,
}

/// Validate a user access token and identify its owner.
pub async fn validate_user_token(access_token: &str) -> anyhow::Result<TokenValidation> {
	let http = reqwest::Client::builder()
		.user_agent("overlay/0.x (oauth-validate)")
		.build()
		.context("build reqwest client")?;

	let resp = http
		.get(TOKEN_VALIDATE_URL)
		.header("Authorization", format!("OAuth {}", access_token))
		.send()
		.await
		.context("twitch validate token request")?;

	let status = resp.status();
	let body = resp.text().await.context("twitch validate token read body")?;

	if !status.is_success() {
		anyhow::bail!("twitch validate token failed: status={status} body={body}");
	}

	serde_json::from_str(&body).context("twitch validate token parse json")
}

/// Token payload from the authorization-code exchange.
#[derive(Debug, Deserialize)]
pub struct TokenExchangeResponse {
	pub access_token: String,
	#[serde(default)]
	pub refresh_token: Option<String>,
	#[serde(default)]
	pub expires_in: Option<u64>,
}

/// Exchange an OAuth authorization code for a user access token.
pub async fn exchange_code(
	client_id: &str,
	client_secret: &str,
	code: &str,
	redirect_uri: &str,
) -> anyhow::Result<TokenExchangeResponse> {
	let http = reqwest::Client::builder()
		.user_agent("overlay/0.x (oauth-exchange)")
		.build()
		.context("build reqwest client")?;

	let resp = http
		.post(TOKEN_URL)
		.form(&[
			("grant_type", "authorization_code"),
			("client_id", client_id),
			("client_secret", client_secret),
			("code", code),
			("redirect_uri", redirect_uri),
		])
		.send()
		.await
		.context("twitch code exchange request")?;

	let status = resp.status();
	let body = resp.text().await.context("twitch code exchange read body")?;

	if !status.is_success() {
		anyhow::bail!("twitch code exchange failed: status={status} body={body}");
	}

	serde_json::from_str(&body).context("twitch code exchange parse json")
}

/// Revoke a user access token (logout).
pub async fn revoke_user_token(client_id: &str, access_token: &str) -> anyhow::Result<()> {
	let http = reqwest::Client::builder()
		.user_agent("overlay/0.x (oauth-revoke)")
		.build()
		.context("build reqwest client")?;

	let resp = http
		.post(TOKEN_REVOKE_URL)
		.form(&[("client_id", client_id), ("token", access_token)])
		.send()
		.await
		.context("twitch revoke token request")?;

	let status = resp.status();
	if !status.is_success() {
		let body = resp.text().await.unwrap_or_default();
		anyhow::bail!("twitch revoke token failed: status={status} body={body}");
	}

	Ok(())
}
