#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::Deserialize;
use url::Url;

use crate::assets::common::TtlCache;
use crate::{ProfileLookup, SecretString, StreamStatus, UserProfile, UserQuery};

const HELIX_BASE_URL: &str = "https://api.twitch.tv";
const USERS_PATH: &str = "/helix/users";
const STREAMS_PATH: &str = "/helix/streams";
const CHEERMOTES_PATH: &str = "/helix/bits/cheermotes";

const USER_TTL: Duration = Duration::from_secs(300);
const CHEERMOTES_TTL: Duration = Duration::from_secs(3_600);
const CHEERMOTES_KEY: &str = "global";

fn retry_delay_from_headers(headers: &HeaderMap) -> Option<Duration> {
	if let Some(v) = headers.get(RETRY_AFTER)
		&& let Ok(s) = v.to_str()
		&& let Ok(secs) = s.trim().parse::<u64>()
	{
		return Some(Duration::from_secs(secs));
	}

	if let Some(v) = headers.get("Ratelimit-Reset")
		&& let Ok(s) = v.to_str()
		&& let Ok(reset_unix) = s.trim().parse::<u64>()
	{
		let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs();
		if reset_unix > now {
			return Some(Duration::from_secs(reset_unix - now));
		}
	}

	None
}

async fn send_with_retry(req: reqwest::RequestBuilder, label: &'static str) -> anyhow::Result<reqwest::Response> {
	let retry_builder = req.try_clone();
	let resp = req.send().await.with_context(|| format!("helix {label} send"))?;
	let status = resp.status();
	metrics::counter!("relay_helix_requests_total").increment(1);

	if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
		let body = resp.text().await.unwrap_or_default();
		anyhow::bail!("helix auth failed (status={status}) body={body}");
	}

	if status == StatusCode::TOO_MANY_REQUESTS
		&& let Some(delay) = retry_delay_from_headers(resp.headers())
		&& let Some(retry) = retry_builder
	{
		tokio::time::sleep(delay).await;
		return retry.send().await.with_context(|| format!("helix {label} retry send"));
	}

	if status.is_server_error()
		&& let Some(retry) = retry_builder
	{
		tokio::time::sleep(Duration::from_millis(250)).await;
		return retry.send().await.with_context(|| format!("helix {label} retry send"));
	}

	Ok(resp)
}

#[derive(Clone, Debug)]
struct HelixClient {
	http: reqwest::Client,
	base_url: Url,
	client_id: String,
	bearer_token: SecretString,
}

impl HelixClient {
	fn new(base_url: Url, client_id: String, bearer_token: SecretString) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.user_agent("relay/0.x (helix)")
			.timeout(Duration::from_secs(10))
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
			.header("Authorization", format!("Bearer {}", self.bearer_token.expose()))
	}

	fn url(&self, path_and_query: &str) -> anyhow::Result<Url> {
		self.base_url.join(path_and_query).context("join helix url")
	}

	async fn get_json<T: serde::de::DeserializeOwned>(&self, url: Url, label: &'static str) -> anyhow::Result<T> {
		let resp = send_with_retry(self.authed(self.http.get(url)), label)
			.await
			.with_context(|| format!("helix {label} send"))?;

		let status = resp.status();
		let body = resp.text().await.with_context(|| format!("helix {label} read body"))?;

		if !status.is_success() {
			anyhow::bail!("helix {label} failed: status={status} body={body}");
		}

		serde_json::from_str(&body).with_context(|| format!("helix {label} parse json"))
	}

	async fn get_user(&self, query: UserQuery<'_>) -> anyhow::Result<Option<HelixUser>> {
		let (key, value) = match query {
			UserQuery::Login(login) => ("login", login),
			UserQuery::Id(id) => ("id", id),
		};
		let url = self.url(&format!("{USERS_PATH}?{key}={}", urlencoding::encode(value)))?;
		let parsed: HelixData<HelixUser> = self.get_json(url, "GET /helix/users").await?;
		Ok(parsed.data.into_iter().next())
	}

	async fn get_stream_live(&self, user_id: &str) -> anyhow::Result<bool> {
		let url = self.url(&format!("{STREAMS_PATH}?user_id={}", urlencoding::encode(user_id)))?;
		let parsed: HelixData<serde_json::Value> = self.get_json(url, "GET /helix/streams").await?;
		Ok(!parsed.data.is_empty())
	}

	async fn get_cheermotes(&self) -> anyhow::Result<Vec<HelixCheermote>> {
		let url = self.url(CHEERMOTES_PATH)?;
		let parsed: HelixData<HelixCheermote> = self.get_json(url, "GET /helix/bits/cheermotes").await?;
		Ok(parsed.data)
	}
}

#[derive(Debug, Deserialize)]
struct HelixData<T> {
	#[serde(default = "Vec::new")]
	data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct HelixUser {
	id: String,
	login: String,
	#[serde(default)]
	display_name: Option<String>,
	#[serde(default)]
	profile_image_url: Option<String>,
}

impl From<HelixUser> for UserProfile {
	fn from(user: HelixUser) -> Self {
		let display_name = user
			.display_name
			.filter(|s| !s.trim().is_empty())
			.unwrap_or_else(|| user.login.clone());
		Self {
			id: user.id,
			login: user.login,
			display_name,
			avatar_url: user.profile_image_url.filter(|s| !s.trim().is_empty()),
		}
	}
}

#[derive(Debug, Deserialize)]
struct HelixCheermote {
	prefix: String,
}

/// Profile lookups backed by the Twitch Helix API.
pub struct HelixProfiles {
	client: HelixClient,
	users: TtlCache<Option<UserProfile>>,
	cheermotes: TtlCache<Arc<HashSet<String>>>,
}

impl HelixProfiles {
	pub fn new(client_id: impl Into<String>, bearer_token: SecretString) -> anyhow::Result<Self> {
		let base_url = Url::parse(HELIX_BASE_URL).context("parse helix base url")?;
		Self::with_base_url(base_url, client_id, bearer_token)
	}

	pub fn with_base_url(
		base_url: Url,
		client_id: impl Into<String>,
		bearer_token: SecretString,
	) -> anyhow::Result<Self> {
		Ok(Self {
			client: HelixClient::new(base_url, client_id.into(), bearer_token)?,
			users: TtlCache::new(USER_TTL),
			cheermotes: TtlCache::new(CHEERMOTES_TTL),
		})
	}
}

#[async_trait::async_trait]
impl ProfileLookup for HelixProfiles {
	async fn get_user(&self, query: UserQuery<'_>) -> anyhow::Result<Option<UserProfile>> {
		let key = query.to_string();
		if let Some(cached) = self.users.get(&key) {
			return Ok(cached);
		}

		let profile = self.client.get_user(query).await?.map(UserProfile::from);
		self.users.insert(key, profile.clone());
		Ok(profile)
	}

	async fn stream_status(&self, user_id: &str) -> anyhow::Result<StreamStatus> {
		let live = self.client.get_stream_live(user_id).await?;
		Ok(if live { StreamStatus::Live } else { StreamStatus::Offline })
	}

	async fn cheermote_prefixes(&self) -> anyhow::Result<HashSet<String>> {
		if let Some(cached) = self.cheermotes.get(CHEERMOTES_KEY) {
			return Ok((*cached).clone());
		}

		let prefixes: HashSet<String> = self
			.client
			.get_cheermotes()
			.await?
			.into_iter()
			.map(|c| c.prefix.to_ascii_lowercase())
			.collect();
		self.cheermotes.insert(CHEERMOTES_KEY, Arc::new(prefixes.clone()));
		Ok(prefixes)
	}
}
