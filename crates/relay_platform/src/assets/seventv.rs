#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::{EmoteDirectory, EmoteImage, ImageRef};

use super::common::{ImageFormat, TtlCache};

const SEVENTV_API_BASE: &str = "https://7tv.io/v3/";
const SEVENTV_SET_TTL: Duration = Duration::from_secs(300);
const GLOBAL_KEY: &str = "global";

type EmoteTable = Arc<HashMap<String, ImageRef>>;

/// 7TV emote directory (global set plus per-channel sets).
pub struct SevenTvDirectory {
	http: reqwest::Client,
	base_url: Url,
	sets: TtlCache<EmoteTable>,
}

impl SevenTvDirectory {
	pub fn new() -> anyhow::Result<Self> {
		let base_url = Url::parse(SEVENTV_API_BASE).context("parse 7tv base url")?;
		Self::with_base_url(base_url)
	}

	/// Point the directory at another API root (must end with `/`).
	pub fn with_base_url(base_url: Url) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.user_agent("relay/0.x (emote-directory)")
			.timeout(Duration::from_secs(10))
			.build()
			.context("build reqwest client")?;

		Ok(Self {
			http,
			base_url,
			sets: TtlCache::new(SEVENTV_SET_TTL),
		})
	}

	fn url(&self, path: &str) -> anyhow::Result<Url> {
		self.base_url.join(path).context("join 7tv url")
	}

	async fn global_set(&self) -> anyhow::Result<EmoteTable> {
		if let Some(set) = self.sets.get(GLOBAL_KEY) {
			return Ok(set);
		}

		let resp = self
			.http
			.get(self.url("emote-sets/global")?)
			.send()
			.await
			.context("7tv global set request")?
			.error_for_status()
			.context("7tv global set status")?;

		let set: SevenTvEmoteSet = resp.json().await.context("7tv global set json")?;
		let table = Arc::new(emote_table(set));
		self.sets.insert(GLOBAL_KEY, Arc::clone(&table));
		Ok(table)
	}

	async fn channel_set(&self, channel_id: &str) -> anyhow::Result<EmoteTable> {
		let key = format!("twitch:{channel_id}");
		if let Some(set) = self.sets.get(&key) {
			return Ok(set);
		}

		let url = self.url(&format!("users/twitch/{}", urlencoding::encode(channel_id)))?;
		let resp = self.http.get(url).send().await.context("7tv user request")?;

		// Channels without a 7TV account simply have no emotes.
		let table = if resp.status() == StatusCode::NOT_FOUND {
			Arc::new(HashMap::new())
		} else {
			let user: SevenTvUser = resp
				.error_for_status()
				.context("7tv user status")?
				.json()
				.await
				.context("7tv user json")?;
			Arc::new(user.emote_set.map(emote_table).unwrap_or_default())
		};

		self.sets.insert(key, Arc::clone(&table));
		Ok(table)
	}
}

#[async_trait::async_trait]
impl EmoteDirectory for SevenTvDirectory {
	async fn resolve(&self, channel_id: &str, _user_id: &str, name: &str) -> anyhow::Result<Option<ImageRef>> {
		if !channel_id.is_empty()
			&& let Some(image) = self.channel_set(channel_id).await?.get(name)
		{
			return Ok(Some(image.clone()));
		}

		let found = self.global_set().await?.get(name).cloned();
		debug!(%channel_id, emote = %name, found = found.is_some(), "7tv emote lookup");
		Ok(found)
	}

	async fn fetch(&self, image: &ImageRef) -> anyhow::Result<EmoteImage> {
		let bytes: Bytes = self
			.http
			.get(&image.url)
			.send()
			.await
			.with_context(|| format!("emote image request {}", image.url))?
			.error_for_status()
			.with_context(|| format!("emote image status {}", image.url))?
			.bytes()
			.await
			.with_context(|| format!("emote image body {}", image.url))?;

		let format = ImageFormat::sniff(&bytes).with_context(|| format!("emote image format {}", image.url))?;
		metrics::counter!("relay_emote_images_fetched_total").increment(1);
		Ok(EmoteImage { bytes, format })
	}
}

fn emote_table(set: SevenTvEmoteSet) -> HashMap<String, ImageRef> {
	let mut table = HashMap::new();
	for emote in set.emotes {
		let host = &emote.data.host;
		let file = host.files.iter().find(|file| {
			file.name.starts_with("2x") && ImageFormat::from_name(&file.format).is_some_and(|f| f != ImageFormat::Jpeg)
		});
		let Some(file) = file else {
			continue;
		};

		let file_name = if file.static_name.is_empty() {
			&file.name
		} else {
			&file.static_name
		};
		table.insert(emote.name, ImageRef::new(format!("https:{}/{}", host.url, file_name)));
	}
	table
}

#[derive(Debug, Deserialize)]
struct SevenTvUser {
	#[serde(default)]
	emote_set: Option<SevenTvEmoteSet>,
}

#[derive(Debug, Deserialize)]
struct SevenTvEmoteSet {
	#[serde(default)]
	emotes: Vec<SevenTvEmote>,
}

#[derive(Debug, Deserialize)]
struct SevenTvEmote {
	name: String,
	data: SevenTvEmoteData,
}

#[derive(Debug, Deserialize)]
struct SevenTvEmoteData {
	host: SevenTvHost,
}

#[derive(Debug, Deserialize)]
struct SevenTvHost {
	url: String,
	#[serde(default)]
	files: Vec<SevenTvFile>,
}

#[derive(Debug, Deserialize)]
struct SevenTvFile {
	name: String,
	#[serde(default)]
	static_name: String,
	format: String,
}

#[cfg(test)]
mod tests {
	use super::*;
	use wiremock::matchers::{method, path};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	fn set_json(name: &str, host: &str) -> serde_json::Value {
		serde_json::json!({
			"emotes": [{
				"name": name,
				"data": {
					"host": {
						"url": host,
						"files": [
							{ "name": "1x.webp", "static_name": "1x_static.webp", "format": "WEBP" },
							{ "name": "2x.avif", "static_name": "2x_static.avif", "format": "AVIF" },
							{ "name": "2x.webp", "static_name": "2x_static.webp", "format": "WEBP" }
						]
					}
				}
			}]
		})
	}

	async fn directory(server: &MockServer) -> SevenTvDirectory {
		let base = Url::parse(&format!("{}/v3/", server.uri())).expect("mock url");
		SevenTvDirectory::with_base_url(base).expect("directory")
	}

	#[tokio::test]
	async fn resolves_channel_emote_before_global() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/v3/users/twitch/42"))
			.respond_with(
				ResponseTemplate::new(200).set_body_json(serde_json::json!({ "emote_set": set_json("catJAM", "//cdn.7tv.app/emote/abc") })),
			)
			.expect(1)
			.mount(&server)
			.await;
		Mock::given(method("GET"))
			.and(path("/v3/emote-sets/global"))
			.respond_with(ResponseTemplate::new(200).set_body_json(set_json("EZ", "//cdn.7tv.app/emote/ez")))
			.mount(&server)
			.await;

		let dir = directory(&server).await;
		let hit = dir.resolve("42", "7", "catJAM").await.expect("resolve");
		assert_eq!(hit, Some(ImageRef::new("https://cdn.7tv.app/emote/abc/2x_static.webp")));

		let global = dir.resolve("42", "7", "EZ").await.expect("resolve global");
		assert_eq!(global, Some(ImageRef::new("https://cdn.7tv.app/emote/ez/2x_static.webp")));

		assert_eq!(dir.resolve("42", "7", "nope").await.expect("resolve"), None);
	}

	#[tokio::test]
	async fn unknown_channel_falls_back_to_global() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/v3/users/twitch/404"))
			.respond_with(ResponseTemplate::new(404))
			.mount(&server)
			.await;
		Mock::given(method("GET"))
			.and(path("/v3/emote-sets/global"))
			.respond_with(ResponseTemplate::new(200).set_body_json(set_json("EZ", "//cdn.7tv.app/emote/ez")))
			.mount(&server)
			.await;

		let dir = directory(&server).await;
		let hit = dir.resolve("404", "7", "EZ").await.expect("resolve");
		assert!(hit.is_some());
	}

	#[tokio::test]
	async fn fetch_sniffs_image_format() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/img.gif"))
			.respond_with(ResponseTemplate::new(200).set_body_bytes(b"GIF89a\x01\x00".to_vec()))
			.mount(&server)
			.await;
		Mock::given(method("GET"))
			.and(path("/page.html"))
			.respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
			.mount(&server)
			.await;

		let dir = directory(&server).await;
		let image = dir
			.fetch(&ImageRef::new(format!("{}/img.gif", server.uri())))
			.await
			.expect("fetch gif");
		assert_eq!(image.format, ImageFormat::Gif);

		let err = dir.fetch(&ImageRef::new(format!("{}/page.html", server.uri()))).await;
		assert!(err.is_err(), "html must not be accepted as an emote image");
	}
}
