#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use relay_platform::{
	EmoteDirectory, EmoteImage, ImageFormat, ImageRef, ProfileLookup, StreamStatus, UserProfile, UserQuery,
};

/// Fixed profile/metadata answers.
#[derive(Debug, Default)]
pub struct StaticProfiles {
	users: Vec<UserProfile>,
	live: HashSet<String>,
	cheermotes: HashSet<String>,
	fail_users: AtomicBool,
	fail_streams: AtomicBool,
	user_lookups: AtomicUsize,
}

impl StaticProfiles {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_user(mut self, id: &str, login: &str, display: &str) -> Self {
		self.users.push(UserProfile {
			id: id.to_string(),
			login: login.to_ascii_lowercase(),
			display_name: display.to_string(),
			avatar_url: Some(format!("https://cdn.example/{login}.png")),
		});
		self
	}

	/// Mark a channel (by user id) as live.
	pub fn live(mut self, id: &str) -> Self {
		self.live.insert(id.to_string());
		self
	}

	pub fn with_cheermotes<I, S>(mut self, prefixes: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.cheermotes.extend(prefixes.into_iter().map(Into::into));
		self
	}

	pub fn set_fail_users(&self, fail: bool) {
		self.fail_users.store(fail, Ordering::Relaxed);
	}

	pub fn set_fail_streams(&self, fail: bool) {
		self.fail_streams.store(fail, Ordering::Relaxed);
	}

	pub fn user_lookups(&self) -> usize {
		self.user_lookups.load(Ordering::Relaxed)
	}
}

#[async_trait]
impl ProfileLookup for StaticProfiles {
	async fn get_user(&self, query: UserQuery<'_>) -> anyhow::Result<Option<UserProfile>> {
		self.user_lookups.fetch_add(1, Ordering::Relaxed);
		if self.fail_users.load(Ordering::Relaxed) {
			anyhow::bail!("static profiles: lookup {query} failed");
		}

		let found = self.users.iter().find(|u| match query {
			UserQuery::Login(login) => u.login.eq_ignore_ascii_case(login),
			UserQuery::Id(id) => u.id == id,
		});
		Ok(found.cloned())
	}

	async fn stream_status(&self, user_id: &str) -> anyhow::Result<StreamStatus> {
		if self.fail_streams.load(Ordering::Relaxed) {
			anyhow::bail!("static profiles: stream lookup for {user_id} failed");
		}
		Ok(if self.live.contains(user_id) {
			StreamStatus::Live
		} else {
			StreamStatus::Offline
		})
	}

	async fn cheermote_prefixes(&self) -> anyhow::Result<HashSet<String>> {
		Ok(self.cheermotes.clone())
	}
}

const PNG_STUB: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";
const GIF_STUB: &[u8] = b"GIF89a\x01\0\x01\0";

/// Fixed third-party emote set with stub images.
#[derive(Debug, Default)]
pub struct StaticEmotes {
	names: HashMap<String, ImageRef>,
	images: HashMap<String, ImageFormat>,
	broken: HashSet<String>,
	fetches: AtomicUsize,
}

impl StaticEmotes {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_emote(mut self, name: &str, url: &str, format: ImageFormat) -> Self {
		self.names.insert(name.to_string(), ImageRef::new(url));
		self.images.insert(url.to_string(), format);
		self
	}

	/// Serve an image for a URL without a directory name (native emotes).
	pub fn with_image(mut self, url: &str, format: ImageFormat) -> Self {
		self.images.insert(url.to_string(), format);
		self
	}

	/// Make fetches of `url` fail.
	pub fn broken(mut self, url: &str) -> Self {
		self.broken.insert(url.to_string());
		self
	}

	pub fn fetches(&self) -> usize {
		self.fetches.load(Ordering::Relaxed)
	}
}

#[async_trait]
impl EmoteDirectory for StaticEmotes {
	async fn resolve(&self, _channel_id: &str, _user_id: &str, name: &str) -> anyhow::Result<Option<ImageRef>> {
		Ok(self.names.get(name).cloned())
	}

	async fn fetch(&self, image: &ImageRef) -> anyhow::Result<EmoteImage> {
		self.fetches.fetch_add(1, Ordering::Relaxed);
		if self.broken.contains(&image.url) {
			anyhow::bail!("static emotes: GET {} failed: status=404", image.url);
		}

		let format = self.images.get(&image.url).copied().unwrap_or(ImageFormat::Png);
		let bytes = match format {
			ImageFormat::Gif => Bytes::from_static(GIF_STUB),
			_ => Bytes::from_static(PNG_STUB),
		};
		Ok(EmoteImage { bytes, format })
	}
}
