#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;

/// Image encodings the delivery target accepts for temporary assets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
	Png,
	Gif,
	Jpeg,
	Webp,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown image format")]
pub struct UnknownImageFormat;

const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";
const JPEG_MAGIC: &[u8] = b"\xFF\xD8\xFF";
const GIF87_MAGIC: &[u8] = b"GIF87a";
const GIF89_MAGIC: &[u8] = b"GIF89a";

impl ImageFormat {
	/// Detect the format from the leading magic bytes.
	pub fn sniff(data: &[u8]) -> Result<Self, UnknownImageFormat> {
		if data.starts_with(PNG_MAGIC) {
			Ok(Self::Png)
		} else if data.starts_with(JPEG_MAGIC) {
			Ok(Self::Jpeg)
		} else if data.starts_with(GIF89_MAGIC) || data.starts_with(GIF87_MAGIC) {
			Ok(Self::Gif)
		} else if data.len() >= 12 && &data[..4] == b"RIFF" && &data[8..12] == b"WEBP" {
			Ok(Self::Webp)
		} else {
			Err(UnknownImageFormat)
		}
	}

	/// Parse a provider-reported format name.
	pub fn from_name(name: &str) -> Option<Self> {
		match name.trim().to_ascii_lowercase().as_str() {
			"png" => Some(Self::Png),
			"gif" => Some(Self::Gif),
			"jpg" | "jpeg" => Some(Self::Jpeg),
			"webp" => Some(Self::Webp),
			_ => None,
		}
	}

	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Png => "png",
			Self::Gif => "gif",
			Self::Jpeg => "jpeg",
			Self::Webp => "webp",
		}
	}

	pub const fn mime(self) -> &'static str {
		match self {
			Self::Png => "image/png",
			Self::Gif => "image/gif",
			Self::Jpeg => "image/jpeg",
			Self::Webp => "image/webp",
		}
	}

	pub const fn is_animated(self) -> bool {
		matches!(self, Self::Gif)
	}
}

impl fmt::Display for ImageFormat {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

struct Cached<T> {
	fetched_at: Instant,
	value: T,
}

/// Keyed cache whose entries expire after a fixed TTL.
pub(crate) struct TtlCache<T> {
	ttl: Duration,
	entries: Mutex<HashMap<String, Cached<T>>>,
}

impl<T: Clone> TtlCache<T> {
	pub(crate) fn new(ttl: Duration) -> Self {
		Self {
			ttl,
			entries: Mutex::new(HashMap::new()),
		}
	}

	pub(crate) fn get(&self, key: &str) -> Option<T> {
		let mut guard = self.entries.lock();
		let entry = guard.get(key)?;
		if entry.fetched_at.elapsed() <= self.ttl {
			Some(entry.value.clone())
		} else {
			guard.remove(key);
			None
		}
	}

	pub(crate) fn insert(&self, key: impl Into<String>, value: T) {
		self.entries.lock().insert(
			key.into(),
			Cached {
				fetched_at: Instant::now(),
				value,
			},
		);
		self.prune();
	}

	fn prune(&self) {
		let ttl = self.ttl;
		self.entries.lock().retain(|_, entry| entry.fetched_at.elapsed() <= ttl);
	}
}
