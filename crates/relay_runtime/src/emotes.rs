#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::info;

pub type EmoteTable = Arc<HashMap<String, String>>;

#[derive(Debug, Default, Deserialize)]
struct FileEmotes {
	#[serde(default)]
	emotes: BTreeMap<String, String>,
}

/// Shared emote-name -> delivery-native reference table.
///
/// One cache is owned by the supervisor and handed to every instance;
/// readers take cheap snapshots, `refresh` swaps the whole table.
#[derive(Debug)]
pub struct EmoteCache {
	path: Option<PathBuf>,
	table: RwLock<EmoteTable>,
}

impl EmoteCache {
	pub fn empty() -> Self {
		Self {
			path: None,
			table: RwLock::new(Arc::new(HashMap::new())),
		}
	}

	pub fn from_entries<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Self
	where
		K: Into<String>,
		V: Into<String>,
	{
		let table = entries.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
		Self {
			path: None,
			table: RwLock::new(Arc::new(table)),
		}
	}

	/// Load the table from a TOML file; a missing file yields an empty cache.
	pub fn load(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
		let path = path.into();
		let table = read_table(&path)?;
		info!(path = %path.display(), emotes = table.len(), "emote cache loaded");
		Ok(Self {
			path: Some(path),
			table: RwLock::new(Arc::new(table)),
		})
	}

	pub fn path(&self) -> Option<&Path> {
		self.path.as_deref()
	}

	pub fn snapshot(&self) -> EmoteTable {
		Arc::clone(&*self.table.read())
	}

	pub fn get(&self, name: &str) -> Option<String> {
		self.table.read().get(name).cloned()
	}

	/// Re-read the backing file. On error the previous table stays in place.
	pub fn refresh(&self) -> anyhow::Result<usize> {
		let path = self.path.as_deref().ok_or_else(|| anyhow!("emote cache has no backing file"))?;
		let table = read_table(path)?;
		let len = table.len();
		*self.table.write() = Arc::new(table);
		metrics::counter!("relay_emote_cache_refreshes_total").increment(1);
		info!(path = %path.display(), emotes = len, "emote cache refreshed");
		Ok(len)
	}
}

fn read_table(path: &Path) -> anyhow::Result<HashMap<String, String>> {
	let text = match fs::read_to_string(path) {
		Ok(s) => s,
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
		Err(e) => return Err(anyhow!(e).context(format!("read emote table {}", path.display()))),
	};

	let file: FileEmotes = toml::from_str(&text).with_context(|| format!("parse emote table {}", path.display()))?;
	Ok(file
		.emotes
		.into_iter()
		.map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
		.filter(|(k, v)| !k.is_empty() && !v.is_empty())
		.collect())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn missing_file_is_empty() {
		let dir = tempfile::tempdir().expect("tempdir");
		let cache = EmoteCache::load(dir.path().join("emotes.toml")).expect("load");
		assert!(cache.snapshot().is_empty());
	}

	#[test]
	fn refresh_swaps_table_and_keeps_old_on_error() {
		let dir = tempfile::tempdir().expect("tempdir");
		let path = dir.path().join("emotes.toml");
		fs::write(&path, "[emotes]\nKappa = \"<:Kappa:1>\"\n").expect("write");

		let cache = EmoteCache::load(&path).expect("load");
		let before = cache.snapshot();
		assert_eq!(cache.get("Kappa").as_deref(), Some("<:Kappa:1>"));

		fs::write(&path, "[emotes]\nKappa = \"<:Kappa:2>\"\nPogChamp = \"<:PogChamp:3>\"\n").expect("rewrite");
		assert_eq!(cache.refresh().expect("refresh"), 2);
		assert_eq!(cache.get("Kappa").as_deref(), Some("<:Kappa:2>"));
		assert_eq!(before.get("Kappa").map(String::as_str), Some("<:Kappa:1>"), "old snapshots are untouched");

		fs::write(&path, "[emotes\nbroken").expect("corrupt");
		assert!(cache.refresh().is_err());
		assert_eq!(cache.get("PogChamp").as_deref(), Some("<:PogChamp:3>"));
	}

	#[test]
	fn in_memory_cache_cannot_refresh() {
		let cache = EmoteCache::from_entries([("a", "b")]);
		assert!(cache.refresh().is_err());
		assert_eq!(cache.get("a").as_deref(), Some("b"));
	}
}
