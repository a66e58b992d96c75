#![forbid(unsafe_code)]

//! Filesystem change notifications for configuration units and the emote file.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use relay_domain::UnitId;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::UnitChange;
use crate::config::is_unit_path;

pub const DEFAULT_WATCH_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
	Unit(UnitChange),
	EmotesChanged,
}

/// Keeps the underlying watcher alive; dropping it ends the event stream.
pub struct WatchGuard {
	_watcher: RecommendedWatcher,
}

#[derive(Debug, Clone)]
struct EmoteFile {
	name: OsString,
	dir: PathBuf,
}

impl EmoteFile {
	fn new(path: &Path) -> Option<Self> {
		let name = path.file_name()?.to_os_string();
		let parent = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
		let dir = parent.canonicalize().unwrap_or_else(|_| parent.to_path_buf());
		Some(Self { name, dir })
	}

	fn matches(&self, path: &Path) -> bool {
		if path.file_name() != Some(self.name.as_os_str()) {
			return false;
		}
		path.parent()
			.map(|p| p.canonicalize().unwrap_or_else(|_| p.to_path_buf()))
			.is_some_and(|p| p == self.dir)
	}
}

/// Watch `units_dir` (and the directory of `emotes_path`) and forward
/// classified changes over a tokio channel.
pub fn spawn_watcher(
	units_dir: &Path,
	emotes_path: Option<&Path>,
	capacity: usize,
) -> anyhow::Result<(WatchGuard, mpsc::Receiver<WatchEvent>)> {
	let (tx, rx) = mpsc::channel(capacity.max(1));
	let emotes = emotes_path.and_then(EmoteFile::new);
	let classify_emotes = emotes.clone();

	let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
		Ok(event) => {
			for ev in classify(&event, classify_emotes.as_ref()) {
				// Runs on the notifier's own thread, outside the runtime.
				if tx.blocking_send(ev).is_err() {
					debug!("watch receiver dropped; discarding change");
					return;
				}
			}
		}
		Err(e) => warn!(error = %e, "filesystem watcher error"),
	})
	.context("create filesystem watcher")?;

	watcher
		.watch(units_dir, RecursiveMode::NonRecursive)
		.with_context(|| format!("watch {}", units_dir.display()))?;

	if let Some(emotes) = &emotes {
		let units_canon = units_dir.canonicalize().unwrap_or_else(|_| units_dir.to_path_buf());
		if emotes.dir != units_canon {
			watcher
				.watch(&emotes.dir, RecursiveMode::NonRecursive)
				.with_context(|| format!("watch {}", emotes.dir.display()))?;
		}
	}

	info!(dir = %units_dir.display(), "watching configuration units");
	Ok((WatchGuard { _watcher: watcher }, rx))
}

fn classify(event: &Event, emotes: Option<&EmoteFile>) -> Vec<WatchEvent> {
	let mut out = Vec::new();
	for path in &event.paths {
		if emotes.is_some_and(|e| e.matches(path)) {
			if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) && !out.contains(&WatchEvent::EmotesChanged) {
				out.push(WatchEvent::EmotesChanged);
			}
			continue;
		}

		if !is_unit_path(path) {
			continue;
		}
		let Ok(unit) = UnitId::from_path(path) else {
			continue;
		};

		let change = match event.kind {
			EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => UnitChange::Created(unit),
			EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(RenameMode::From)) => UnitChange::Removed(unit),
			EventKind::Modify(_) if path.exists() => UnitChange::Modified(unit),
			EventKind::Modify(_) => UnitChange::Removed(unit),
			_ => continue,
		};
		out.push(WatchEvent::Unit(change));
	}
	out
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use notify::event::{CreateKind, DataChange, RemoveKind};

	use super::*;

	fn event(kind: EventKind, path: PathBuf) -> Event {
		Event::new(kind).add_path(path)
	}

	#[test]
	fn unit_files_map_to_changes() {
		let dir = tempfile::tempdir().expect("tempdir");
		let path = dir.path().join("alpha.relay.toml");
		std::fs::write(&path, "").expect("write");
		let unit = UnitId::from_path(&path).expect("unit");

		let created = classify(&event(EventKind::Create(CreateKind::File), path.clone()), None);
		assert_eq!(created, vec![WatchEvent::Unit(UnitChange::Created(unit.clone()))]);

		let modified = classify(
			&event(EventKind::Modify(ModifyKind::Data(DataChange::Content)), path.clone()),
			None,
		);
		assert_eq!(modified, vec![WatchEvent::Unit(UnitChange::Modified(unit.clone()))]);

		std::fs::remove_file(&path).expect("remove");
		let removed = classify(&event(EventKind::Remove(RemoveKind::File), path), None);
		assert_eq!(removed, vec![WatchEvent::Unit(UnitChange::Removed(unit))]);
	}

	#[test]
	fn unrelated_files_are_ignored() {
		let dir = tempfile::tempdir().expect("tempdir");
		let ev = event(EventKind::Create(CreateKind::File), dir.path().join("notes.toml"));
		assert!(classify(&ev, None).is_empty());
	}

	#[test]
	fn emote_file_writes_request_a_refresh() {
		let dir = tempfile::tempdir().expect("tempdir");
		let emotes_path = dir.path().join("emotes.toml");
		std::fs::write(&emotes_path, "[emotes]\n").expect("write");
		let emotes = EmoteFile::new(&emotes_path).expect("emote file");

		let ev = event(EventKind::Modify(ModifyKind::Any), emotes_path.clone());
		assert_eq!(classify(&ev, Some(&emotes)), vec![WatchEvent::EmotesChanged]);

		let removed = event(EventKind::Remove(RemoveKind::File), emotes_path);
		assert!(classify(&removed, Some(&emotes)).is_empty());
	}

	#[tokio::test]
	async fn watcher_reports_new_units() {
		let dir = tempfile::tempdir().expect("tempdir");
		let (_guard, mut rx) = spawn_watcher(dir.path(), None, 16).expect("watcher");

		let path = dir.path().join("beta.relay.toml");
		std::fs::write(&path, "channels = []\n").expect("write");
		let unit = UnitId::from_path(&path).expect("unit");

		let seen = tokio::time::timeout(Duration::from_secs(10), async {
			while let Some(ev) = rx.recv().await {
				if let WatchEvent::Unit(change) = ev
					&& change.unit() == &unit
				{
					return true;
				}
			}
			false
		})
		.await
		.expect("watch event in time");
		assert!(seen);
	}
}
