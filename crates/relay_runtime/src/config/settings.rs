#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::{info, warn};

/// Default process settings path: `~/.relay/relay.toml`.
pub fn default_settings_path() -> anyhow::Result<PathBuf> {
	Ok(relay_home()?.join("relay.toml"))
}

fn relay_home() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".relay"))
}

/// Fixed delays and intervals used by the supervisor and its instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
	/// Change notifications within this window of the last applied change are ignored.
	pub debounce: Duration,
	pub health_sweep: Duration,
	/// Delay between connecting and joining channels.
	pub settle: Duration,
	pub ping_interval: Duration,
	/// How long a ping may stay unanswered.
	pub pong_grace: Duration,
	/// How long temporary emote assets stay alive after the edit.
	pub lease_hold: Duration,
	/// Pause after the first part of a split ban notice.
	pub ban_cooldown: Duration,
}

impl Default for Timings {
	fn default() -> Self {
		Self {
			debounce: Duration::from_secs(2),
			health_sweep: Duration::from_secs(30),
			settle: Duration::from_secs(5),
			ping_interval: Duration::from_secs(60),
			pong_grace: Duration::from_secs(3),
			lease_hold: Duration::from_secs(5),
			ban_cooldown: Duration::from_secs(1),
		}
	}
}

/// Process-wide relay settings.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
	/// Directory holding `*.relay.toml` units.
	pub units_dir: PathBuf,
	/// Shared emote replacement table.
	pub emotes_path: PathBuf,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	pub timings: Timings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileSettings {
	units_dir: Option<String>,
	emotes_path: Option<String>,
	health_bind: Option<String>,
	debounce_ms: Option<u64>,
	health_sweep_secs: Option<u64>,
	settle_ms: Option<u64>,
	ping_interval_secs: Option<u64>,
	pong_grace_ms: Option<u64>,
	lease_hold_ms: Option<u64>,
}

impl RuntimeSettings {
	fn from_file(file: FileSettings, home: &Path) -> Self {
		let defaults = Timings::default();
		Self {
			units_dir: file
				.units_dir
				.filter(|s| !s.trim().is_empty())
				.map(PathBuf::from)
				.unwrap_or_else(|| home.join("units")),
			emotes_path: file
				.emotes_path
				.filter(|s| !s.trim().is_empty())
				.map(PathBuf::from)
				.unwrap_or_else(|| home.join("emotes.toml")),
			health_bind: file.health_bind.filter(|s| !s.trim().is_empty()),
			timings: Timings {
				debounce: file.debounce_ms.map(Duration::from_millis).unwrap_or(defaults.debounce),
				health_sweep: file
					.health_sweep_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(defaults.health_sweep),
				settle: file.settle_ms.map(Duration::from_millis).unwrap_or(defaults.settle),
				ping_interval: file
					.ping_interval_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(defaults.ping_interval),
				pong_grace: file.pong_grace_ms.map(Duration::from_millis).unwrap_or(defaults.pong_grace),
				lease_hold: file.lease_hold_ms.map(Duration::from_millis).unwrap_or(defaults.lease_hold),
				ban_cooldown: defaults.ban_cooldown,
			},
		}
	}
}

/// Load process settings from TOML plus `RELAY_*` env overrides.
pub fn load_runtime_settings_from_path(path: &Path) -> anyhow::Result<RuntimeSettings> {
	let file = read_toml_if_exists(path)
		.with_context(|| format!("read settings from {}", path.display()))?
		.unwrap_or_default();

	let home = path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
	let mut settings = RuntimeSettings::from_file(file, &home);
	apply_env_overrides(&mut settings);
	Ok(settings)
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileSettings>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileSettings = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read settings file")),
	}
}

fn env_duration(name: &str, unit: fn(u64) -> Duration) -> Option<Duration> {
	let v = std::env::var(name).ok()?;
	match v.trim().parse::<u64>() {
		Ok(n) => Some(unit(n)),
		Err(e) => {
			warn!(env = name, value = %v, error = %e, "ignoring malformed duration override");
			None
		}
	}
}

fn apply_env_overrides(settings: &mut RuntimeSettings) {
	if let Ok(v) = std::env::var("RELAY_UNITS_DIR") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			settings.units_dir = PathBuf::from(v);
			info!("relay settings: units_dir overridden by env");
		}
	}

	if let Ok(v) = std::env::var("RELAY_EMOTES_PATH") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			settings.emotes_path = PathBuf::from(v);
			info!("relay settings: emotes_path overridden by env");
		}
	}

	if let Ok(v) = std::env::var("RELAY_HEALTH_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			settings.health_bind = Some(v);
			info!("relay settings: health_bind overridden by env");
		}
	}

	if let Some(d) = env_duration("RELAY_DEBOUNCE_MS", Duration::from_millis) {
		settings.timings.debounce = d;
		info!(debounce_ms = d.as_millis(), "relay settings: debounce overridden by env");
	}

	if let Some(d) = env_duration("RELAY_HEALTH_SWEEP_SECS", Duration::from_secs).filter(|d| !d.is_zero()) {
		settings.timings.health_sweep = d;
		info!(health_sweep_secs = d.as_secs(), "relay settings: health_sweep overridden by env");
	}

	if let Some(d) = env_duration("RELAY_SETTLE_MS", Duration::from_millis) {
		settings.timings.settle = d;
		info!(settle_ms = d.as_millis(), "relay settings: settle overridden by env");
	}

	if let Some(d) = env_duration("RELAY_PING_INTERVAL_SECS", Duration::from_secs).filter(|d| !d.is_zero()) {
		settings.timings.ping_interval = d;
		info!(ping_interval_secs = d.as_secs(), "relay settings: ping_interval overridden by env");
	}

	if let Some(d) = env_duration("RELAY_PONG_GRACE_MS", Duration::from_millis) {
		settings.timings.pong_grace = d;
		info!(pong_grace_ms = d.as_millis(), "relay settings: pong_grace overridden by env");
	}
}
