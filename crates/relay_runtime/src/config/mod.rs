#![forbid(unsafe_code)]

mod settings;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::Regex;
use relay_domain::{ChannelName, UnitId};
use relay_platform::SecretString;
use serde::Deserialize;
use thiserror::Error;

pub use settings::{RuntimeSettings, Timings, default_settings_path, load_runtime_settings_from_path};

/// File-name suffix that marks a configuration unit.
pub const UNIT_SUFFIX: &str = ".relay.toml";

/// Errors raised while loading a configuration unit.
#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("read {path}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
	#[error("parse {unit}: {source}")]
	Parse {
		unit: String,
		#[source]
		source: toml::de::Error,
	},
	#[error("missing required field `{0}`")]
	MissingField(&'static str),
	#[error("invalid `{field}`: {reason}")]
	InvalidField { field: &'static str, reason: String },
	#[error("`{field}` is no longer supported, use `{replacement}`")]
	Deprecated {
		field: &'static str,
		replacement: &'static str,
	},
}

/// Off / on / numeric-floor feature switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeatureToggle {
	Off,
	#[default]
	On,
	/// Enabled for values at or above the floor.
	Threshold(u64),
}

impl FeatureToggle {
	pub fn admits(self, value: u64) -> bool {
		match self {
			Self::Off => false,
			Self::On => true,
			Self::Threshold(floor) => value >= floor,
		}
	}
}

/// Gate on the channel's live status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamGate {
	#[default]
	Any,
	/// Relay only while the channel is live.
	Online,
	/// Relay only while the channel is offline.
	Offline,
}

/// Webhook endpoint split into its id and token.
#[derive(Debug, Clone)]
pub struct WebhookEndpoint {
	pub url: SecretString,
	pub id: String,
	pub token: SecretString,
}

impl WebhookEndpoint {
	pub fn parse(url: &str) -> Result<Self, ConfigError> {
		let trimmed = url.trim().trim_end_matches('/');
		let mut segments = trimmed.rsplit('/');
		let token = segments.next().filter(|s| !s.is_empty());
		let id = segments.next().filter(|s| !s.is_empty() && !s.ends_with(':'));
		let (Some(token), Some(id)) = (token, id) else {
			return Err(ConfigError::InvalidField {
				field: "webhook_url",
				reason: "expected .../<id>/<token>".to_string(),
			});
		};

		Ok(Self {
			url: SecretString::new(trimmed),
			id: id.to_string(),
			token: SecretString::new(token),
		})
	}
}

/// Chat source credentials.
#[derive(Debug, Clone)]
pub struct SourceCredentials {
	pub client_id: String,
	pub username: String,
	pub oauth_password: SecretString,
}

/// Allow/deny rules applied to inbound messages.
#[derive(Debug, Clone, Default)]
pub struct FilterRules {
	pub blacklist: HashSet<String>,
	pub badges: HashSet<String>,
	pub usernames: HashSet<String>,
	pub messages: Vec<Regex>,
}

impl FilterRules {
	pub fn is_blacklisted(&self, login: &str) -> bool {
		self.blacklist.contains(&login.to_ascii_lowercase())
	}

	pub fn allows_user(&self, login: &str) -> bool {
		self.usernames.contains(&login.to_ascii_lowercase())
	}

	pub fn allows_any_badge<'a>(&self, badges: impl IntoIterator<Item = &'a String>) -> bool {
		badges.into_iter().any(|b| self.badges.contains(&b.to_ascii_lowercase()))
	}

	pub fn allows_text(&self, text: &str) -> bool {
		self.messages.iter().any(|re| re.is_match(text))
	}
}

/// Immutable snapshot of one configuration unit.
#[derive(Debug, Clone)]
pub struct ConfigSpec {
	pub unit: UnitId,
	pub webhook: WebhookEndpoint,
	pub credentials: SourceCredentials,
	pub channels: Vec<ChannelName>,
	pub filters: FilterRules,
	pub send_all: bool,
	pub prevent_mentions: bool,
	pub bits: FeatureToggle,
	pub hype_chat: FeatureToggle,
	pub raids: FeatureToggle,
	pub announcements: bool,
	pub mirror_moderation: bool,
	pub stream_gate: StreamGate,
	pub first_message_quota: Option<u32>,
	/// Reply-thread depth; 0 keeps every line.
	pub thread_limit: usize,
	pub grab_emotes: bool,
	pub output_log: bool,
	/// Per-unit emote replacements, layered over the shared cache.
	pub emote_translator: HashMap<String, String>,
}

pub type ConfigSnapshot = Arc<ConfigSpec>;

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(untagged)]
enum FileToggle {
	Flag(bool),
	Floor(i64),
}

#[derive(Debug, Default, Deserialize)]
struct FileModTools {
	log_first_messages: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct FileUnit {
	webhook_url: Option<String>,
	twitch_client_id: Option<String>,
	twitch_username: Option<String>,
	oauth_password: Option<String>,

	channel: Option<String>,
	#[serde(default)]
	channels: Vec<String>,

	send_all_messages: Option<bool>,
	prevent_ping: Option<bool>,
	mod_actions: Option<bool>,
	show_announcement_messages: Option<bool>,
	grab_emotes: Option<bool>,
	output_log: Option<bool>,

	show_bit_gifters: Option<FileToggle>,
	show_hype_chat: Option<FileToggle>,
	show_raid_messages: Option<FileToggle>,
	show_hyber_chat: Option<toml::Value>,

	#[serde(default)]
	blacklist: Vec<String>,
	#[serde(default)]
	filter_badges: Vec<String>,
	#[serde(default)]
	filter_usernames: Vec<String>,
	#[serde(default)]
	filter_messages: Vec<String>,

	on_stream_status: Option<String>,

	#[serde(default)]
	mod_tools: FileModTools,

	thread_limit: Option<usize>,

	#[serde(default)]
	emote_translator: BTreeMap<String, String>,
}

fn required(value: Option<String>, field: &'static str) -> Result<String, ConfigError> {
	value
		.map(|s| s.trim().to_string())
		.filter(|s| !s.is_empty())
		.ok_or(ConfigError::MissingField(field))
}

fn toggle(value: Option<FileToggle>, field: &'static str) -> Result<FeatureToggle, ConfigError> {
	match value {
		None | Some(FileToggle::Flag(true)) => Ok(FeatureToggle::On),
		Some(FileToggle::Flag(false)) => Ok(FeatureToggle::Off),
		Some(FileToggle::Floor(n)) => u64::try_from(n)
			.map(FeatureToggle::Threshold)
			.map_err(|_| ConfigError::InvalidField {
				field,
				reason: format!("threshold must be non-negative, got {n}"),
			}),
	}
}

fn lowered_set(values: Vec<String>) -> HashSet<String> {
	values
		.into_iter()
		.map(|s| s.trim().to_ascii_lowercase())
		.filter(|s| !s.is_empty())
		.collect()
}

impl ConfigSpec {
	/// Parse a unit from TOML text.
	pub fn from_toml_str(unit: UnitId, text: &str) -> Result<Self, ConfigError> {
		let file: FileUnit = toml::from_str(text).map_err(|source| ConfigError::Parse {
			unit: unit.to_string(),
			source,
		})?;
		Self::from_file(unit, file)
	}

	fn from_file(unit: UnitId, file: FileUnit) -> Result<Self, ConfigError> {
		if file.show_hyber_chat.is_some() {
			return Err(ConfigError::Deprecated {
				field: "show_hyber_chat",
				replacement: "show_hype_chat",
			});
		}

		let webhook = WebhookEndpoint::parse(&required(file.webhook_url, "webhook_url")?)?;
		let credentials = SourceCredentials {
			client_id: required(file.twitch_client_id, "twitch_client_id")?,
			username: required(file.twitch_username, "twitch_username")?,
			oauth_password: SecretString::new(required(file.oauth_password, "oauth_password")?),
		};

		let mut channels: Vec<ChannelName> = Vec::new();
		for raw in file.channel.into_iter().chain(file.channels) {
			let channel = ChannelName::new(&raw).map_err(|e| ConfigError::InvalidField {
				field: "channels",
				reason: format!("{raw:?}: {e}"),
			})?;
			if !channels.contains(&channel) {
				channels.push(channel);
			}
		}
		if channels.is_empty() {
			return Err(ConfigError::MissingField("channels"));
		}

		let messages = file
			.filter_messages
			.iter()
			.map(|pattern| {
				Regex::new(pattern).map_err(|e| ConfigError::InvalidField {
					field: "filter_messages",
					reason: e.to_string(),
				})
			})
			.collect::<Result<Vec<_>, _>>()?;

		let stream_gate = match file.on_stream_status.as_deref().map(str::trim) {
			None | Some("") => StreamGate::Any,
			Some(v) if v.eq_ignore_ascii_case("online") => StreamGate::Online,
			Some(v) if v.eq_ignore_ascii_case("offline") => StreamGate::Offline,
			Some(other) => {
				return Err(ConfigError::InvalidField {
					field: "on_stream_status",
					reason: format!("expected \"online\" or \"offline\", got {other:?}"),
				});
			}
		};

		Ok(Self {
			unit,
			webhook,
			credentials,
			channels,
			filters: FilterRules {
				blacklist: lowered_set(file.blacklist),
				badges: lowered_set(file.filter_badges),
				usernames: lowered_set(file.filter_usernames),
				messages,
			},
			send_all: file.send_all_messages.unwrap_or(false),
			prevent_mentions: file.prevent_ping.unwrap_or(false),
			bits: toggle(file.show_bit_gifters, "show_bit_gifters")?,
			hype_chat: toggle(file.show_hype_chat, "show_hype_chat")?,
			raids: toggle(file.show_raid_messages, "show_raid_messages")?,
			announcements: file.show_announcement_messages.unwrap_or(false),
			mirror_moderation: file.mod_actions.unwrap_or(false),
			stream_gate,
			first_message_quota: file.mod_tools.log_first_messages,
			thread_limit: file.thread_limit.unwrap_or(0),
			grab_emotes: file.grab_emotes.unwrap_or(false),
			output_log: file.output_log.unwrap_or(false),
			emote_translator: file
				.emote_translator
				.into_iter()
				.filter(|(k, v)| !k.trim().is_empty() && !v.trim().is_empty())
				.collect(),
		})
	}
}

/// Where configuration units come from.
pub trait ConfigSource: Send + Sync + 'static {
	fn list_units(&self) -> Result<Vec<UnitId>, ConfigError>;

	fn load(&self, unit: &UnitId) -> Result<ConfigSpec, ConfigError>;
}

/// Whether a path names a configuration unit file.
pub fn is_unit_path(path: &Path) -> bool {
	path.file_name()
		.and_then(|n| n.to_str())
		.is_some_and(|n| n.len() > UNIT_SUFFIX.len() && n.ends_with(UNIT_SUFFIX))
}

/// Units stored as `*.relay.toml` files in one directory.
#[derive(Debug, Clone)]
pub struct FileConfigSource {
	dir: PathBuf,
}

impl FileConfigSource {
	pub fn new(dir: impl Into<PathBuf>) -> Self {
		Self { dir: dir.into() }
	}

	pub fn dir(&self) -> &Path {
		&self.dir
	}
}

impl ConfigSource for FileConfigSource {
	fn list_units(&self) -> Result<Vec<UnitId>, ConfigError> {
		let entries = fs::read_dir(&self.dir).map_err(|source| ConfigError::Io {
			path: self.dir.clone(),
			source,
		})?;

		let mut units: Vec<UnitId> = entries
			.filter_map(|entry| entry.ok().map(|e| e.path()))
			.filter(|path| path.is_file() && is_unit_path(path))
			.filter_map(|path| UnitId::from_path(&path).ok())
			.collect();
		units.sort();
		Ok(units)
	}

	fn load(&self, unit: &UnitId) -> Result<ConfigSpec, ConfigError> {
		let path = unit.to_path();
		let text = fs::read_to_string(&path).map_err(|source| ConfigError::Io { path, source })?;
		ConfigSpec::from_toml_str(unit.clone(), &text)
	}
}
