#![forbid(unsafe_code)]

pub mod assets;
pub mod twitch;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use relay_domain::{ChannelName, MessageId, UserId};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub use assets::ImageFormat;

/// Tag carrying the cheered bit amount.
pub const TAG_BITS: &str = "bits";
/// Tag carrying a paid pinned message (hype chat) amount.
pub const TAG_PAID_AMOUNT: &str = "pinned-chat-paid-amount";
/// Tag set on an author's first message in a channel.
pub const TAG_FIRST_MSG: &str = "first-msg";
/// Tag carrying the raiding party size.
pub const TAG_VIEWER_COUNT: &str = "msg-param-viewerCount";

/// Events produced by a chat session.
#[derive(Debug, Clone)]
pub enum ChatEvent {
	/// Session connected to the chat service.
	Connected,
	Message(Box<PrivateMessage>),
	/// A ban or timeout.
	ClearChat(ClearChat),
	/// A single message deletion.
	ClearMessage(ClearMessage),
	UserNotice(UserNotice),
	/// The session sent a liveness ping.
	Ping,
	/// The chat service answered a liveness ping.
	Pong,
}

impl ChatEvent {
	/// Stable name for logs and metrics.
	pub fn kind(&self) -> &'static str {
		match self {
			Self::Connected => "connected",
			Self::Message(_) => "message",
			Self::ClearChat(_) => "clear_chat",
			Self::ClearMessage(_) => "clear_message",
			Self::UserNotice(_) => "user_notice",
			Self::Ping => "ping",
			Self::Pong => "pong",
		}
	}
}

/// Loosely-typed tag bag attached to inbound events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tags(BTreeMap<String, String>);

impl Tags {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
		self.insert(key, value);
		self
	}

	pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
		self.0.insert(key.into(), value.into());
	}

	pub fn get(&self, key: &str) -> Option<&str> {
		self.0.get(key).map(String::as_str)
	}

	/// Numeric tag value; missing or malformed values read as 0.
	pub fn get_u64(&self, key: &str) -> u64 {
		self.get(key).and_then(|v| v.trim().parse().ok()).unwrap_or(0)
	}

	/// Boolean tag (`1`/`true`).
	pub fn flag(&self, key: &str) -> bool {
		matches!(self.get(key).map(str::trim), Some("1") | Some("true"))
	}
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Tags {
	fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
		Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
	}
}

/// Message author as seen by the chat source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Author {
	pub id: UserId,
	pub login: String,
	pub display: String,
	/// Badge names (`broadcaster`, `moderator`, `subscriber`, ...).
	pub badges: BTreeSet<String>,
}

impl Author {
	pub fn has_badge(&self, badge: &str) -> bool {
		self.badges.contains(badge)
	}
}

/// Native emote occurrence in a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmoteSpan {
	pub id: String,
	pub name: String,
}

/// Reply-parent reference carried by a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyRef {
	pub parent_id: MessageId,
	pub parent_login: String,
	pub parent_display: String,
	pub parent_text: String,
	/// Root message of the thread this reply belongs to.
	pub thread_root_id: MessageId,
}

#[derive(Debug, Clone)]
pub struct PrivateMessage {
	pub id: MessageId,
	pub channel: ChannelName,
	pub channel_id: Option<UserId>,
	pub author: Author,
	pub text: String,
	pub emotes: Vec<EmoteSpan>,
	pub reply: Option<ReplyRef>,
	pub tags: Tags,
}

/// Ban or timeout of one user, or a full chat clear when `target` is absent.
#[derive(Debug, Clone)]
pub struct ClearChat {
	pub channel: ChannelName,
	pub target: Option<ModerationTarget>,
	/// `None` for a permanent ban.
	pub duration: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModerationTarget {
	pub id: UserId,
	pub login: String,
}

#[derive(Debug, Clone)]
pub struct ClearMessage {
	pub channel: ChannelName,
	pub message_id: MessageId,
	pub login: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoticeKind {
	Raid,
	Announcement,
	Other(String),
}

impl NoticeKind {
	/// Map the upstream `msg-id` value.
	pub fn from_msg_id(msg_id: &str) -> Self {
		match msg_id {
			"raid" => Self::Raid,
			"announcement" => Self::Announcement,
			other => Self::Other(other.to_string()),
		}
	}
}

#[derive(Debug, Clone)]
pub struct UserNotice {
	pub channel: ChannelName,
	pub kind: NoticeKind,
	pub user: Author,
	pub text: Option<String>,
	pub tags: Tags,
}

pub type ChatEventTx = mpsc::Sender<ChatEvent>;
pub type ChatEventRx = mpsc::Receiver<ChatEvent>;

/// Default capacity for chat event channels.
pub const DEFAULT_CHAT_EVENT_CAPACITY: usize = 1_024;

pub fn bounded_chat_channel(capacity: usize) -> (ChatEventTx, ChatEventRx) {
	mpsc::channel(capacity.max(1))
}

/// One connection to the chat source.
///
/// `connect` hands back the event stream; the stream ending means the
/// connection is gone and can only be restored by building a new session.
#[async_trait::async_trait]
pub trait ChatSession: Send + 'static {
	async fn connect(&mut self) -> anyhow::Result<ChatEventRx>;

	async fn join(&mut self, channels: &[ChannelName]) -> anyhow::Result<()>;

	/// Send a liveness ping; the answer arrives as [`ChatEvent::Pong`].
	async fn ping(&mut self) -> anyhow::Result<()>;

	async fn disconnect(&mut self);
}

/// Identifier of a message created on the delivery target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveredId(pub String);

impl fmt::Display for DeliveredId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Identifier of a temporary asset on the delivery target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssetId(pub String);

impl fmt::Display for AssetId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedAuthor {
	pub name: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub icon_url: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Embed {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub title: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub description: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub author: Option<EmbedAuthor>,
}

/// Message posted to the delivery target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
	pub username: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub avatar_url: Option<String>,
	pub content: String,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub embeds: Vec<Embed>,
	pub allow_mentions: bool,
}

/// Partial edit of an already delivered message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePatch {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub content: Option<String>,
}

/// Downloaded emote image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmoteImage {
	pub bytes: Bytes,
	pub format: ImageFormat,
}

/// Temporary asset created for one emote lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemporaryAsset {
	pub id: AssetId,
	/// Target-native inline reference (e.g. `<:name:id>`).
	pub reference: String,
}

/// Posting side of a relay.
#[async_trait::async_trait]
pub trait DeliveryTarget: Send + Sync + 'static {
	async fn create_message(&self, message: &OutboundMessage) -> anyhow::Result<DeliveredId>;

	async fn update_message(&self, id: &DeliveredId, patch: &MessagePatch) -> anyhow::Result<()>;

	async fn create_temporary_asset(&self, name: &str, image: &EmoteImage) -> anyhow::Result<TemporaryAsset>;

	async fn delete_asset(&self, id: &AssetId) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub enum UserQuery<'a> {
	Login(&'a str),
	Id(&'a str),
}

impl fmt::Display for UserQuery<'_> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Login(login) => write!(f, "login={login}"),
			Self::Id(id) => write!(f, "id={id}"),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
	pub id: String,
	pub login: String,
	pub display_name: String,
	pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
	Live,
	Offline,
}

/// Upstream profile and channel metadata.
#[async_trait::async_trait]
pub trait ProfileLookup: Send + Sync + 'static {
	async fn get_user(&self, query: UserQuery<'_>) -> anyhow::Result<Option<UserProfile>>;

	async fn stream_status(&self, user_id: &str) -> anyhow::Result<StreamStatus>;

	async fn cheermote_prefixes(&self) -> anyhow::Result<HashSet<String>>;
}

/// Upstream image reference for an emote not known to the delivery target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef {
	pub url: String,
}

impl ImageRef {
	pub fn new(url: impl Into<String>) -> Self {
		Self { url: url.into() }
	}
}

/// Third-party emote provider.
#[async_trait::async_trait]
pub trait EmoteDirectory: Send + Sync + 'static {
	async fn resolve(&self, channel_id: &str, user_id: &str, name: &str) -> anyhow::Result<Option<ImageRef>>;

	/// Download an image and detect its format.
	async fn fetch(&self, image: &ImageRef) -> anyhow::Result<EmoteImage>;
}

/// Wrapper that redacts in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl serde::Serialize for SecretString {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_str("")
	}
}

impl<'de> serde::Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}
