#![forbid(unsafe_code)]

//! Decide whether a chat message is relayed and shape the outbound payload.

pub mod cheer;
pub mod format;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use relay_domain::{ChannelName, UserId};
use relay_platform::assets::twitch_emote_image;
use relay_platform::{
	Embed, ImageRef, OutboundMessage, PrivateMessage, ProfileLookup, StreamStatus, TAG_BITS, TAG_FIRST_MSG,
	TAG_PAID_AMOUNT, UserQuery,
};
use tracing::{debug, warn};

use crate::config::{ConfigSpec, StreamGate};
use crate::emotes::{EmoteCache, EmoteTable};
use crate::ledger::{LedgerEntry, SharedLedger};

pub use cheer::{EMPTY_PLACEHOLDER, strip_cheer_tokens};
pub use format::{format_duration, possessive};

/// Prefix added to an author's first message in a channel.
pub const FIRST_MESSAGE_PREFIX: &str = "`First Message`: ";
/// Title of the reply-thread embed.
pub const THREAD_TITLE: &str = "Thread Replies:";
/// Badges appended to the display name, in this order.
pub const ANNOTATED_BADGES: [&str; 3] = ["broadcaster", "moderator", "vip"];

/// Why a message was not relayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suppression {
	Blacklisted,
	StreamGate,
	Filtered,
}

impl Suppression {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Blacklisted => "blacklisted",
			Self::StreamGate => "stream_gate",
			Self::Filtered => "filtered",
		}
	}
}

/// Where the image of an unmapped emote can be found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmoteSource {
	/// Native chat emote with a known CDN image.
	Native(ImageRef),
	/// Plain word that might be a third-party emote.
	External,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEmote {
	pub name: String,
	pub source: EmoteSource,
}

/// Work left for the emote-lease edit cycle after the first send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmoteFollowUp {
	pub channel_id: Option<UserId>,
	pub author_id: UserId,
	/// Content as sent, before temporary assets exist.
	pub content: String,
	pub pending: Vec<PendingEmote>,
}

/// A message ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forwarded {
	pub message: OutboundMessage,
	/// Login whose profile image becomes the avatar.
	pub avatar_login: String,
	pub follow_up: Option<EmoteFollowUp>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
	Suppressed(Suppression),
	Forward(Box<Forwarded>),
}

impl Verdict {
	pub fn is_forward(&self) -> bool {
		matches!(self, Self::Forward(_))
	}
}

/// Per-author allowance after a first message.
#[derive(Debug, Default)]
pub struct FirstMessageThrottle {
	sent: Mutex<HashMap<UserId, u32>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
	/// Flagged first message: relay and prefix.
	First,
	/// Within the quota that follows a first message.
	Allowed,
	NotApplied,
}

impl FirstMessageThrottle {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn observe(&self, author: &UserId, first_message: bool, quota: Option<u32>) -> ThrottleDecision {
		let mut sent = self.sent.lock();
		let Some(quota) = quota else {
			sent.remove(author);
			return ThrottleDecision::NotApplied;
		};

		if first_message {
			sent.insert(author.clone(), 0);
			return ThrottleDecision::First;
		}

		match sent.get_mut(author) {
			Some(count) if *count < quota => {
				*count += 1;
				ThrottleDecision::Allowed
			}
			Some(_) => {
				sent.remove(author);
				ThrottleDecision::NotApplied
			}
			None => ThrottleDecision::NotApplied,
		}
	}

	pub fn tracked(&self) -> usize {
		self.sent.lock().len()
	}
}

/// Instance state that survives configuration reloads.
#[derive(Debug, Clone, Default)]
pub struct RelayState {
	pub ledger: SharedLedger,
	pub throttle: Arc<FirstMessageThrottle>,
}

/// Message pipeline of one instance; the config snapshot is passed per call.
pub struct Pipeline {
	profiles: Arc<dyn ProfileLookup>,
	emotes: Arc<EmoteCache>,
	ledger: SharedLedger,
	throttle: Arc<FirstMessageThrottle>,
}

impl Pipeline {
	pub fn new(profiles: Arc<dyn ProfileLookup>, emotes: Arc<EmoteCache>, state: RelayState) -> Self {
		Self {
			profiles,
			emotes,
			ledger: state.ledger,
			throttle: state.throttle,
		}
	}

	pub fn ledger(&self) -> &SharedLedger {
		&self.ledger
	}

	pub async fn evaluate(&self, cfg: &ConfigSpec, msg: &PrivateMessage) -> Verdict {
		let verdict = self.decide(cfg, msg).await;
		match &verdict {
			Verdict::Forward(_) => metrics::counter!("relay_messages_forwarded_total").increment(1),
			Verdict::Suppressed(reason) => {
				metrics::counter!("relay_messages_suppressed_total", "reason" => reason.as_str()).increment(1);
				debug!(channel = %msg.channel, id = %msg.id, reason = reason.as_str(), "message suppressed");
			}
		}
		verdict
	}

	async fn decide(&self, cfg: &ConfigSpec, msg: &PrivateMessage) -> Verdict {
		let author = &msg.author;
		if cfg.filters.is_blacklisted(&author.login) {
			return Verdict::Suppressed(Suppression::Blacklisted);
		}

		if !self.stream_gate_allows(cfg.stream_gate, msg).await {
			return Verdict::Suppressed(Suppression::StreamGate);
		}

		self.ledger.lock().append(&msg.channel, LedgerEntry::from_message(msg));

		let mut should_send = cfg.send_all
			|| cfg.filters.allows_any_badge(&author.badges)
			|| cfg.filters.allows_user(&author.login)
			|| cfg.filters.allows_text(&msg.text);

		let mut text = msg.text.clone();
		let mut display = format::normalize_display(&author.display, &author.login);

		let bits = msg.tags.get_u64(TAG_BITS);
		if bits > 0 && cfg.bits.admits(bits) {
			let prefixes = self.cheermote_prefixes().await;
			text = strip_cheer_tokens(&text, &prefixes);
			display = format!("{display} [bits: {bits}]");
			should_send = true;
		}

		let paid = msg.tags.get_u64(TAG_PAID_AMOUNT);
		if paid > 0 && cfg.hype_chat.admits(paid) {
			display = format!("{display} [HypeChat: {paid}]");
			should_send = true;
		}

		match self
			.throttle
			.observe(&author.id, msg.tags.flag(TAG_FIRST_MSG), cfg.first_message_quota)
		{
			ThrottleDecision::First => {
				text = format!("{FIRST_MESSAGE_PREFIX}{text}");
				should_send = true;
			}
			ThrottleDecision::Allowed => should_send = true,
			ThrottleDecision::NotApplied => {}
		}

		if cfg.prevent_mentions {
			text = format::strip_broad_mentions(&text);
		}

		if !should_send {
			return Verdict::Suppressed(Suppression::Filtered);
		}

		for badge in ANNOTATED_BADGES {
			if author.has_badge(badge) {
				display = format!("{display} [{badge}]");
			}
		}

		let mut embeds = Vec::new();
		if let Some(reply) = &msg.reply {
			text = strip_parent_mention(&text, &reply.parent_display);
			embeds.push(self.thread_embed(cfg, msg));
		}

		let table = self.emotes.snapshot();
		let (content, pending) = substitute_emotes(cfg, &table, msg, &text);
		let follow_up = (cfg.grab_emotes && !pending.is_empty()).then(|| EmoteFollowUp {
			channel_id: msg.channel_id.clone(),
			author_id: author.id.clone(),
			content: content.clone(),
			pending,
		});

		Verdict::Forward(Box::new(Forwarded {
			message: OutboundMessage {
				username: format!("{display} [{} chat]", possessive(msg.channel.as_str())),
				avatar_url: None,
				content,
				embeds,
				allow_mentions: !cfg.prevent_mentions,
			},
			avatar_login: author.login.clone(),
			follow_up,
		}))
	}

	async fn stream_gate_allows(&self, gate: StreamGate, msg: &PrivateMessage) -> bool {
		let want = match gate {
			StreamGate::Any => return true,
			StreamGate::Online => StreamStatus::Live,
			StreamGate::Offline => StreamStatus::Offline,
		};

		match self.channel_status(&msg.channel, msg.channel_id.as_ref()).await {
			Ok(status) => status == want,
			Err(e) => {
				warn!(channel = %msg.channel, error = %e, "stream status lookup failed; suppressing");
				false
			}
		}
	}

	async fn channel_status(&self, channel: &ChannelName, channel_id: Option<&UserId>) -> anyhow::Result<StreamStatus> {
		let id = match channel_id {
			Some(id) => id.as_str().to_string(),
			None => {
				self.profiles
					.get_user(UserQuery::Login(channel.as_str()))
					.await?
					.ok_or_else(|| anyhow::anyhow!("unknown channel {channel}"))?
					.id
			}
		};
		self.profiles.stream_status(&id).await
	}

	async fn cheermote_prefixes(&self) -> HashSet<String> {
		match self.profiles.cheermote_prefixes().await {
			Ok(set) => set.into_iter().map(|p| p.to_ascii_lowercase()).collect(),
			Err(e) => {
				warn!(error = %e, "cheermote lookup failed; cheer tokens kept");
				HashSet::new()
			}
		}
	}

	fn thread_embed(&self, cfg: &ConfigSpec, msg: &PrivateMessage) -> Embed {
		let Some(reply) = &msg.reply else {
			return Embed::default();
		};

		let mut lines: Vec<String> = self
			.ledger
			.lock()
			.thread(&msg.channel, &reply.thread_root_id, &msg.id)
			.into_iter()
			.map(|e| {
				format!(
					"`{}`: {}",
					e.author_display,
					strip_parent_mention(&e.text, &reply.parent_display)
				)
			})
			.collect();

		if lines.is_empty() {
			lines.push(format!("`{}`: {}", reply.parent_display, reply.parent_text));
		}

		let limit = cfg.thread_limit;
		if limit > 0 && lines.len() > limit {
			lines.drain(..lines.len() - limit - 1);
			lines[0] = "...".to_string();
		}

		Embed {
			title: Some(THREAD_TITLE.to_string()),
			description: Some(lines.join("\n")),
			author: None,
		}
	}
}

/// Remove the first `@Parent` mention a reply starts with.
fn strip_parent_mention(text: &str, parent_display: &str) -> String {
	text.replacen(&format!("@{parent_display}"), "", 1).trim().to_string()
}

fn looks_like_emote(token: &str) -> bool {
	token.len() >= 2
		&& token.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
		&& !token.chars().all(|c| c.is_ascii_digit())
}

fn lookup_emote(cfg: &ConfigSpec, table: &EmoteTable, name: &str) -> Option<String> {
	cfg.emote_translator.get(name).or_else(|| table.get(name)).cloned()
}

/// Replace mapped emotes in place and collect the ones without a mapping.
pub fn substitute_emotes(
	cfg: &ConfigSpec,
	table: &EmoteTable,
	msg: &PrivateMessage,
	text: &str,
) -> (String, Vec<PendingEmote>) {
	let native: HashMap<&str, &str> = msg.emotes.iter().map(|e| (e.name.as_str(), e.id.as_str())).collect();
	let mut pending: Vec<PendingEmote> = Vec::new();
	let mut seen: HashSet<&str> = HashSet::new();

	for token in text.split(' ') {
		if lookup_emote(cfg, table, token).is_some() || !seen.insert(token) {
			continue;
		}
		if let Some(id) = native.get(token) {
			pending.push(PendingEmote {
				name: token.to_string(),
				source: EmoteSource::Native(twitch_emote_image(id)),
			});
		} else if looks_like_emote(token) {
			pending.push(PendingEmote {
				name: token.to_string(),
				source: EmoteSource::External,
			});
		}
	}

	let content = format::substitute_tokens(text, |tok| lookup_emote(cfg, table, tok));
	(content, pending)
}
