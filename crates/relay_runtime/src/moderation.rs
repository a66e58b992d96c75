#![forbid(unsafe_code)]

//! Mirrors upstream moderation actions and user notices as notifications.

use std::sync::Arc;
use std::time::Duration;

use relay_domain::ChannelName;
use relay_platform::{
	Author, ClearChat, ClearMessage, Embed, EmbedAuthor, NoticeKind, OutboundMessage, ProfileLookup, TAG_VIEWER_COUNT,
	UserNotice, UserProfile, UserQuery,
};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::ConfigSpec;
use crate::delivery::{DeliveryOutcome, DeliveryPath};
use crate::ledger::{MarkOutcome, ModerationMark, SharedLedger};
use crate::pipeline::format::{MAX_DESCRIPTION_CHARS, chunk_lines, format_duration, possessive};

pub const BANNED_TITLE: &str = "User was banned permanently";
pub const DELETED_TITLE: &str = "Message Deleted";

fn viewer_card(channel: &ChannelName, login: &str) -> String {
	format!("https://www.twitch.tv/popout/{channel}/viewercard/{login}")
}

fn ban_title(duration: Option<Duration>) -> String {
	match duration.map(|d| d.as_secs()).filter(|s| *s > 0) {
		Some(secs) => format!("User was timed out for {}", format_duration(secs)),
		None => BANNED_TITLE.to_string(),
	}
}

fn mod_action_username(channel: &ChannelName) -> String {
	format!("{} chat mod action", possessive(channel.as_str()))
}

/// Ban or timeout notice, split when the collected lines are too long.
pub fn ban_notices(
	channel: &ChannelName,
	login: &str,
	user_id: &str,
	duration: Option<Duration>,
	lines: &[String],
	target_avatar: Option<String>,
	channel_avatar: Option<String>,
) -> Vec<OutboundMessage> {
	let title = ban_title(duration);
	let author = EmbedAuthor {
		name: format!("{login} ({user_id})"),
		icon_url: target_avatar,
		url: Some(viewer_card(channel, login)),
	};

	let mut descriptions: Vec<Option<String>> = chunk_lines(lines, MAX_DESCRIPTION_CHARS).into_iter().map(Some).collect();
	if descriptions.is_empty() {
		descriptions.push(None);
	}

	descriptions
		.into_iter()
		.map(|description| OutboundMessage {
			username: mod_action_username(channel),
			avatar_url: channel_avatar.clone(),
			content: String::new(),
			embeds: vec![Embed {
				title: Some(title.clone()),
				description,
				author: Some(author.clone()),
			}],
			allow_mentions: false,
		})
		.collect()
}

pub fn delete_notice(
	channel: &ChannelName,
	login: &str,
	user_id: &str,
	text: &str,
	author_avatar: Option<String>,
	channel_avatar: Option<String>,
) -> OutboundMessage {
	OutboundMessage {
		username: mod_action_username(channel),
		avatar_url: channel_avatar,
		content: String::new(),
		embeds: vec![Embed {
			title: Some(DELETED_TITLE.to_string()),
			description: Some(format!("- {text}")),
			author: Some(EmbedAuthor {
				name: format!("{login} ({user_id})"),
				icon_url: author_avatar,
				url: Some(viewer_card(channel, login)),
			}),
		}],
		allow_mentions: false,
	}
}

pub fn raid_notice(
	channel: &ChannelName,
	raider: &Author,
	viewers: u64,
	raider_avatar: Option<String>,
	channel_avatar: Option<String>,
) -> OutboundMessage {
	OutboundMessage {
		username: format!("{} raid message", possessive(channel.as_str())),
		avatar_url: channel_avatar,
		content: String::new(),
		embeds: vec![Embed {
			title: Some(format!("`{viewers} raiders just arrived`")),
			description: None,
			author: Some(EmbedAuthor {
				name: raider.display.clone(),
				icon_url: raider_avatar,
				url: Some(format!("https://www.twitch.tv/{}", raider.login)),
			}),
		}],
		allow_mentions: false,
	}
}

pub fn announcement_notice(
	channel: &ChannelName,
	announcer: &Author,
	text: &str,
	announcer_avatar: Option<String>,
	channel_avatar: Option<String>,
) -> OutboundMessage {
	OutboundMessage {
		username: format!("{} announcements", possessive(channel.as_str())),
		avatar_url: channel_avatar,
		content: String::new(),
		embeds: vec![Embed {
			title: None,
			description: Some(text.to_string()),
			author: Some(EmbedAuthor {
				name: announcer.display.clone(),
				icon_url: announcer_avatar,
				url: None,
			}),
		}],
		allow_mentions: false,
	}
}

/// Moderation cascade of one instance session.
///
/// Ledger marks are taken on the intake path, before anything is spawned, so
/// a ban and a delete of the same line can never both report it. Profile
/// lookups and sends run on spawned tasks.
#[derive(Clone)]
pub struct ModerationCascade {
	profiles: Arc<dyn ProfileLookup>,
	delivery: DeliveryPath,
	ledger: SharedLedger,
	ban_cooldown: Duration,
}

impl ModerationCascade {
	pub fn new(
		profiles: Arc<dyn ProfileLookup>,
		delivery: DeliveryPath,
		ledger: SharedLedger,
		ban_cooldown: Duration,
	) -> Self {
		Self {
			profiles,
			delivery,
			ledger,
			ban_cooldown,
		}
	}

	pub fn on_clear_chat(&self, cfg: &ConfigSpec, event: &ClearChat) -> Option<JoinHandle<()>> {
		if !cfg.mirror_moderation {
			return None;
		}
		let Some(target) = event.target.clone() else {
			debug!(channel = %event.channel, "full chat clear ignored");
			return None;
		};

		let lines: Vec<String> = self
			.ledger
			.lock()
			.mark_author(&event.channel, &target.id, ModerationMark::Banned)
			.into_iter()
			.map(|e| format!("- {}", e.text))
			.collect();

		let this = self.clone();
		let channel = event.channel.clone();
		let duration = event.duration;
		Some(tokio::spawn(async move {
			let profile = this.lookup(UserQuery::Id(target.id.as_str())).await;
			let login = profile.as_ref().map(|p| p.login.clone()).unwrap_or_else(|| target.login.clone());
			let notices = ban_notices(
				&channel,
				&login,
				target.id.as_str(),
				duration,
				&lines,
				profile.and_then(|p| p.avatar_url),
				this.channel_avatar(&channel).await,
			);

			for (i, notice) in notices.into_iter().enumerate() {
				this.send(&channel, "ban", notice).await;
				if i == 0 {
					tokio::time::sleep(this.ban_cooldown).await;
				}
			}
		}))
	}

	pub fn on_clear_message(&self, cfg: &ConfigSpec, event: &ClearMessage) -> Option<JoinHandle<()>> {
		if !cfg.mirror_moderation {
			return None;
		}

		let entry = match self
			.ledger
			.lock()
			.mark_message(&event.channel, &event.message_id, ModerationMark::Deleted)
		{
			MarkOutcome::Marked(entry) => entry,
			MarkOutcome::AlreadyMarked => {
				debug!(channel = %event.channel, id = %event.message_id, "deletion already reported");
				return None;
			}
			MarkOutcome::NotFound => {
				debug!(channel = %event.channel, id = %event.message_id, "deleted message not in history");
				return None;
			}
		};

		let this = self.clone();
		let channel = event.channel.clone();
		Some(tokio::spawn(async move {
			let author_avatar = this
				.lookup(UserQuery::Login(&entry.author_login))
				.await
				.and_then(|p| p.avatar_url);
			let notice = delete_notice(
				&channel,
				&entry.author_login,
				entry.author_id.as_str(),
				&entry.text,
				author_avatar,
				this.channel_avatar(&channel).await,
			);
			this.send(&channel, "delete", notice).await;
		}))
	}

	pub fn on_user_notice(&self, cfg: &ConfigSpec, event: &UserNotice) -> Option<JoinHandle<()>> {
		let kind = match &event.kind {
			NoticeKind::Raid => {
				let viewers = event.tags.get_u64(TAG_VIEWER_COUNT);
				if !cfg.raids.admits(viewers) {
					return None;
				}
				NoticeTask::Raid(viewers)
			}
			NoticeKind::Announcement if cfg.announcements => {
				NoticeTask::Announcement(event.text.clone().unwrap_or_default())
			}
			NoticeKind::Announcement | NoticeKind::Other(_) => return None,
		};

		let this = self.clone();
		let channel = event.channel.clone();
		let user = event.user.clone();
		Some(tokio::spawn(async move {
			let avatar = this
				.lookup(UserQuery::Login(&user.login))
				.await
				.and_then(|p| p.avatar_url);
			let channel_avatar = this.channel_avatar(&channel).await;
			let (label, notice) = match kind {
				NoticeTask::Raid(viewers) => ("raid", raid_notice(&channel, &user, viewers, avatar, channel_avatar)),
				NoticeTask::Announcement(text) => (
					"announcement",
					announcement_notice(&channel, &user, &text, avatar, channel_avatar),
				),
			};
			this.send(&channel, label, notice).await;
		}))
	}

	async fn lookup(&self, query: UserQuery<'_>) -> Option<UserProfile> {
		match self.profiles.get_user(query).await {
			Ok(profile) => profile,
			Err(e) => {
				warn!(%query, error = %e, "profile lookup failed; notice sent without it");
				None
			}
		}
	}

	async fn channel_avatar(&self, channel: &ChannelName) -> Option<String> {
		self.lookup(UserQuery::Login(channel.as_str()))
			.await
			.and_then(|p| p.avatar_url)
	}

	async fn send(&self, channel: &ChannelName, kind: &'static str, notice: OutboundMessage) {
		match self.delivery.deliver_notice(notice).await {
			DeliveryOutcome::Sent(_) => {
				metrics::counter!("relay_moderation_notices_total", "kind" => kind).increment(1);
			}
			DeliveryOutcome::Dropped | DeliveryOutcome::Failed(_) => {
				debug!(%channel, kind, "notice not delivered");
			}
		}
	}
}

enum NoticeTask {
	Raid(u64),
	Announcement(String),
}

#[cfg(test)]
mod tests {
	use std::collections::BTreeSet;

	use relay_domain::UserId;
	use relay_platform::{ModerationTarget, Tags};

	use super::*;
	use crate::adapters::{MemoryTarget, StaticProfiles};
	use crate::backpressure::BackpressureGuard;
	use crate::ledger::{HistoryLedger, LedgerEntry};
	use crate::test_support::{Msg, channel, mid, spec, uid};

	struct Rig {
		target: Arc<MemoryTarget>,
		ledger: SharedLedger,
		cascade: ModerationCascade,
	}

	fn rig(profiles: StaticProfiles) -> Rig {
		let target = Arc::new(MemoryTarget::new());
		let profiles: Arc<dyn ProfileLookup> = Arc::new(profiles);
		let (delivery, _) = DeliveryPath::spawn(
			relay_domain::UnitId::new("mod.relay.toml").expect("unit"),
			target.clone(),
			profiles.clone(),
			None,
			BackpressureGuard::new(),
		);
		let ledger = HistoryLedger::shared();
		let cascade = ModerationCascade::new(profiles, delivery, ledger.clone(), Duration::from_secs(1));
		Rig { target, ledger, cascade }
	}

	fn remember(ledger: &SharedLedger, id: &str, login: &str, text: &str) {
		let msg = Msg::new(id, login, text).build();
		ledger.lock().append(&channel(), LedgerEntry::from_message(&msg));
	}

	fn ban(login: &str, secs: Option<u64>) -> ClearChat {
		ClearChat {
			channel: channel(),
			target: Some(ModerationTarget {
				id: uid(&format!("u-{login}")),
				login: login.to_string(),
			}),
			duration: secs.map(Duration::from_secs),
		}
	}

	fn author(login: &str) -> Author {
		Author {
			id: UserId::new(format!("u-{login}")).expect("user"),
			login: login.to_string(),
			display: login.to_uppercase(),
			badges: BTreeSet::new(),
		}
	}

	#[test]
	fn ban_titles_render_duration() {
		assert_eq!(ban_title(None), BANNED_TITLE);
		assert_eq!(ban_title(Some(Duration::from_secs(612))), "User was timed out for 10 minutes and 12 seconds");
		assert_eq!(ban_title(Some(Duration::ZERO)), BANNED_TITLE);
	}

	#[test]
	fn long_ban_notices_are_split() {
		let lines: Vec<String> = (0..100).map(|i| format!("- {i} {}", "x".repeat(80))).collect();
		let notices = ban_notices(&channel(), "troll", "9", None, &lines, None, None);
		assert!(notices.len() > 1);
		for notice in &notices {
			let description = notice.embeds[0].description.as_deref().unwrap_or_default();
			assert!(description.chars().count() <= MAX_DESCRIPTION_CHARS);
			assert_eq!(notice.embeds[0].title.as_deref(), Some(BANNED_TITLE));
		}
	}

	#[tokio::test(start_paused = true)]
	async fn ban_aggregates_unmarked_lines_once() {
		let r = rig(StaticProfiles::new().with_user("u-troll", "troll", "Troll"));
		let cfg = spec("mod_actions = true");
		remember(&r.ledger, "m1", "troll", "spam one");
		remember(&r.ledger, "m2", "alice", "hello");
		remember(&r.ledger, "m3", "troll", "spam two");

		r.cascade.on_clear_chat(&cfg, &ban("troll", Some(600))).expect("spawned").await.expect("task");
		r.cascade.on_clear_chat(&cfg, &ban("troll", None)).expect("spawned").await.expect("task");
		let delete = ClearMessage {
			channel: channel(),
			message_id: mid("m1"),
			login: "troll".to_string(),
		};
		assert!(r.cascade.on_clear_message(&cfg, &delete).is_none());

		let created = r.target.created();
		assert_eq!(created.len(), 2);
		let embed = &created[0].embeds[0];
		assert_eq!(embed.title.as_deref(), Some("User was timed out for 10 minutes"));
		assert_eq!(embed.description.as_deref(), Some("- spam one\n- spam two"));
		let author = embed.author.as_ref().expect("author");
		assert_eq!(author.name, "troll (u-troll)");
		assert_eq!(author.icon_url.as_deref(), Some("https://cdn.example/troll.png"));
		assert_eq!(author.url.as_deref(), Some("https://www.twitch.tv/popout/streamer/viewercard/troll"));
		assert_eq!(created[0].username, "streamer's chat mod action");
		assert_eq!(created[1].embeds[0].description, None, "second ban has nothing left to report");
	}

	#[tokio::test(start_paused = true)]
	async fn ban_degrades_when_profile_lookup_fails() {
		let profiles = StaticProfiles::new();
		profiles.set_fail_users(true);
		let r = rig(profiles);
		remember(&r.ledger, "m1", "troll", "spam");

		r.cascade
			.on_clear_chat(&spec("mod_actions = true"), &ban("troll", None))
			.expect("spawned")
			.await
			.expect("task");

		let created = r.target.created();
		assert_eq!(created.len(), 1);
		let author = created[0].embeds[0].author.as_ref().expect("author");
		assert_eq!(author.name, "troll (u-troll)");
		assert_eq!(author.icon_url, None);
		assert_eq!(created[0].avatar_url, None);
	}

	#[tokio::test]
	async fn replayed_delete_notifies_once() {
		let r = rig(StaticProfiles::new());
		let cfg = spec("mod_actions = true");
		remember(&r.ledger, "m1", "alice", "oops");
		let event = ClearMessage {
			channel: channel(),
			message_id: mid("m1"),
			login: "alice".to_string(),
		};

		r.cascade.on_clear_message(&cfg, &event).expect("first").await.expect("task");
		assert!(r.cascade.on_clear_message(&cfg, &event).is_none());

		let created = r.target.created();
		assert_eq!(created.len(), 1);
		assert_eq!(created[0].embeds[0].title.as_deref(), Some(DELETED_TITLE));
		assert_eq!(created[0].embeds[0].description.as_deref(), Some("- oops"));
	}

	#[tokio::test]
	async fn moderation_is_off_unless_enabled() {
		let r = rig(StaticProfiles::new());
		let cfg = spec("");
		remember(&r.ledger, "m1", "troll", "spam");
		assert!(r.cascade.on_clear_chat(&cfg, &ban("troll", None)).is_none());
		let clear_all = ClearChat {
			channel: channel(),
			target: None,
			duration: None,
		};
		assert!(r.cascade.on_clear_chat(&spec("mod_actions = true"), &clear_all).is_none());
		assert!(!r.ledger.lock().find(&channel(), &mid("m1")).expect("entry").is_marked());
	}

	#[tokio::test]
	async fn raids_respect_viewer_floor() {
		let r = rig(StaticProfiles::new().with_user("u-raider", "raider", "Raider"));
		let notice = |viewers: &str| UserNotice {
			channel: channel(),
			kind: NoticeKind::Raid,
			user: author("raider"),
			text: None,
			tags: Tags::new().with(TAG_VIEWER_COUNT, viewers),
		};

		let cfg = spec("show_raid_messages = 10");
		assert!(r.cascade.on_user_notice(&cfg, &notice("9")).is_none());
		r.cascade.on_user_notice(&cfg, &notice("10")).expect("raid").await.expect("task");
		assert!(r.cascade.on_user_notice(&spec("show_raid_messages = false"), &notice("500")).is_none());

		let created = r.target.created();
		assert_eq!(created.len(), 1);
		assert_eq!(created[0].username, "streamer's raid message");
		let embed = &created[0].embeds[0];
		assert_eq!(embed.title.as_deref(), Some("`10 raiders just arrived`"));
		let author = embed.author.as_ref().expect("author");
		assert_eq!(author.url.as_deref(), Some("https://www.twitch.tv/raider"));
		assert_eq!(author.icon_url.as_deref(), Some("https://cdn.example/raider.png"));
	}

	#[tokio::test]
	async fn announcements_need_their_toggle() {
		let r = rig(StaticProfiles::new());
		let notice = UserNotice {
			channel: channel(),
			kind: NoticeKind::Announcement,
			user: author("mod"),
			text: Some("stream starts at 5".to_string()),
			tags: Tags::new(),
		};

		assert!(r.cascade.on_user_notice(&spec(""), &notice).is_none());
		r.cascade
			.on_user_notice(&spec("show_announcement_messages = true"), &notice)
			.expect("announcement")
			.await
			.expect("task");

		let created = r.target.created();
		assert_eq!(created[0].username, "streamer's announcements");
		assert_eq!(created[0].embeds[0].description.as_deref(), Some("stream starts at 5"));
		assert_eq!(created[0].embeds[0].author.as_ref().map(|a| a.name.as_str()), Some("MOD"));
	}
}
