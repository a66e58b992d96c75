#![forbid(unsafe_code)]

//! Fixtures shared by unit tests.

use std::collections::BTreeSet;

use relay_domain::{ChannelName, MessageId, UnitId, UserId};
use relay_platform::{Author, EmoteSpan, PrivateMessage, ReplyRef, Tags};

use crate::config::ConfigSpec;

pub(crate) const CHANNEL: &str = "streamer";
pub(crate) const CHANNEL_ID: &str = "1000";

const BASE_UNIT: &str = r#"
webhook_url = "https://discord.com/api/webhooks/1/token"
twitch_client_id = "cid"
twitch_username = "relaybot"
oauth_password = "oauth:pw"
channel = "streamer"
"#;

pub(crate) fn unit_text(extra: &str) -> String {
	format!("{BASE_UNIT}\n{extra}")
}

pub(crate) fn spec(extra: &str) -> ConfigSpec {
	ConfigSpec::from_toml_str(UnitId::new("unit.relay.toml").expect("unit"), &unit_text(extra)).expect("test config")
}

pub(crate) fn channel() -> ChannelName {
	ChannelName::new(CHANNEL).expect("channel")
}

pub(crate) fn mid(id: &str) -> MessageId {
	MessageId::new(id).expect("message id")
}

pub(crate) fn uid(id: &str) -> UserId {
	UserId::new(id).expect("user id")
}

pub(crate) struct Msg(PrivateMessage);

impl Msg {
	pub(crate) fn new(id: &str, login: &str, text: &str) -> Self {
		let mut display = login.to_string();
		if let Some(first) = display.get_mut(..1) {
			first.make_ascii_uppercase();
		}
		Self(PrivateMessage {
			id: mid(id),
			channel: channel(),
			channel_id: Some(uid(CHANNEL_ID)),
			author: Author {
				id: uid(&format!("u-{login}")),
				login: login.to_string(),
				display,
				badges: BTreeSet::new(),
			},
			text: text.to_string(),
			emotes: Vec::new(),
			reply: None,
			tags: Tags::new(),
		})
	}

	pub(crate) fn display(mut self, display: &str) -> Self {
		self.0.author.display = display.to_string();
		self
	}

	pub(crate) fn badge(mut self, badge: &str) -> Self {
		self.0.author.badges.insert(badge.to_string());
		self
	}

	pub(crate) fn tag(mut self, key: &str, value: &str) -> Self {
		self.0.tags.insert(key, value);
		self
	}

	pub(crate) fn emote(mut self, id: &str, name: &str) -> Self {
		self.0.emotes.push(EmoteSpan {
			id: id.to_string(),
			name: name.to_string(),
		});
		self
	}

	pub(crate) fn reply_to(mut self, root: &str, parent_display: &str, parent_text: &str) -> Self {
		self.0.reply = Some(ReplyRef {
			parent_id: mid(root),
			parent_login: parent_display.to_ascii_lowercase(),
			parent_display: parent_display.to_string(),
			parent_text: parent_text.to_string(),
			thread_root_id: mid(root),
		});
		self
	}

	pub(crate) fn build(self) -> PrivateMessage {
		self.0
	}
}
