#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use relay_domain::{ChannelName, MessageId, UserId};
use relay_platform::PrivateMessage;

/// Entries kept per channel.
pub const LEDGER_CAPACITY: usize = 800;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModerationMark {
	Deleted,
	Banned,
}

/// One remembered chat line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
	pub message_id: MessageId,
	pub author_id: UserId,
	pub author_login: String,
	pub author_display: String,
	pub text: String,
	/// Thread root when the message is a reply.
	pub thread_root: Option<MessageId>,
	/// Display name of the replied-to author, for mention stripping.
	pub reply_parent_display: Option<String>,
	mark: Option<ModerationMark>,
}

impl LedgerEntry {
	pub fn from_message(msg: &PrivateMessage) -> Self {
		Self {
			message_id: msg.id.clone(),
			author_id: msg.author.id.clone(),
			author_login: msg.author.login.clone(),
			author_display: msg.author.display.clone(),
			text: msg.text.clone(),
			thread_root: msg.reply.as_ref().map(|r| r.thread_root_id.clone()),
			reply_parent_display: msg.reply.as_ref().map(|r| r.parent_display.clone()),
			mark: None,
		}
	}

	pub fn mark(&self) -> Option<ModerationMark> {
		self.mark
	}

	pub fn is_marked(&self) -> bool {
		self.mark.is_some()
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkOutcome {
	/// The entry was unmarked and is now marked.
	Marked(LedgerEntry),
	AlreadyMarked,
	NotFound,
}

/// Bounded per-channel message history.
#[derive(Debug)]
pub struct HistoryLedger {
	capacity: usize,
	channels: HashMap<ChannelName, VecDeque<LedgerEntry>>,
}

impl Default for HistoryLedger {
	fn default() -> Self {
		Self::new()
	}
}

pub type SharedLedger = Arc<Mutex<HistoryLedger>>;

impl HistoryLedger {
	pub fn new() -> Self {
		Self::with_capacity(LEDGER_CAPACITY)
	}

	pub fn with_capacity(capacity: usize) -> Self {
		Self {
			capacity: capacity.max(1),
			channels: HashMap::new(),
		}
	}

	pub fn shared() -> SharedLedger {
		Arc::new(Mutex::new(Self::new()))
	}

	/// Append in arrival order, returning the evicted oldest entry on overflow.
	pub fn append(&mut self, channel: &ChannelName, entry: LedgerEntry) -> Option<LedgerEntry> {
		let buf = self.channels.entry(channel.clone()).or_default();
		buf.push_back(entry);
		if buf.len() > self.capacity {
			buf.pop_front()
		} else {
			None
		}
	}

	pub fn len(&self, channel: &ChannelName) -> usize {
		self.channels.get(channel).map(VecDeque::len).unwrap_or(0)
	}

	pub fn is_empty(&self, channel: &ChannelName) -> bool {
		self.len(channel) == 0
	}

	pub fn entries(&self, channel: &ChannelName) -> impl Iterator<Item = &LedgerEntry> {
		self.channels.get(channel).into_iter().flatten()
	}

	pub fn find(&self, channel: &ChannelName, id: &MessageId) -> Option<&LedgerEntry> {
		self.entries(channel).find(|e| &e.message_id == id)
	}

	/// Mark one message; a second mark of the same message is a no-op.
	pub fn mark_message(&mut self, channel: &ChannelName, id: &MessageId, mark: ModerationMark) -> MarkOutcome {
		let Some(entry) = self
			.channels
			.get_mut(channel)
			.and_then(|buf| buf.iter_mut().find(|e| &e.message_id == id))
		else {
			return MarkOutcome::NotFound;
		};

		if entry.is_marked() {
			return MarkOutcome::AlreadyMarked;
		}
		entry.mark = Some(mark);
		MarkOutcome::Marked(entry.clone())
	}

	/// Mark every unmarked message of an author, returning them oldest first.
	pub fn mark_author(&mut self, channel: &ChannelName, author: &UserId, mark: ModerationMark) -> Vec<LedgerEntry> {
		let Some(buf) = self.channels.get_mut(channel) else {
			return Vec::new();
		};

		buf.iter_mut()
			.filter(|e| &e.author_id == author && !e.is_marked())
			.map(|e| {
				e.mark = Some(mark);
				e.clone()
			})
			.collect()
	}

	/// Other replies in the same thread, oldest first.
	pub fn thread(&self, channel: &ChannelName, root: &MessageId, exclude: &MessageId) -> Vec<&LedgerEntry> {
		self.entries(channel)
			.filter(|e| e.thread_root.as_ref() == Some(root) && &e.message_id != exclude)
			.collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn channel(name: &str) -> ChannelName {
		ChannelName::new(name).expect("valid channel")
	}

	fn entry(id: usize, author: &str) -> LedgerEntry {
		LedgerEntry {
			message_id: MessageId::new(format!("m{id}")).expect("message id"),
			author_id: UserId::new(author).expect("user id"),
			author_login: author.to_string(),
			author_display: author.to_string(),
			text: format!("line {id}"),
			thread_root: None,
			reply_parent_display: None,
			mark: None,
		}
	}

	fn mid(id: usize) -> MessageId {
		MessageId::new(format!("m{id}")).expect("message id")
	}

	#[test]
	fn overflow_evicts_exactly_the_oldest() {
		let ch = channel("chan");
		let mut ledger = HistoryLedger::new();
		for i in 0..LEDGER_CAPACITY {
			assert_eq!(ledger.append(&ch, entry(i, "a")), None);
		}
		assert_eq!(ledger.len(&ch), LEDGER_CAPACITY);

		let evicted = ledger.append(&ch, entry(LEDGER_CAPACITY, "a")).expect("801st evicts");
		assert_eq!(evicted.message_id, mid(0));
		assert_eq!(ledger.len(&ch), LEDGER_CAPACITY);
		assert!(ledger.find(&ch, &mid(0)).is_none());
		assert!(ledger.find(&ch, &mid(1)).is_some());
		assert_eq!(ledger.entries(&ch).last().map(|e| e.message_id.clone()), Some(mid(LEDGER_CAPACITY)));
	}

	#[test]
	fn channels_are_independent() {
		let (a, b) = (channel("a"), channel("b"));
		let mut ledger = HistoryLedger::with_capacity(2);
		ledger.append(&a, entry(1, "x"));
		ledger.append(&a, entry(2, "x"));
		ledger.append(&a, entry(3, "x"));
		ledger.append(&b, entry(4, "x"));
		assert_eq!(ledger.len(&a), 2);
		assert_eq!(ledger.len(&b), 1);
		assert!(ledger.is_empty(&channel("c")));
	}

	#[test]
	fn message_marks_are_set_once() {
		let ch = channel("chan");
		let mut ledger = HistoryLedger::new();
		ledger.append(&ch, entry(1, "a"));

		assert!(matches!(
			ledger.mark_message(&ch, &mid(1), ModerationMark::Deleted),
			MarkOutcome::Marked(_)
		));
		assert_eq!(
			ledger.mark_message(&ch, &mid(1), ModerationMark::Deleted),
			MarkOutcome::AlreadyMarked
		);
		assert_eq!(ledger.mark_message(&ch, &mid(9), ModerationMark::Deleted), MarkOutcome::NotFound);
		assert_eq!(ledger.find(&ch, &mid(1)).and_then(LedgerEntry::mark), Some(ModerationMark::Deleted));
	}

	#[test]
	fn author_marks_skip_already_marked_lines() {
		let ch = channel("chan");
		let mut ledger = HistoryLedger::new();
		ledger.append(&ch, entry(1, "a"));
		ledger.append(&ch, entry(2, "b"));
		ledger.append(&ch, entry(3, "a"));
		ledger.append(&ch, entry(4, "a"));
		ledger.mark_message(&ch, &mid(3), ModerationMark::Deleted);

		let banned: Vec<_> = ledger
			.mark_author(&ch, &UserId::new("a").expect("user"), ModerationMark::Banned)
			.into_iter()
			.map(|e| e.message_id)
			.collect();
		assert_eq!(banned, vec![mid(1), mid(4)]);

		let again = ledger.mark_author(&ch, &UserId::new("a").expect("user"), ModerationMark::Banned);
		assert!(again.is_empty());
		assert_eq!(
			ledger.mark_message(&ch, &mid(4), ModerationMark::Deleted),
			MarkOutcome::AlreadyMarked
		);
	}

	#[test]
	fn thread_collects_sibling_replies() {
		let ch = channel("chan");
		let root = mid(100);
		let mut ledger = HistoryLedger::new();
		ledger.append(&ch, entry(1, "a"));
		for i in 2..5 {
			let mut e = entry(i, "b");
			e.thread_root = Some(root.clone());
			ledger.append(&ch, e);
		}
		let mut other = entry(5, "c");
		other.thread_root = Some(mid(200));
		ledger.append(&ch, other);

		let ids: Vec<_> = ledger
			.thread(&ch, &root, &mid(4))
			.into_iter()
			.map(|e| e.message_id.clone())
			.collect();
		assert_eq!(ids, vec![mid(2), mid(3)]);
	}

	proptest::proptest! {
		#[test]
		fn ledger_never_exceeds_capacity(cap in 1usize..64, inserts in 0usize..300) {
			let ch = channel("prop");
			let mut ledger = HistoryLedger::with_capacity(cap);
			for i in 0..inserts {
				ledger.append(&ch, entry(i, "a"));
				proptest::prop_assert!(ledger.len(&ch) <= cap);
			}
			proptest::prop_assert_eq!(ledger.len(&ch), inserts.min(cap));
			if inserts > cap {
				let first = ledger.entries(&ch).next().map(|e| e.message_id.clone());
				proptest::prop_assert_eq!(first, Some(mid(inserts - cap)));
			}
		}
	}
}
