#![forbid(unsafe_code)]

//! In-memory collaborators for tests and dry runs.

mod lookup;
mod memory;
mod scripted;
mod source;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use relay_domain::UnitId;

pub use lookup::{StaticEmotes, StaticProfiles};
pub use memory::{MemoryTarget, TargetCall};
pub use scripted::{ScriptedChat, ScriptedChatHandle};
pub use source::StaticUnits;

use crate::config::ConfigSpec;
use crate::instance::{Connector, Sessions};

/// Connector that wires every unit to loopback collaborators.
///
/// Each unit gets its own scripted chat handle; the delivery target and
/// lookups are shared.
pub struct LoopbackConnector {
	chats: Mutex<HashMap<UnitId, ScriptedChatHandle>>,
	target: Arc<MemoryTarget>,
	profiles: Arc<StaticProfiles>,
	emotes: Option<Arc<StaticEmotes>>,
	fail: AtomicBool,
}

impl LoopbackConnector {
	pub fn new(target: Arc<MemoryTarget>, profiles: Arc<StaticProfiles>) -> Self {
		Self {
			chats: Mutex::new(HashMap::new()),
			target,
			profiles,
			emotes: None,
			fail: AtomicBool::new(false),
		}
	}

	pub fn with_emotes(mut self, emotes: Arc<StaticEmotes>) -> Self {
		self.emotes = Some(emotes);
		self
	}

	/// Chat handle of a unit, created on first use.
	pub fn chat(&self, unit: &UnitId) -> ScriptedChatHandle {
		self.chats.lock().entry(unit.clone()).or_default().clone()
	}

	pub fn target(&self) -> &Arc<MemoryTarget> {
		&self.target
	}

	/// Make the next session builds fail.
	pub fn set_failing(&self, fail: bool) {
		self.fail.store(fail, Ordering::Relaxed);
	}
}

impl Connector for LoopbackConnector {
	fn build(&self, spec: &ConfigSpec) -> anyhow::Result<Sessions> {
		if self.fail.load(Ordering::Relaxed) {
			anyhow::bail!("loopback connector refused {}", spec.unit);
		}

		Ok(Sessions {
			chat: Box::new(self.chat(&spec.unit).session()),
			target: self.target.clone(),
			profiles: self.profiles.clone(),
			emotes: self.emotes.clone().map(|e| e as Arc<dyn relay_platform::EmoteDirectory>),
		})
	}
}
