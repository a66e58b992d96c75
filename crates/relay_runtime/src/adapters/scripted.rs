#![forbid(unsafe_code)]

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_domain::ChannelName;
use relay_platform::{ChatEvent, ChatEventRx, ChatEventTx, ChatSession, DEFAULT_CHAT_EVENT_CAPACITY, bounded_chat_channel};
use tracing::debug;

#[derive(Debug)]
struct ScriptedState {
	tx: Option<ChatEventTx>,
	backlog: Vec<ChatEvent>,
	joined: Vec<ChannelName>,
	connects: usize,
	disconnects: usize,
	pings: usize,
	fail_connect: bool,
	answer_pings: bool,
}

impl Default for ScriptedState {
	fn default() -> Self {
		Self {
			tx: None,
			backlog: Vec::new(),
			joined: Vec::new(),
			connects: 0,
			disconnects: 0,
			pings: 0,
			fail_connect: false,
			answer_pings: true,
		}
	}
}

/// Test-side handle driving scripted chat sessions.
///
/// Events pushed while no session is connected are delivered on the next
/// connect.
#[derive(Debug, Clone, Default)]
pub struct ScriptedChatHandle {
	state: Arc<Mutex<ScriptedState>>,
}

impl ScriptedChatHandle {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn session(&self) -> ScriptedChat {
		ScriptedChat { handle: self.clone() }
	}

	/// Feed one event to the connected session (or queue it).
	pub fn push(&self, event: ChatEvent) {
		let mut st = self.state.lock();
		match &st.tx {
			Some(tx) => {
				if let Err(e) = tx.try_send(event) {
					debug!(error = %e, "scripted chat event not delivered");
				}
			}
			None => st.backlog.push(event),
		}
	}

	/// End the current event stream as if the connection dropped.
	pub fn drop_connection(&self) {
		self.state.lock().tx = None;
	}

	pub fn set_fail_connect(&self, fail: bool) {
		self.state.lock().fail_connect = fail;
	}

	pub fn set_answer_pings(&self, answer: bool) {
		self.state.lock().answer_pings = answer;
	}

	pub fn is_connected(&self) -> bool {
		self.state.lock().tx.is_some()
	}

	pub fn joined(&self) -> Vec<ChannelName> {
		self.state.lock().joined.clone()
	}

	pub fn connects(&self) -> usize {
		self.state.lock().connects
	}

	pub fn disconnects(&self) -> usize {
		self.state.lock().disconnects
	}

	pub fn pings(&self) -> usize {
		self.state.lock().pings
	}
}

/// [`ChatSession`] fed from a [`ScriptedChatHandle`].
#[derive(Debug)]
pub struct ScriptedChat {
	handle: ScriptedChatHandle,
}

#[async_trait]
impl ChatSession for ScriptedChat {
	async fn connect(&mut self) -> anyhow::Result<ChatEventRx> {
		let mut st = self.handle.state.lock();
		if st.fail_connect {
			anyhow::bail!("scripted connect failure");
		}

		let (tx, rx) = bounded_chat_channel(DEFAULT_CHAT_EVENT_CAPACITY);
		let _ = tx.try_send(ChatEvent::Connected);
		for event in std::mem::take(&mut st.backlog) {
			let _ = tx.try_send(event);
		}
		st.tx = Some(tx);
		st.connects += 1;
		Ok(rx)
	}

	async fn join(&mut self, channels: &[ChannelName]) -> anyhow::Result<()> {
		let mut st = self.handle.state.lock();
		for channel in channels {
			if !st.joined.contains(channel) {
				st.joined.push(channel.clone());
			}
		}
		Ok(())
	}

	async fn ping(&mut self) -> anyhow::Result<()> {
		let mut st = self.handle.state.lock();
		st.pings += 1;
		if st.answer_pings
			&& let Some(tx) = &st.tx
		{
			let _ = tx.try_send(ChatEvent::Pong);
		}
		Ok(())
	}

	async fn disconnect(&mut self) {
		let mut st = self.handle.state.lock();
		if st.tx.take().is_some() {
			st.disconnects += 1;
		}
		st.joined.clear();
	}
}
