#![forbid(unsafe_code)]

//! Lifecycle of one relay instance: connect, join, relay, reload, stop.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::stream::FuturesUnordered;
use futures::{FutureExt as _, StreamExt as _};
use relay_domain::UnitId;
use relay_platform::{ChatEvent, ChatSession, DeliveryTarget, EmoteDirectory, ProfileLookup};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep, sleep_until};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backpressure::BackpressureGuard;
use crate::config::{ConfigError, ConfigSnapshot, ConfigSpec};
use crate::delivery::{DeliveryPath, EmoteLeases};
use crate::moderation::ModerationCascade;
use crate::pipeline::{Pipeline, RelayState, Verdict};
use crate::supervisor::RelayContext;

/// Control channel depth; only reloads travel over it.
pub const CONTROL_CHANNEL_CAPACITY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
	Starting,
	Connected,
	Running,
	Reloading,
	Stopping,
	Stopped,
	Crashed,
}

impl InstanceState {
	/// States the health sweep leaves alone.
	pub fn is_healthy(self) -> bool {
		!matches!(self, Self::Stopped | Self::Crashed)
	}

	pub fn as_str(self) -> &'static str {
		match self {
			Self::Starting => "starting",
			Self::Connected => "connected",
			Self::Running => "running",
			Self::Reloading => "reloading",
			Self::Stopping => "stopping",
			Self::Stopped => "stopped",
			Self::Crashed => "crashed",
		}
	}
}

impl std::fmt::Display for InstanceState {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceControl {
	/// Re-read the unit and restart the session with the new snapshot.
	Reload,
}

#[derive(Debug, Error)]
pub enum InstanceError {
	#[error(transparent)]
	Config(#[from] ConfigError),

	#[error("connection error: {0}")]
	Connection(String),

	#[error("panicked: {0}")]
	Panicked(String),

	#[error("session task failed: {0}")]
	Task(String),
}

/// Collaborators of one instance session.
pub struct Sessions {
	pub chat: Box<dyn ChatSession>,
	pub target: Arc<dyn DeliveryTarget>,
	pub profiles: Arc<dyn ProfileLookup>,
	/// Absent when emote grabbing has no external directory.
	pub emotes: Option<Arc<dyn EmoteDirectory>>,
}

/// Builds session collaborators from a unit's configuration.
pub trait Connector: Send + Sync + 'static {
	fn build(&self, spec: &ConfigSpec) -> anyhow::Result<Sessions>;
}

/// Supervisor-side handle of a spawned instance.
#[derive(Debug)]
pub struct InstanceHandle {
	pub unit: UnitId,
	pub control: mpsc::Sender<InstanceControl>,
	pub state: watch::Receiver<InstanceState>,
	pub task: JoinHandle<InstanceState>,
}

impl InstanceHandle {
	pub fn current(&self) -> InstanceState {
		*self.state.borrow()
	}

	/// Healthy while the task is alive and not in a terminal state.
	pub fn is_healthy(&self) -> bool {
		!self.task.is_finished() && self.current().is_healthy()
	}

	/// Ask for a reload; `false` when the instance no longer listens.
	pub fn request_reload(&self) -> bool {
		match self.control.try_send(InstanceControl::Reload) {
			Ok(()) => true,
			Err(mpsc::error::TrySendError::Full(_)) => {
				debug!(unit = %self.unit, "reload already pending");
				true
			}
			Err(mpsc::error::TrySendError::Closed(_)) => false,
		}
	}
}

/// Spawn an instance for `unit`. It loads its own configuration.
pub fn spawn(unit: UnitId, ctx: Arc<RelayContext>) -> InstanceHandle {
	let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
	let (state_tx, state_rx) = watch::channel(InstanceState::Starting);

	let instance = Instance {
		unit: unit.clone(),
		ctx,
		control: control_rx,
		state: state_tx,
		relay: RelayState::default(),
		guard: BackpressureGuard::new(),
	};
	let task = tokio::spawn(instance.run());

	InstanceHandle {
		unit,
		control: control_tx,
		state: state_rx,
		task,
	}
}

struct Instance {
	unit: UnitId,
	ctx: Arc<RelayContext>,
	control: mpsc::Receiver<InstanceControl>,
	state: watch::Sender<InstanceState>,
	// Survive reloads.
	relay: RelayState,
	guard: BackpressureGuard,
}

enum SessionEnd {
	Reload(ConfigSnapshot),
	Stopped,
	Failed(InstanceError),
}

/// Per-session wiring, rebuilt on every reload.
struct Session {
	id: String,
	spec: ConfigSnapshot,
	pipeline: Pipeline,
	delivery: DeliveryPath,
	moderation: ModerationCascade,
}

impl Instance {
	async fn run(mut self) -> InstanceState {
		let mut spec = match self.ctx.source.load(&self.unit) {
			Ok(spec) => Arc::new(spec),
			Err(e) => return self.crash(e.into()),
		};

		loop {
			match self.run_session(spec).await {
				SessionEnd::Reload(next) => {
					info!(unit = %self.unit, "restarting with reloaded configuration");
					spec = next;
				}
				SessionEnd::Stopped => {
					self.set(InstanceState::Stopped);
					return InstanceState::Stopped;
				}
				SessionEnd::Failed(e) => return self.crash(e),
			}
		}
	}

	async fn run_session(&mut self, spec: ConfigSnapshot) -> SessionEnd {
		self.set(InstanceState::Starting);
		let session_id = Uuid::new_v4().to_string();

		let Sessions {
			mut chat,
			target,
			profiles,
			emotes,
		} = match self.ctx.connector.build(&spec) {
			Ok(sessions) => sessions,
			Err(e) => return SessionEnd::Failed(InstanceError::Connection(format!("{e:#}"))),
		};

		let mut events = match chat.connect().await {
			Ok(rx) => rx,
			Err(e) => return SessionEnd::Failed(InstanceError::Connection(format!("connect failed: {e:#}"))),
		};
		self.set(InstanceState::Connected);
		info!(unit = %self.unit, session_id = %session_id, "chat connected");

		let timings = self.ctx.timings;
		tokio::select! {
			_ = sleep(timings.settle) => {}
			ctl = self.control.recv() => return self.on_control(ctl, chat.as_mut()).await,
		}

		if let Err(e) = chat.join(&spec.channels).await {
			chat.disconnect().await;
			return SessionEnd::Failed(InstanceError::Connection(format!("join failed: {e:#}")));
		}

		let leases = emotes.map(|directory| EmoteLeases::new(directory, self.ctx.lease_gate.clone(), timings.lease_hold));
		let (delivery, mut worker) = DeliveryPath::spawn(
			self.unit.clone(),
			target,
			profiles.clone(),
			leases,
			self.guard.clone(),
		);
		let session = Session {
			id: session_id,
			pipeline: Pipeline::new(profiles.clone(), self.ctx.emotes.clone(), self.relay.clone()),
			moderation: ModerationCascade::new(profiles, delivery.clone(), self.relay.ledger.clone(), timings.ban_cooldown),
			delivery,
			spec,
		};

		self.set(InstanceState::Running);
		let channels: Vec<&str> = session.spec.channels.iter().map(|c| c.as_str()).collect();
		info!(unit = %self.unit, session_id = %session.id, ?channels, "instance running");

		let mut ping = interval_at(Instant::now() + timings.ping_interval, timings.ping_interval);
		ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
		let mut pong_deadline: Option<Instant> = None;
		// Detached on session end, like the worker.
		let mut moderation_tasks: FuturesUnordered<JoinHandle<()>> = FuturesUnordered::new();

		loop {
			tokio::select! {
				ctl = self.control.recv() => return self.on_control(ctl, chat.as_mut()).await,

				ev = events.recv() => {
					let Some(ev) = ev else {
						warn!(unit = %self.unit, session_id = %session.id, "chat event stream ended");
						chat.disconnect().await;
						return SessionEnd::Failed(InstanceError::Connection("chat event stream ended".to_string()));
					};

					if matches!(ev, ChatEvent::Pong) {
						pong_deadline = None;
					}

					let handled = AssertUnwindSafe(self.handle_event(&session, ev)).catch_unwind().await;
					match handled {
						Ok(Some(task)) => moderation_tasks.push(task),
						Ok(None) => {}
						Err(payload) => {
							let reason = panic_message(payload.as_ref());
							error!(unit = %self.unit, session_id = %session.id, panic = %reason, "event handler panicked");
							chat.disconnect().await;
							return SessionEnd::Failed(InstanceError::Panicked(reason));
						}
					}
				}

				Some(joined) = moderation_tasks.next(), if !moderation_tasks.is_empty() => {
					if let Err(e) = joined {
						let failure = task_failure(e);
						error!(unit = %self.unit, session_id = %session.id, error = %failure, "moderation task failed");
						chat.disconnect().await;
						return SessionEnd::Failed(failure);
					}
				}

				joined = &mut worker => {
					let failure = match joined {
						Ok(()) => InstanceError::Task("delivery worker exited".to_string()),
						Err(e) => task_failure(e),
					};
					error!(unit = %self.unit, session_id = %session.id, error = %failure, "delivery worker stopped");
					chat.disconnect().await;
					return SessionEnd::Failed(failure);
				}

				_ = ping.tick() => {
					if let Err(e) = chat.ping().await {
						chat.disconnect().await;
						return SessionEnd::Failed(InstanceError::Connection(format!("ping failed: {e:#}")));
					}
					if pong_deadline.is_none() {
						pong_deadline = Some(Instant::now() + timings.pong_grace);
					}
				}

				_ = wait_deadline(pong_deadline) => {
					warn!(unit = %self.unit, session_id = %session.id, grace = ?timings.pong_grace, "no pong from chat");
					chat.disconnect().await;
					return SessionEnd::Failed(InstanceError::Connection("ping not answered".to_string()));
				}
			}
		}
	}

	/// Returns the moderation task the event started, if any.
	async fn handle_event(&self, session: &Session, ev: ChatEvent) -> Option<JoinHandle<()>> {
		let spec = &session.spec;
		if spec.output_log {
			info!(unit = %self.unit, session_id = %session.id, event = ?ev, "chat event");
		}

		match ev {
			ChatEvent::Message(msg) => {
				if let Verdict::Forward(forwarded) = session.pipeline.evaluate(spec, &msg).await
					&& !session.delivery.submit(*forwarded)
				{
					debug!(unit = %self.unit, message = %msg.id, "delivery shed");
				}
				None
			}
			ChatEvent::ClearChat(event) => session.moderation.on_clear_chat(spec, &event),
			ChatEvent::ClearMessage(event) => session.moderation.on_clear_message(spec, &event),
			ChatEvent::UserNotice(event) => session.moderation.on_user_notice(spec, &event),
			ChatEvent::Connected | ChatEvent::Ping | ChatEvent::Pong => {
				debug!(unit = %self.unit, kind = ev.kind(), "session event");
				None
			}
		}
	}

	async fn on_control(&mut self, ctl: Option<InstanceControl>, chat: &mut dyn ChatSession) -> SessionEnd {
		match ctl {
			Some(InstanceControl::Reload) => {
				self.set(InstanceState::Reloading);
				match self.ctx.source.load(&self.unit) {
					Ok(next) => {
						chat.disconnect().await;
						SessionEnd::Reload(Arc::new(next))
					}
					Err(e) => {
						warn!(unit = %self.unit, error = %e, "reload failed; stopping instance");
						self.set(InstanceState::Stopping);
						chat.disconnect().await;
						SessionEnd::Stopped
					}
				}
			}
			None => {
				self.set(InstanceState::Stopping);
				chat.disconnect().await;
				SessionEnd::Stopped
			}
		}
	}

	fn set(&self, next: InstanceState) {
		let prev = self.state.send_replace(next);
		if prev == next {
			return;
		}

		if next == InstanceState::Running {
			metrics::gauge!("relay_instances_running").increment(1.0);
		} else if prev == InstanceState::Running {
			metrics::gauge!("relay_instances_running").decrement(1.0);
		}
		debug!(unit = %self.unit, from = %prev, to = %next, "instance state");
	}

	fn crash(&self, e: InstanceError) -> InstanceState {
		error!(unit = %self.unit, error = %e, "instance crashed");
		self.set(InstanceState::Crashed);
		InstanceState::Crashed
	}
}

async fn wait_deadline(deadline: Option<Instant>) {
	match deadline {
		Some(at) => sleep_until(at).await,
		None => std::future::pending().await,
	}
}

fn task_failure(e: JoinError) -> InstanceError {
	if e.is_panic() {
		InstanceError::Panicked(panic_message(e.into_panic().as_ref()))
	} else {
		InstanceError::Task(e.to_string())
	}
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
	if let Some(s) = payload.downcast_ref::<&str>() {
		(*s).to_string()
	} else if let Some(s) = payload.downcast_ref::<String>() {
		s.clone()
	} else {
		"non-string panic payload".to_string()
	}
}
