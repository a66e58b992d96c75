#![forbid(unsafe_code)]

//! Keeps exactly one instance running per configuration unit.

pub mod watcher;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use relay_domain::UnitId;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};

use crate::config::{ConfigSource, Timings};
use crate::delivery::LeaseGate;
use crate::emotes::EmoteCache;
use crate::health::HealthState;
use crate::instance::{self, Connector, InstanceHandle, InstanceState};

pub use watcher::{DEFAULT_WATCH_CAPACITY, WatchEvent, WatchGuard, spawn_watcher};

/// How long shutdown waits for each instance to wind down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Process-wide collaborators handed to every instance.
pub struct RelayContext {
	pub source: Arc<dyn ConfigSource>,
	pub connector: Arc<dyn Connector>,
	pub emotes: Arc<EmoteCache>,
	pub lease_gate: LeaseGate,
	pub timings: Timings,
}

impl RelayContext {
	pub fn new(
		source: Arc<dyn ConfigSource>,
		connector: Arc<dyn Connector>,
		emotes: Arc<EmoteCache>,
		timings: Timings,
	) -> Self {
		Self {
			source,
			connector,
			emotes,
			lease_gate: LeaseGate::new(),
			timings,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitChange {
	Created(UnitId),
	Modified(UnitId),
	Removed(UnitId),
}

impl UnitChange {
	pub fn unit(&self) -> &UnitId {
		match self {
			Self::Created(unit) | Self::Modified(unit) | Self::Removed(unit) => unit,
		}
	}
}

struct UnitEntry {
	handle: InstanceHandle,
	last_change: Instant,
}

pub struct Supervisor {
	ctx: Arc<RelayContext>,
	units: HashMap<UnitId, UnitEntry>,
	health: HealthState,
}

impl Supervisor {
	pub fn new(ctx: RelayContext) -> Self {
		Self {
			ctx: Arc::new(ctx),
			units: HashMap::new(),
			health: HealthState::new(),
		}
	}

	/// Health view shared with the health server.
	pub fn health(&self) -> HealthState {
		self.health.clone()
	}

	pub fn len(&self) -> usize {
		self.units.len()
	}

	pub fn is_empty(&self) -> bool {
		self.units.is_empty()
	}

	pub fn state(&self, unit: &UnitId) -> Option<InstanceState> {
		self.units.get(unit).map(|entry| entry.handle.current())
	}

	pub fn states(&self) -> Vec<(UnitId, InstanceState)> {
		let mut states: Vec<_> = self
			.units
			.iter()
			.map(|(unit, entry)| (unit.clone(), entry.handle.current()))
			.collect();
		states.sort_by(|a, b| a.0.cmp(&b.0));
		states
	}

	/// Launch an instance for every unit the source knows about.
	pub fn discover(&mut self) -> anyhow::Result<usize> {
		let units = self.ctx.source.list_units()?;
		let mut launched = 0;
		for unit in units {
			if !self.units.contains_key(&unit) {
				self.launch(unit);
				launched += 1;
			}
		}
		info!(launched, total = self.units.len(), "configuration units discovered");
		Ok(launched)
	}

	pub fn handle(&mut self, change: UnitChange) {
		match change {
			UnitChange::Created(unit) | UnitChange::Modified(unit) => self.on_changed(unit),
			UnitChange::Removed(unit) => self.on_removed(&unit),
		}
	}

	fn on_changed(&mut self, unit: UnitId) {
		let debounce = self.ctx.timings.debounce;
		let Some(entry) = self.units.get_mut(&unit) else {
			self.launch(unit);
			return;
		};

		if !entry.handle.is_healthy() {
			info!(unit = %unit, state = %entry.handle.current(), "unit changed while down; relaunching");
			self.relaunch(unit);
			return;
		}

		let now = Instant::now();
		if now.duration_since(entry.last_change) < debounce {
			debug!(unit = %unit, "change ignored; within debounce window");
			return;
		}

		entry.last_change = now;
		if entry.handle.request_reload() {
			info!(unit = %unit, "reload requested");
		} else {
			self.relaunch(unit);
		}
	}

	fn on_removed(&mut self, unit: &UnitId) {
		// Dropping the handle closes the control channel; the instance stops.
		if self.units.remove(unit).is_some() {
			self.health.forget(unit);
			info!(unit = %unit, "unit removed; instance stopping");
		} else {
			debug!(unit = %unit, "removal of unknown unit ignored");
		}
	}

	/// Relaunch every instance that is down.
	pub fn sweep(&mut self) -> usize {
		let down: Vec<UnitId> = self
			.units
			.iter()
			.filter(|(_, entry)| !entry.handle.is_healthy())
			.map(|(unit, _)| unit.clone())
			.collect();

		for unit in &down {
			warn!(unit = %unit, "health sweep found instance down; relaunching");
			self.relaunch(unit.clone());
		}
		down.len()
	}

	pub fn handle_emotes_changed(&self) {
		if let Err(e) = self.ctx.emotes.refresh() {
			warn!(error = %e, "emote cache refresh failed; keeping previous table");
		}
	}

	fn launch(&mut self, unit: UnitId) {
		let handle = instance::spawn(unit.clone(), self.ctx.clone());
		self.health.track(unit.clone(), handle.state.clone());
		info!(unit = %unit, "instance launched");
		self.units.insert(
			unit,
			UnitEntry {
				handle,
				last_change: Instant::now(),
			},
		);
	}

	fn relaunch(&mut self, unit: UnitId) {
		// The old control channel is discarded with its entry.
		if let Some(old) = self.units.remove(&unit) {
			old.handle.task.abort();
		}
		metrics::counter!("relay_instance_restarts_total").increment(1);
		self.launch(unit);
	}

	/// Discover units, then apply watcher events and run the health sweep
	/// until the event channel closes.
	pub async fn run(mut self, mut events: mpsc::Receiver<WatchEvent>) -> anyhow::Result<()> {
		self.discover()?;
		self.health.mark_ready();

		let period = self.ctx.timings.health_sweep;
		let mut sweep = interval_at(Instant::now() + period, period);
		sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

		loop {
			tokio::select! {
				ev = events.recv() => {
					let Some(ev) = ev else {
						info!("watch channel closed; supervisor shutting down");
						break;
					};
					match ev {
						WatchEvent::Unit(change) => self.handle(change),
						WatchEvent::EmotesChanged => self.handle_emotes_changed(),
					}
				}
				_ = sweep.tick() => {
					let relaunched = self.sweep();
					if relaunched > 0 {
						info!(relaunched, "health sweep finished");
					}
				}
			}
		}

		self.shutdown().await;
		Ok(())
	}

	/// Stop every instance and wait for them to exit.
	pub async fn shutdown(&mut self) {
		let entries: Vec<(UnitId, UnitEntry)> = self.units.drain().collect();
		for (unit, entry) in entries {
			self.health.forget(&unit);
			let InstanceHandle { control, task, .. } = entry.handle;
			drop(control);
			match tokio::time::timeout(SHUTDOWN_GRACE, task).await {
				Ok(Ok(state)) => debug!(unit = %unit, state = %state, "instance exited"),
				Ok(Err(e)) => warn!(unit = %unit, error = %e, "instance task failed"),
				Err(_) => warn!(unit = %unit, "instance did not stop in time"),
			}
		}
	}
}
