#![forbid(unsafe_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

/// In-flight count at which the guard starts shedding.
pub const HIGH_WATERMARK: usize = 50;
/// In-flight count at or below which shedding stops.
pub const LOW_WATERMARK: usize = 5;

#[derive(Debug, Default)]
struct GuardState {
	in_flight: usize,
	cooling: bool,
}

/// Sheds new deliveries while too many are outstanding.
///
/// Once `in_flight` reaches the high watermark the guard flips to cooling and
/// rejects every acquisition until the count has drained to the low watermark.
#[derive(Debug, Clone)]
pub struct BackpressureGuard {
	state: Arc<Mutex<GuardState>>,
	high: usize,
	low: usize,
}

impl Default for BackpressureGuard {
	fn default() -> Self {
		Self::new()
	}
}

impl BackpressureGuard {
	pub fn new() -> Self {
		Self::with_watermarks(HIGH_WATERMARK, LOW_WATERMARK)
	}

	pub fn with_watermarks(high: usize, low: usize) -> Self {
		Self {
			state: Arc::new(Mutex::new(GuardState::default())),
			high: high.max(1),
			low: low.min(high.saturating_sub(1)),
		}
	}

	/// Take a slot, or `None` when the delivery must be dropped.
	pub fn try_acquire(&self) -> Option<InFlight> {
		let mut st = self.state.lock();
		if !st.cooling && st.in_flight >= self.high {
			st.cooling = true;
			warn!(in_flight = st.in_flight, "delivery overheating, shedding new messages");
		}
		if st.cooling && st.in_flight <= self.low {
			st.cooling = false;
			info!(in_flight = st.in_flight, "delivery cooled down");
		}
		if st.cooling {
			return None;
		}

		st.in_flight += 1;
		Some(InFlight {
			state: Arc::clone(&self.state),
		})
	}

	pub fn in_flight(&self) -> usize {
		self.state.lock().in_flight
	}

	pub fn is_cooling(&self) -> bool {
		self.state.lock().cooling
	}
}

/// One outstanding delivery; releases its slot on drop.
#[derive(Debug)]
pub struct InFlight {
	state: Arc<Mutex<GuardState>>,
}

impl Drop for InFlight {
	fn drop(&mut self) {
		let mut st = self.state.lock();
		st.in_flight = st.in_flight.saturating_sub(1);
	}
}
