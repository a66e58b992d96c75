#![forbid(unsafe_code)]

//! Serialized delivery of relayed messages and notices.

mod leases;

use std::sync::Arc;

use relay_domain::UnitId;
use relay_platform::{DeliveredId, DeliveryTarget, OutboundMessage, ProfileLookup, UserQuery};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, warn};

use crate::backpressure::{BackpressureGuard, InFlight};
use crate::pipeline::{EmoteFollowUp, Forwarded};

pub use leases::{EmoteLeases, LeaseGate, LeaseReport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
	Sent(DeliveredId),
	/// Shed by the backpressure guard.
	Dropped,
	/// The target rejected the send; it is not retried.
	Failed(String),
}

struct DeliveryRequest {
	message: OutboundMessage,
	avatar_login: Option<String>,
	follow_up: Option<EmoteFollowUp>,
	// Held until the send finishes.
	permit: Option<InFlight>,
	respond: Option<oneshot::Sender<DeliveryOutcome>>,
}

/// Handle to the single delivery worker of an instance session.
///
/// Requests are sent one at a time in submission order. Relayed messages go
/// through the backpressure guard; moderation notices bypass it but share
/// the same queue.
#[derive(Clone)]
pub struct DeliveryPath {
	tx: mpsc::UnboundedSender<DeliveryRequest>,
	guard: BackpressureGuard,
}

struct Worker {
	unit: UnitId,
	target: Arc<dyn DeliveryTarget>,
	profiles: Arc<dyn ProfileLookup>,
	leases: Option<EmoteLeases>,
}

impl DeliveryPath {
	/// Start the worker. It exits once every handle has been dropped and the
	/// queue is drained.
	pub fn spawn(
		unit: UnitId,
		target: Arc<dyn DeliveryTarget>,
		profiles: Arc<dyn ProfileLookup>,
		leases: Option<EmoteLeases>,
		guard: BackpressureGuard,
	) -> (Self, JoinHandle<()>) {
		let (tx, rx) = mpsc::unbounded_channel();
		let worker = Worker {
			unit,
			target,
			profiles,
			leases,
		};
		let handle = tokio::spawn(worker.run(rx));
		(Self { tx, guard }, handle)
	}

	pub fn guard(&self) -> &BackpressureGuard {
		&self.guard
	}

	fn enqueue(&self, request: DeliveryRequest) -> bool {
		self.tx.send(request).is_ok()
	}

	/// Queue a relayed message; `false` when it was shed.
	pub fn submit(&self, forwarded: Forwarded) -> bool {
		let Some(permit) = self.guard.try_acquire() else {
			metrics::counter!("relay_deliveries_dropped_total").increment(1);
			return false;
		};

		self.enqueue(DeliveryRequest {
			message: forwarded.message,
			avatar_login: Some(forwarded.avatar_login),
			follow_up: forwarded.follow_up,
			permit: Some(permit),
			respond: None,
		})
	}

	/// Queue a relayed message and wait for the send.
	pub async fn deliver(&self, forwarded: Forwarded) -> DeliveryOutcome {
		let Some(permit) = self.guard.try_acquire() else {
			metrics::counter!("relay_deliveries_dropped_total").increment(1);
			return DeliveryOutcome::Dropped;
		};

		let (respond, rx) = oneshot::channel();
		let queued = self.enqueue(DeliveryRequest {
			message: forwarded.message,
			avatar_login: Some(forwarded.avatar_login),
			follow_up: forwarded.follow_up,
			permit: Some(permit),
			respond: Some(respond),
		});
		if !queued {
			return DeliveryOutcome::Failed("delivery worker stopped".to_string());
		}
		rx.await
			.unwrap_or_else(|_| DeliveryOutcome::Failed("delivery worker dropped the request".to_string()))
	}

	/// Queue a notice; notices are never shed.
	pub async fn deliver_notice(&self, message: OutboundMessage) -> DeliveryOutcome {
		let (respond, rx) = oneshot::channel();
		let queued = self.enqueue(DeliveryRequest {
			message,
			avatar_login: None,
			follow_up: None,
			permit: None,
			respond: Some(respond),
		});
		if !queued {
			return DeliveryOutcome::Failed("delivery worker stopped".to_string());
		}
		rx.await
			.unwrap_or_else(|_| DeliveryOutcome::Failed("delivery worker dropped the request".to_string()))
	}
}

impl Worker {
	/// Drain the queue. A panicking lease cycle takes the worker down with it.
	async fn run(self, mut rx: mpsc::UnboundedReceiver<DeliveryRequest>) {
		let worker = Arc::new(self);
		let mut cycles = JoinSet::new();
		loop {
			tokio::select! {
				request = rx.recv() => {
					let Some(request) = request else { break };
					worker.deliver_one(request, &mut cycles).await;
				}
				Some(joined) = cycles.join_next(), if !cycles.is_empty() => reap(joined),
			}
		}

		while let Some(joined) = cycles.join_next().await {
			reap(joined);
		}
		debug!(unit = %worker.unit, "delivery worker exiting");
	}

	async fn deliver_one(self: &Arc<Self>, request: DeliveryRequest, cycles: &mut JoinSet<()>) {
		let DeliveryRequest {
			mut message,
			avatar_login,
			follow_up,
			permit,
			respond,
		} = request;

		if message.avatar_url.is_none()
			&& let Some(login) = &avatar_login
		{
			message.avatar_url = self.avatar(login).await;
		}

		let outcome = match self.target.create_message(&message).await {
			Ok(id) => {
				debug!(unit = %self.unit, message = %id, "delivered");
				if let (Some(follow), Some(_)) = (follow_up, &self.leases) {
					self.spawn_lease_cycle(cycles, id.clone(), follow);
				}
				DeliveryOutcome::Sent(id)
			}
			Err(e) => {
				metrics::counter!("relay_delivery_failures_total").increment(1);
				warn!(unit = %self.unit, error = %e, "delivery failed; not retrying");
				DeliveryOutcome::Failed(e.to_string())
			}
		};

		drop(permit);
		if let Some(respond) = respond {
			let _ = respond.send(outcome);
		}
	}

	async fn avatar(&self, login: &str) -> Option<String> {
		match self.profiles.get_user(UserQuery::Login(login)).await {
			Ok(profile) => profile.and_then(|p| p.avatar_url),
			Err(e) => {
				warn!(unit = %self.unit, login, error = %e, "avatar lookup failed; sending without avatar");
				None
			}
		}
	}

	fn spawn_lease_cycle(self: &Arc<Self>, cycles: &mut JoinSet<()>, id: DeliveredId, follow: EmoteFollowUp) {
		let worker = Arc::clone(self);
		cycles.spawn(async move {
			if let Some(leases) = &worker.leases {
				leases.run(worker.target.as_ref(), &id, &follow).await;
			}
		});
	}
}

fn reap(joined: Result<(), JoinError>) {
	if let Err(e) = joined
		&& e.is_panic()
	{
		std::panic::resume_unwind(e.into_panic());
	}
}
