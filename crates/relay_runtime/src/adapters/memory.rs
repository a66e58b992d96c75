#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_platform::{
	AssetId, DeliveredId, DeliveryTarget, EmoteImage, ImageFormat, MessagePatch, OutboundMessage, TemporaryAsset,
};
use tokio::sync::{Semaphore, watch};

/// One call observed by [`MemoryTarget`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetCall {
	Create(DeliveredId, OutboundMessage),
	Update(DeliveredId, MessagePatch),
	CreateAsset { id: AssetId, name: String, format: ImageFormat },
	DeleteAsset(AssetId),
}

/// Delivery target that records every call in memory.
///
/// A gated target parks `create_message` until permits are released, which
/// lets tests hold deliveries in flight.
#[derive(Debug)]
pub struct MemoryTarget {
	calls: Mutex<Vec<TargetCall>>,
	changed: watch::Sender<usize>,
	next_id: AtomicU64,
	gate: Option<Semaphore>,
	fail_creates: AtomicBool,
	fail_assets: AtomicBool,
}

impl Default for MemoryTarget {
	fn default() -> Self {
		Self::new()
	}
}

impl MemoryTarget {
	pub fn new() -> Self {
		Self::build(None)
	}

	/// Target whose sends block until [`MemoryTarget::release`] or [`MemoryTarget::open`].
	pub fn gated() -> Self {
		Self::build(Some(Semaphore::new(0)))
	}

	fn build(gate: Option<Semaphore>) -> Self {
		let (changed, _) = watch::channel(0);
		Self {
			calls: Mutex::new(Vec::new()),
			changed,
			next_id: AtomicU64::new(1),
			gate,
			fail_creates: AtomicBool::new(false),
			fail_assets: AtomicBool::new(false),
		}
	}

	pub fn release(&self, sends: usize) {
		if let Some(gate) = &self.gate {
			gate.add_permits(sends);
		}
	}

	/// Stop gating; every parked and future send proceeds.
	pub fn open(&self) {
		if let Some(gate) = &self.gate {
			gate.close();
		}
	}

	pub fn set_fail_creates(&self, fail: bool) {
		self.fail_creates.store(fail, Ordering::Relaxed);
	}

	pub fn set_fail_assets(&self, fail: bool) {
		self.fail_assets.store(fail, Ordering::Relaxed);
	}

	pub fn calls(&self) -> Vec<TargetCall> {
		self.calls.lock().clone()
	}

	/// Messages created so far, in delivery order.
	pub fn created(&self) -> Vec<OutboundMessage> {
		self.calls
			.lock()
			.iter()
			.filter_map(|c| match c {
				TargetCall::Create(_, m) => Some(m.clone()),
				_ => None,
			})
			.collect()
	}

	/// Resolve once `pred` holds for the recorded calls.
	pub async fn wait_until(&self, mut pred: impl FnMut(&[TargetCall]) -> bool) {
		let mut rx = self.changed.subscribe();
		loop {
			let done = pred(self.calls.lock().as_slice());
			if done {
				return;
			}
			if rx.changed().await.is_err() {
				return;
			}
		}
	}

	fn record(&self, call: TargetCall) {
		self.calls.lock().push(call);
		self.changed.send_modify(|n| *n += 1);
	}

	fn next(&self, prefix: &str) -> String {
		format!("{prefix}-{}", self.next_id.fetch_add(1, Ordering::Relaxed))
	}
}

#[async_trait]
impl DeliveryTarget for MemoryTarget {
	async fn create_message(&self, message: &OutboundMessage) -> anyhow::Result<DeliveredId> {
		if let Some(gate) = &self.gate
			&& let Ok(permit) = gate.acquire().await
		{
			permit.forget();
		}
		if self.fail_creates.load(Ordering::Relaxed) {
			anyhow::bail!("memory target rejected message: status=500");
		}

		let id = DeliveredId(self.next("msg"));
		self.record(TargetCall::Create(id.clone(), message.clone()));
		Ok(id)
	}

	async fn update_message(&self, id: &DeliveredId, patch: &MessagePatch) -> anyhow::Result<()> {
		self.record(TargetCall::Update(id.clone(), patch.clone()));
		Ok(())
	}

	async fn create_temporary_asset(&self, name: &str, image: &EmoteImage) -> anyhow::Result<TemporaryAsset> {
		if self.fail_assets.load(Ordering::Relaxed) {
			anyhow::bail!("memory target asset slots exhausted");
		}

		let id = AssetId(self.next("asset"));
		self.record(TargetCall::CreateAsset {
			id: id.clone(),
			name: name.to_string(),
			format: image.format,
		});
		let animated = if image.format.is_animated() { "a" } else { "" };
		Ok(TemporaryAsset {
			reference: format!("<{animated}:{name}:{id}>"),
			id,
		})
	}

	async fn delete_asset(&self, id: &AssetId) -> anyhow::Result<()> {
		self.record(TargetCall::DeleteAsset(id.clone()));
		Ok(())
	}
}
