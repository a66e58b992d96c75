#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use relay_platform::{DeliveredId, DeliveryTarget, EmoteDirectory, ImageRef, MessagePatch, TemporaryAsset};
use tracing::{debug, warn};

use crate::pipeline::format::substitute_tokens;
use crate::pipeline::{EmoteFollowUp, EmoteSource, PendingEmote};

/// Serializes emote lease cycles across every instance of the process.
///
/// The delivery target only has a handful of asset slots, so at most one
/// edit cycle holds temporary assets at a time.
#[derive(Debug, Clone, Default)]
pub struct LeaseGate(Arc<tokio::sync::Mutex<()>>);

impl LeaseGate {
	pub fn new() -> Self {
		Self::default()
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeaseReport {
	pub created: usize,
	pub deleted: usize,
	pub edited: bool,
}

/// Resolves unmapped emotes into temporary assets for one edit.
#[derive(Clone)]
pub struct EmoteLeases {
	directory: Arc<dyn EmoteDirectory>,
	gate: LeaseGate,
	hold: Duration,
}

impl EmoteLeases {
	pub fn new(directory: Arc<dyn EmoteDirectory>, gate: LeaseGate, hold: Duration) -> Self {
		Self { directory, gate, hold }
	}

	/// Upload, edit, wait, and release. Every created asset is deleted before
	/// this returns, whatever failed along the way.
	pub async fn run(&self, target: &dyn DeliveryTarget, message: &DeliveredId, follow: &EmoteFollowUp) -> LeaseReport {
		let _slot = self.gate.0.lock().await;
		let mut report = LeaseReport::default();

		let mut leases: Vec<(String, TemporaryAsset)> = Vec::new();
		for pending in &follow.pending {
			let Some(image_ref) = self.locate(follow, pending).await else {
				continue;
			};

			let image = match self.directory.fetch(&image_ref).await {
				Ok(image) => image,
				Err(e) => {
					warn!(emote = %pending.name, url = %image_ref.url, error = %e, "emote image fetch failed");
					continue;
				}
			};

			match target.create_temporary_asset(&pending.name, &image).await {
				Ok(asset) => {
					metrics::counter!("relay_emote_leases_total").increment(1);
					report.created += 1;
					leases.push((pending.name.clone(), asset));
				}
				Err(e) => warn!(emote = %pending.name, error = %e, "temporary emote upload failed"),
			}
		}

		if !leases.is_empty() {
			let content = substitute_tokens(&follow.content, |tok| {
				leases
					.iter()
					.find(|(name, _)| name == tok)
					.map(|(_, asset)| asset.reference.clone())
			});

			let patch = MessagePatch { content: Some(content) };
			match target.update_message(message, &patch).await {
				Ok(()) => report.edited = true,
				Err(e) => warn!(message = %message, error = %e, "emote edit failed"),
			}

			tokio::time::sleep(self.hold).await;
		}

		for (name, asset) in leases {
			match target.delete_asset(&asset.id).await {
				Ok(()) => report.deleted += 1,
				Err(e) => warn!(emote = %name, asset = %asset.id, error = %e, "temporary emote delete failed"),
			}
		}

		debug!(message = %message, ?report, "emote lease cycle finished");
		report
	}

	async fn locate(&self, follow: &EmoteFollowUp, pending: &PendingEmote) -> Option<ImageRef> {
		match &pending.source {
			EmoteSource::Native(image) => Some(image.clone()),
			EmoteSource::External => {
				let channel_id = follow.channel_id.as_ref().map(|c| c.as_str()).unwrap_or_default();
				match self
					.directory
					.resolve(channel_id, follow.author_id.as_str(), &pending.name)
					.await
				{
					Ok(found) => found,
					Err(e) => {
						warn!(emote = %pending.name, error = %e, "external emote lookup failed");
						None
					}
				}
			}
		}
	}
}
