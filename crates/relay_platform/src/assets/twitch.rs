#![forbid(unsafe_code)]

use crate::ImageRef;

const TWITCH_EMOTE_CDN: &str = "https://static-cdn.jtvnw.net/emoticons/v2";

/// CDN image for a native emote (dark theme, 2x scale).
pub fn twitch_emote_image(emote_id: &str) -> ImageRef {
	ImageRef::new(format!(
		"{TWITCH_EMOTE_CDN}/{}/default/dark/2.0",
		urlencoding::encode(emote_id)
	))
}
