#![forbid(unsafe_code)]

pub(crate) mod common;
pub mod seventv;
pub mod twitch;

pub use common::{ImageFormat, UnknownImageFormat};
pub use seventv::SevenTvDirectory;
pub use twitch::twitch_emote_image;
