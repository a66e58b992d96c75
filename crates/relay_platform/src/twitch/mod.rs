#![forbid(unsafe_code)]

pub mod helix;

pub use helix::HelixProfiles;
