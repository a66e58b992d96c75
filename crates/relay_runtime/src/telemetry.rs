#![forbid(unsafe_code)]

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info,relay_runtime=debug";

/// Install the fmt subscriber; `false` when one was already installed.
pub fn init_tracing(default_filter: Option<&str>) -> bool {
	let filter = std::env::var("RUST_LOG")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty())
		.unwrap_or_else(|| default_filter.unwrap_or(DEFAULT_FILTER).to_string());

	tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false))
		.try_init()
		.is_ok()
}
