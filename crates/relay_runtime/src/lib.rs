#![forbid(unsafe_code)]
//! Relay runtime: the per-instance pipeline, the instance lifecycle and the
//! supervisor that keeps one instance running per configuration unit.

pub mod adapters;
pub mod backpressure;
pub mod config;
pub mod delivery;
pub mod emotes;
pub mod health;
pub mod instance;
pub mod ledger;
pub mod moderation;
pub mod pipeline;
pub mod supervisor;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod test_support;

pub use backpressure::{BackpressureGuard, InFlight};
pub use config::{ConfigError, ConfigSnapshot, ConfigSource, ConfigSpec, FeatureToggle, FileConfigSource};
pub use delivery::{DeliveryOutcome, DeliveryPath, LeaseGate};
pub use emotes::EmoteCache;
pub use instance::{Connector, InstanceControl, InstanceError, InstanceState, Sessions};
pub use ledger::{HistoryLedger, LEDGER_CAPACITY};
pub use supervisor::{RelayContext, Supervisor, UnitChange};
