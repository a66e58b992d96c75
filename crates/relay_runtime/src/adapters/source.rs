#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::io;

use parking_lot::Mutex;
use relay_domain::UnitId;

use crate::config::{ConfigError, ConfigSource, ConfigSpec};

/// Configuration source holding unit texts in memory.
///
/// Texts are parsed on every load, so a malformed text fails the load just
/// like a broken file would.
#[derive(Debug, Default)]
pub struct StaticUnits {
	units: Mutex<BTreeMap<UnitId, String>>,
	loads: Mutex<Vec<UnitId>>,
}

impl StaticUnits {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn set(&self, unit: &UnitId, text: impl Into<String>) {
		self.units.lock().insert(unit.clone(), text.into());
	}

	pub fn remove(&self, unit: &UnitId) {
		self.units.lock().remove(unit);
	}

	/// Number of loads seen for `unit`.
	pub fn loads(&self, unit: &UnitId) -> usize {
		self.loads.lock().iter().filter(|u| *u == unit).count()
	}
}

impl ConfigSource for StaticUnits {
	fn list_units(&self) -> Result<Vec<UnitId>, ConfigError> {
		Ok(self.units.lock().keys().cloned().collect())
	}

	fn load(&self, unit: &UnitId) -> Result<ConfigSpec, ConfigError> {
		self.loads.lock().push(unit.clone());
		let text = self
			.units
			.lock()
			.get(unit)
			.cloned()
			.ok_or_else(|| ConfigError::Io {
				path: unit.to_path(),
				source: io::Error::new(io::ErrorKind::NotFound, "unit not registered"),
			})?;
		ConfigSpec::from_toml_str(unit.clone(), &text)
	}
}
