use serde::Deserialize;
use std::time::Duration;

use super::{Error, MasterKeyId};

const DEFAULT_KEY_SERVICE_TIMEOUT: Duration = Duration::from_secs(5);

/// Settings for a [`PhiEngine`](super::PhiEngine).
///
/// Usually loaded from the application's TOML configuration:
///
/// ```rust
/// let config = phi_vault::EngineConfig::from_toml_str(r#"
///     master_key_id = "alias/phi"
///     key_service_timeout_ms = 2500
/// "#).unwrap();
///
/// assert_eq!("alias/phi", config.master_key_id.as_str());
/// assert_eq!(std::time::Duration::from_millis(2500), config.key_service_timeout);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
	/// The master key new data keys are wrapped under.
	pub master_key_id: MasterKeyId,

	/// How long any single key service call may take.
	#[serde(
		rename = "key_service_timeout_ms",
		default = "default_timeout",
		deserialize_with = "millis"
	)]
	pub key_service_timeout: Duration,
}

fn default_timeout() -> Duration {
	DEFAULT_KEY_SERVICE_TIMEOUT
}

fn millis<'de, D: serde::Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
	u64::deserialize(d).map(Duration::from_millis)
}

impl EngineConfig {
	pub fn new(master_key_id: impl Into<MasterKeyId>) -> Self {
		Self {
			master_key_id: master_key_id.into(),
			key_service_timeout: DEFAULT_KEY_SERVICE_TIMEOUT,
		}
	}

	pub fn with_key_service_timeout(mut self, timeout: Duration) -> Self {
		self.key_service_timeout = timeout;
		self
	}

	/// Parse and [`validate`](Self::validate) a TOML configuration.
	pub fn from_toml_str(s: &str) -> Result<Self, Error> {
		let config: Self = toml::from_str(s).map_err(|e| Error::config(e.to_string()))?;
		config.validate()?;
		Ok(config)
	}

	pub fn validate(&self) -> Result<(), Error> {
		if self.master_key_id.as_str().trim().is_empty() {
			return Err(Error::config("master_key_id must not be empty"));
		}
		if self.key_service_timeout.is_zero() {
			return Err(Error::config("key_service_timeout_ms must be greater than zero"));
		}

		Ok(())
	}
}
