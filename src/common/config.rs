//! Runtime settings for the contract coordinator

use crate::common::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix, e.g. `TABLECOORD_PUMP_DEBOUNCE_MS=50`
pub const ENV_PREFIX: &str = "TABLECOORD";

/// Coordinator settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorSettings {
    /// Delay before each pump pass so bursts of ack changes coalesce
    #[serde(default = "default_pump_debounce")]
    pub pump_debounce_ms: u64,

    /// Pause before retrying a proposal the Raft member rejected
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_pump_debounce() -> u64 {
    200
}
fn default_retry_backoff() -> u64 {
    50
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            pump_debounce_ms: default_pump_debounce(),
            retry_backoff_ms: default_retry_backoff(),
            log_level: default_log_level(),
        }
    }
}

impl CoordinatorSettings {
    /// Load settings from an optional TOML file, then `TABLECOORD_*` env vars.
    /// Missing fields fall back to their defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?;
        let loaded: CoordinatorSettings = settings.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry_backoff_ms == 0 {
            return Err(crate::Error::InvalidConfig(
                "retry_backoff_ms must be positive".into(),
            ));
        }
        if let Err(e) = tracing_subscriber::EnvFilter::try_new(&self.log_level) {
            return Err(crate::Error::InvalidConfig(format!(
                "log_level {:?}: {}",
                self.log_level, e
            )));
        }
        Ok(())
    }

    pub fn pump_debounce(&self) -> Duration {
        Duration::from_millis(self.pump_debounce_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}
