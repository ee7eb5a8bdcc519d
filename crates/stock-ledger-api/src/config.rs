use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stock_ledger_core::BuyerDirectory;

use crate::EngineError;

const DEFAULT_WATCH_INTERVAL_SECS: u64 = 300;

/// Engine settings, usually read from a YAML file.
///
/// ```yaml
/// buyers:
///   - key: Steve
///     full_name: Steve Vallance
/// watch_interval_secs: 300
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Canonical buyers offered as view filters.
    pub buyers: BuyerDirectory,
    /// Seconds between ingestion cycles in watch mode.
    pub watch_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { buyers: BuyerDirectory::default(), watch_interval_secs: DEFAULT_WATCH_INTERVAL_SECS }
    }
}

impl EngineConfig {
    /// Read and validate a YAML config file.
    ///
    /// # Errors
    /// Returns [`EngineError::Config`] when the file cannot be read or is invalid.
    pub fn from_path(path: &Path) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path).map_err(|err| {
            EngineError::Config(format!("failed to read config {}: {err}", path.display()))
        })?;
        Self::parse(&content)
    }

    /// Parse and validate YAML config text.
    ///
    /// # Errors
    /// Returns [`EngineError::Config`] for malformed YAML, unknown fields, an invalid
    /// buyer list, or a zero watch interval.
    pub fn parse(yaml: &str) -> Result<Self, EngineError> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|err| EngineError::Config(format!("invalid config: {err}")))?;
        if config.watch_interval_secs == 0 {
            return Err(EngineError::Config("watch_interval_secs MUST be positive".to_string()));
        }
        Ok(config)
    }

    #[must_use]
    pub fn watch_interval(&self) -> Duration {
        Duration::from_secs(self.watch_interval_secs)
    }
}
