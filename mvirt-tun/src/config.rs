//! Adapter configuration

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::queue::DEFAULT_MAX_QUEUED_BATCHES;

/// Per-adapter settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// Adapter name; the registry assigns `mvirt-tun<N>` when unset
    pub name: Option<String>,
    /// Queued batches beyond this bound are dropped, oldest first
    pub max_queued_batches: usize,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            name: None,
            max_queued_batches: DEFAULT_MAX_QUEUED_BATCHES,
        }
    }
}

impl AdapterConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_max_queued_batches(mut self, max: usize) -> Self {
        self.max_queued_batches = max;
        self
    }

    /// Load from a JSON file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_queued_batches == 0 {
            return Err(ConfigError::Invalid(
                "max_queued_batches must be at least 1".to_string(),
            ));
        }
        if let Some(name) = &self.name
            && name.is_empty()
        {
            return Err(ConfigError::Invalid("name must not be empty".to_string()));
        }
        Ok(())
    }
}
