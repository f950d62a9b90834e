//! Loop configuration
//!
//! Loaded from JSON. Every field has a default, so `{}` is a valid config.
//!
//! ```json
//! { "clock": "manual", "trace_capacity": 256 }
//! ```

use super::trace::DEFAULT_TRACE_CAPACITY;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Errors raised while loading a [`LoopConfig`]
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Which time source the loop uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockKind {
    /// `Instant::now` with real sleeps
    #[default]
    System,
    /// Virtual time; idling advances the clock without sleeping
    Manual,
}

/// Settings for an [`EventLoop`](super::EventLoop)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoopConfig {
    pub clock: ClockKind,
    /// Events kept in the trace buffer; 0 disables the buffer
    pub trace_capacity: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            clock: ClockKind::System,
            trace_capacity: DEFAULT_TRACE_CAPACITY,
        }
    }
}

impl LoopConfig {
    /// Parse a config from a JSON string
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read and parse a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn to_json(&self) -> String {
        // Plain struct of enums and integers; serialization cannot fail
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}
