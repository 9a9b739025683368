//! Service configuration.
//!
//! A single JSON file carries the housekeeping settings and the event
//! registry; the database URL comes from the environment (see `db`).

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::registry::EventDefinition;

/// Housekeeping tunables. Cron expressions are six-field
/// (`sec min hour day month weekday`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HousekeepingConfig {
    /// Master switch for all scheduled jobs.
    pub enabled: bool,
    /// Default retention cron, used by events without an override.
    pub cron: String,
    pub replay_audit_cron: String,
    pub housekeeping_audit_cron: String,
    /// Recurring snapshot refresh keeping previews warm.
    pub preview_cron: String,
    /// Default retention window in days.
    pub retention_days: i32,
    /// Max rows deleted per batch statement.
    pub batch_size: i64,
    /// Delay before the startup preview warm-up fires.
    pub warmup_delay_secs: u64,
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cron: "0 15 2 * * *".to_string(),
            replay_audit_cron: "0 25 2 * * *".to_string(),
            housekeeping_audit_cron: "0 35 2 * * *".to_string(),
            preview_cron: "0 5 * * * *".to_string(),
            retention_days: 7,
            batch_size: 10_000,
            warmup_delay_secs: 2,
        }
    }
}

/// Top-level configuration file shape.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub housekeeping: HousekeepingConfig,
    #[serde(default)]
    pub events: Vec<EventDefinition>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl AppConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: display.clone(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse { path: display, source })
    }
}
