//! Session-management configuration.
//!
//! Every field has a default, so an empty JSON object (or no file at all)
//! yields a working configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::exam::ExamInfo;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config file: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    /// A connection with no ping for longer than this is flagged.
    pub ping_threshold_ms: u64,
    pub ping_sweep_interval_ms: u64,
    /// Queued instructions older than this are dropped by cleanup.
    pub instruction_ttl_ms: u64,
    pub instruction_cleanup_interval_ms: u64,
    pub proctoring_interval_ms: u64,
    /// Members per collecting room; 0 means unlimited.
    pub collecting_room_capacity: usize,
    /// Attempts per persistence call before giving up.
    pub store_retry_attempts: u32,
    /// How long a mutation waits for another mutation on the same token.
    pub lock_timeout_ms: u64,
    /// Oldest SEB version allowed to connect, e.g. "3.5.0".
    pub minimum_seb_version: Option<String>,
    /// Exams known at startup.
    pub exams: Vec<ExamInfo>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ping_threshold_ms: 5_000,
            ping_sweep_interval_ms: 2_000,
            instruction_ttl_ms: 600_000,
            instruction_cleanup_interval_ms: 60_000,
            proctoring_interval_ms: 5_000,
            collecting_room_capacity: 0,
            store_retry_attempts: 3,
            lock_timeout_ms: 250,
            minimum_seb_version: None,
            exams: Vec::new(),
        }
    }
}

impl SessionConfig {
    /// Load from a JSON file. Unknown keys are ignored, missing keys defaulted.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        info!("Loaded session config from {}", path.display());
        Ok(config)
    }

    pub fn ping_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.ping_sweep_interval_ms)
    }

    pub fn instruction_cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.instruction_cleanup_interval_ms)
    }

    pub fn proctoring_interval(&self) -> Duration {
        Duration::from_millis(self.proctoring_interval_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}
