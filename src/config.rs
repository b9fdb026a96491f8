//! Tracker configuration.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Timing knobs for the confirmation tracker.
///
/// Every field has a default, so a partial JSON file is enough:
///
/// ```json
/// { "grace_period_secs": 10 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Delay between a terminal transition and removal from the registry.
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,

    /// Ceiling on how long an entry may stay pending.
    #[serde(default = "default_confirmation_timeout_secs")]
    pub confirmation_timeout_secs: u64,

    /// How often the listener looks for entries past their ceiling when no
    /// blocks arrive.
    #[serde(default = "default_timeout_check_interval_secs")]
    pub timeout_check_interval_secs: u64,

    /// Target used by callers that do not pick one.
    #[serde(default = "default_target_confirmations")]
    pub default_target_confirmations: u64,
}

fn default_grace_period_secs() -> u64 {
    5
}

fn default_confirmation_timeout_secs() -> u64 {
    300
}

fn default_timeout_check_interval_secs() -> u64 {
    15
}

fn default_target_confirmations() -> u64 {
    2
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_period_secs(),
            confirmation_timeout_secs: default_confirmation_timeout_secs(),
            timeout_check_interval_secs: default_timeout_check_interval_secs(),
            default_target_confirmations: default_target_confirmations(),
        }
    }
}

impl TrackerConfig {
    /// Load a config from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn with_grace_period(mut self, secs: u64) -> Self {
        self.grace_period_secs = secs;
        self
    }

    pub fn with_confirmation_timeout(mut self, secs: u64) -> Self {
        self.confirmation_timeout_secs = secs;
        self
    }

    pub fn with_timeout_check_interval(mut self, secs: u64) -> Self {
        self.timeout_check_interval_secs = secs;
        self
    }

    pub fn with_default_target(mut self, confirmations: u64) -> Self {
        self.default_target_confirmations = confirmations;
        self
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }

    /// Never zero: `tokio::time::interval` panics on a zero period.
    pub fn timeout_check_interval(&self) -> Duration {
        Duration::from_secs(self.timeout_check_interval_secs.max(1))
    }
}
