//! Agent configuration
//!
//! Loaded from a TOML file when one is given, then overridden by
//! `SKOPOS_*` environment variables. Job-level knobs (thread count,
//! per-address timeout) arrive with the jobs themselves and are not
//! configured here.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{DiscoveryError, Result};

/// Default and minimum per-address expiration budget, in seconds
pub const DEFAULT_TARGET_EXPIRATION: u64 = 60;

/// Agent-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Agent identifier stamped on every outbound message
    #[serde(default = "default_deviceid")]
    pub deviceid: String,

    /// Per-address budget used for the global deadline, in seconds.
    /// Values below 60 are raised to 60.
    #[serde(default = "default_target_expiration")]
    pub target_expiration: u64,
}

fn default_deviceid() -> String {
    "skopos-agent".to_string()
}

fn default_target_expiration() -> u64 {
    DEFAULT_TARGET_EXPIRATION
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            deviceid: default_deviceid(),
            target_expiration: DEFAULT_TARGET_EXPIRATION,
        }
    }
}

impl AgentConfig {
    /// Load configuration from a TOML file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let mut config: AgentConfig = toml::from_str(&content)
            .map_err(|e| DiscoveryError::ConfigError(format!("invalid config: {e}")))?;
        config.apply_env();
        Ok(config)
    }

    /// Apply `SKOPOS_DEVICEID` and `SKOPOS_TARGET_EXPIRATION` overrides
    pub fn apply_env(&mut self) {
        if let Ok(deviceid) = std::env::var("SKOPOS_DEVICEID") {
            if !deviceid.is_empty() {
                self.deviceid = deviceid;
            }
        }
        if let Ok(expiration) = std::env::var("SKOPOS_TARGET_EXPIRATION") {
            if let Ok(expiration) = expiration.parse() {
                self.target_expiration = expiration;
            }
        }
    }

    /// Expiration budget with the 60-second floor applied
    pub fn effective_target_expiration(&self) -> u64 {
        self.target_expiration.max(DEFAULT_TARGET_EXPIRATION)
    }
}
