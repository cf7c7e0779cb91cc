//! Agent configuration file handling.
//!
//! The config file supplies defaults for anything not given on the command
//! line; environment variables override the file in turn.

use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Agent configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Channel URL
    pub url: Option<String>,
    /// Idle timeout in seconds
    pub comms_timeout_secs: Option<u64>,
    /// Outer connect retry window in seconds
    pub retry_total_secs: Option<u64>,
    /// Wait between connect attempts in seconds
    pub retry_wait_secs: Option<u64>,
    /// Hard session deadline in seconds from startup
    pub expiry_secs: Option<u64>,
}

impl AgentConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        if let Ok(content) = std::fs::read_to_string(&config_path) {
            match serde_yaml::from_str::<AgentConfig>(&content) {
                Ok(parsed) => {
                    config = parsed;
                    info!("Loaded configuration from {:?}", config_path.as_ref());
                }
                Err(err) => {
                    warn!(
                        "Failed to parse config file {:?} ({err}), using defaults",
                        config_path.as_ref()
                    );
                }
            }
        } else {
            warn!(
                "Config file {:?} not found, using defaults",
                config_path.as_ref()
            );
        }

        config.apply_environment_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_environment_overrides(&mut self) {
        if let Ok(url) = std::env::var("TETHER_URL") {
            info!("Channel URL overridden by environment");
            self.url = Some(url);
        }

        for (var, slot) in [
            ("TETHER_COMMS_TIMEOUT_SECS", &mut self.comms_timeout_secs),
            ("TETHER_RETRY_TOTAL_SECS", &mut self.retry_total_secs),
            ("TETHER_RETRY_WAIT_SECS", &mut self.retry_wait_secs),
            ("TETHER_EXPIRY_SECS", &mut self.expiry_secs),
        ] {
            if let Ok(value) = std::env::var(var) {
                if let Ok(secs) = value.parse::<u64>() {
                    info!("{var} overridden by environment: {secs}");
                    *slot = Some(secs);
                }
            }
        }
    }
}
