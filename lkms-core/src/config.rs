//! Configuration for the LKMS daemon
//!
//! All addresses are resolved before the core is constructed and passed in
//! as an immutable value; the reactor never re-reads configuration.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// LKMS process configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LkmsConfig {
    /// Bind address for the northbound HTTP service
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Southbound QKD link endpoint URL
    pub south_url: String,

    /// Octets requested per southbound pull
    #[serde(default = "default_pull_chunk_size")]
    pub pull_chunk_size: usize,

    /// Southbound pull interval in milliseconds
    #[serde(default = "default_pull_interval_ms")]
    pub pull_interval_ms: u64,

    /// Reactor timer tick in milliseconds; bounds timeout/TTL resolution
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Global ceiling over the sum of per-session buffer capacities, octets
    #[serde(default = "default_max_buffer_total")]
    pub max_buffer_total: usize,

    /// Retention window for terminal sessions, seconds
    #[serde(default = "default_terminal_grace_secs")]
    pub terminal_grace_secs: u64,

    /// Northbound commands processed per reactor wake-up
    #[serde(default = "default_command_batch")]
    pub command_batch: usize,

    /// Southbound hand-off queue depth, in chunks
    #[serde(default = "default_feed_depth")]
    pub feed_depth: usize,
}

impl LkmsConfig {
    /// Load configuration from `LKMS_`-prefixed environment variables
    pub fn from_env() -> Result<Self> {
        let config: Self = envy::prefixed("LKMS_")
            .from_env()
            .map_err(|e| Error::Config(format!("Failed to parse environment variables: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.listen_address
            .parse::<std::net::SocketAddr>()
            .map_err(|e| Error::Config(format!("Invalid listen_address: {e}")))?;

        Url::parse(&self.south_url)
            .map_err(|e| Error::Config(format!("Invalid south_url '{}': {e}", self.south_url)))?;

        if self.pull_chunk_size == 0 || self.pull_chunk_size > crate::MAX_PULL_SIZE {
            return Err(Error::Config(format!(
                "pull_chunk_size must be between 1 and {}",
                crate::MAX_PULL_SIZE
            )));
        }

        if self.tick_interval_ms == 0 {
            return Err(Error::Config("tick_interval_ms must be > 0".to_string()));
        }

        if self.max_buffer_total < crate::MAX_SESSION_BUFFER {
            return Err(Error::Config(format!(
                "max_buffer_total must be >= {} to fit a single session",
                crate::MAX_SESSION_BUFFER
            )));
        }

        if self.command_batch == 0 {
            return Err(Error::Config("command_batch must be > 0".to_string()));
        }

        if self.feed_depth == 0 {
            return Err(Error::Config("feed_depth must be > 0".to_string()));
        }

        Ok(())
    }

    pub fn south_url(&self) -> Url {
        Url::parse(&self.south_url).expect("validated at load")
    }

    pub fn pull_interval(&self) -> Duration {
        Duration::from_millis(self.pull_interval_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn terminal_grace(&self) -> Duration {
        Duration::from_secs(self.terminal_grace_secs)
    }
}

// Default value functions
fn default_listen_address() -> String {
    "0.0.0.0:8448".to_string()
}

fn default_pull_chunk_size() -> usize {
    1024
}

fn default_pull_interval_ms() -> u64 {
    100
}

fn default_tick_interval_ms() -> u64 {
    250
}

fn default_max_buffer_total() -> usize {
    crate::DEFAULT_BUFFER_TOTAL
}

fn default_terminal_grace_secs() -> u64 {
    30
}

fn default_command_batch() -> usize {
    32
}

fn default_feed_depth() -> usize {
    16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> LkmsConfig {
        LkmsConfig {
            listen_address: "127.0.0.1:8448".to_string(),
            south_url: "https://qkd.local/keys".to_string(),
            pull_chunk_size: 1024,
            pull_interval_ms: 100,
            tick_interval_ms: 250,
            max_buffer_total: 16 * 1024 * 1024,
            terminal_grace_secs: 30,
            command_batch: 32,
            feed_depth: 16,
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_listen_address() {
        let mut config = base_config();
        config.listen_address = "not-an-address".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_south_url() {
        let mut config = base_config();
        config.south_url = "::: nope".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_tick() {
        let mut config = base_config();
        config.tick_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_tiny_ceiling() {
        let mut config = base_config();
        config.max_buffer_total = 1024;
        assert!(config.validate().is_err());
    }
}
