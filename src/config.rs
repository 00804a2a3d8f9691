//! Session and timing configuration.
//!
//! Both structs deserialize from TOML:
//!
//! ```toml
//! [session]
//! driver_path = "/usr/lib/libbusdriver.so"
//! server_node_id = 5
//! bitrate_kbit = 500
//!
//! [timings]
//! activation_floor_ms = 5000
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::bus::types::CLIENT_NODE_ID;
use crate::timeout::SLOWEST_BITRATE_KBIT;

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Addressing and bus parameters of one device session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Path of the loadable bus driver library
    pub driver_path: String,
    /// Bus bitrate in kbit/s. 0 is invalid and coerced to the slowest supported bitrate.
    #[serde(default = "default_bitrate")]
    pub bitrate_kbit: u32,
    /// Node id of the device to update
    pub server_node_id: u8,
    /// Bus the device is addressed on
    #[serde(default)]
    pub bus_id: u8,
    /// Baseline response timeout
    #[serde(default = "default_polling_timeout")]
    pub polling_timeout_ms: u32,
    /// Device-declared write time per TransferData, before load compensation
    #[serde(default = "default_transfer_data_timeout")]
    pub transfer_data_timeout_ms: u32,
    /// Erase budget for RequestDownload
    #[serde(default = "default_request_download_timeout")]
    pub request_download_timeout_ms: u32,
}

fn default_bitrate() -> u32 {
    125
}

fn default_polling_timeout() -> u32 {
    1000
}

fn default_transfer_data_timeout() -> u32 {
    1000
}

fn default_request_download_timeout() -> u32 {
    20_000
}

impl SessionConfig {
    pub fn new(driver_path: impl Into<String>, server_node_id: u8) -> Self {
        Self {
            driver_path: driver_path.into(),
            bitrate_kbit: default_bitrate(),
            server_node_id,
            bus_id: 0,
            polling_timeout_ms: default_polling_timeout(),
            transfer_data_timeout_ms: default_transfer_data_timeout(),
            request_download_timeout_ms: default_request_download_timeout(),
        }
    }

    /// The tool's own node id. Fixed, not configurable.
    pub fn client_node_id(&self) -> u8 {
        CLIENT_NODE_ID
    }

    /// Bitrate actually used on the bus
    pub fn effective_bitrate(&self) -> u32 {
        if self.bitrate_kbit == 0 {
            log::warn!(
                "[Config] Bitrate 0 is invalid, using {} kbit/s",
                SLOWEST_BITRATE_KBIT
            );
            SLOWEST_BITRATE_KBIT
        } else {
            self.bitrate_kbit
        }
    }
}

/// Fixed waits of the update sequence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    /// Minimum duration of the preprogramming broadcast loop
    pub activation_floor_ms: u64,
    /// Pause between two preprogramming broadcasts
    pub broadcast_interval_ms: u64,
    /// Wait before the single seed request retry
    pub seed_retry_delay_ms: u64,
    /// Settle time after the final reset
    pub reset_settle_ms: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            activation_floor_ms: 5000,
            broadcast_interval_ms: 5,
            seed_retry_delay_ms: 1000,
            reset_settle_ms: 500,
        }
    }
}

/// Top-level configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlashConfig {
    pub session: SessionConfig,
    #[serde(default)]
    pub timings: Timings,
}

impl FlashConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_applied() {
        let config = FlashConfig::from_toml_str(
            r#"
            [session]
            driver_path = "libbus.so"
            server_node_id = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.session.bitrate_kbit, 125);
        assert_eq!(config.session.polling_timeout_ms, 1000);
        assert_eq!(config.session.request_download_timeout_ms, 20_000);
        assert_eq!(config.session.bus_id, 0);
        assert_eq!(config.timings, Timings::default());
        assert_eq!(config.session.client_node_id(), 126);
    }

    #[test]
    fn test_partial_timings() {
        let config = FlashConfig::from_toml_str(
            r#"
            [session]
            driver_path = "libbus.so"
            server_node_id = 3
            bitrate_kbit = 500

            [timings]
            activation_floor_ms = 8000
            "#,
        )
        .unwrap();
        assert_eq!(config.session.effective_bitrate(), 500);
        assert_eq!(config.timings.activation_floor_ms, 8000);
        assert_eq!(config.timings.broadcast_interval_ms, 5);
    }

    #[test]
    fn test_zero_bitrate_coerced() {
        let mut session = SessionConfig::new("libbus.so", 1);
        session.bitrate_kbit = 0;
        assert_eq!(session.effective_bitrate(), 100);
    }

    #[test]
    fn test_missing_node_id_rejected() {
        let err = FlashConfig::from_toml_str("[session]\ndriver_path = \"x\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_missing_file() {
        let err = FlashConfig::load("/nonexistent/flash.toml").unwrap_err();
        assert!(err.to_string().starts_with("Failed to read config '/nonexistent/flash.toml'"));
    }
}
