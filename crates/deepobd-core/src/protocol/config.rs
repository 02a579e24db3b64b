//! Transport timing configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{ConfigError, DEFAULT_BAUD_RATE};

/// Timing and framing parameters of a [`BluetoothTransport`](super::BluetoothTransport)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Added to both receive timeouts on the dedicated adapter path
    pub read_timeout_offset_ms: u64,
    /// Wait for the echo of a BMW-FAST request
    pub echo_timeout_ms: u64,
    /// Added to the receive timeout on the ELM327 path
    pub elm_read_timeout_offset_ms: u64,
    /// AT command answer and leave-data-mode limit
    pub elm_command_timeout_ms: u64,
    /// CAN frame inactivity limit (flow control wait, reassembly)
    pub elm_data_timeout_ms: u64,
    /// Block size granted in our flow control frames
    pub elm_block_size: u8,
    /// Separation time granted in our flow control frames
    pub elm_separation_time_ms: u8,
    /// Lower bound for the delay between outbound consecutive frames
    pub min_separation_time_ms: u64,
    /// Pump wait between cycles
    pub pump_poll_interval_ms: u64,
    /// Inactivity limit while reading the identification response
    pub adapter_ident_timeout_ms: u64,
    /// ELM327 transmit header after init
    pub default_can_header: u16,
    /// Baud rate of the serial port behind the RFCOMM channel
    pub link_baud_rate: u32,
    /// Connect attempts before giving up
    pub connect_attempts: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            read_timeout_offset_ms: 1000,
            echo_timeout_ms: 500,
            elm_read_timeout_offset_ms: 1000,
            elm_command_timeout_ms: 1500,
            elm_data_timeout_ms: 2000,
            elm_block_size: 8,
            elm_separation_time_ms: 0,
            min_separation_time_ms: 10,
            pump_poll_interval_ms: 10,
            adapter_ident_timeout_ms: 1000,
            default_can_header: 0x6F1,
            link_baud_rate: DEFAULT_BAUD_RATE,
            connect_attempts: 2,
        }
    }
}

impl TransportConfig {
    /// Parse a JSON document; missing fields keep their defaults
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::InvalidValue(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the transport cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pump_poll_interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "pump_poll_interval_ms must be > 0".to_string(),
            ));
        }
        if self.elm_command_timeout_ms == 0 || self.elm_data_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "ELM327 timeouts must be > 0".to_string(),
            ));
        }
        if self.default_can_header > 0x7FF {
            return Err(ConfigError::InvalidValue(format!(
                "CAN header {:#x} exceeds 11 bits",
                self.default_can_header
            )));
        }
        if self.link_baud_rate == 0 {
            return Err(ConfigError::InvalidValue("link_baud_rate must be > 0".to_string()));
        }
        if self.connect_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "connect_attempts must be >= 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn read_timeout_offset(&self) -> Duration {
        Duration::from_millis(self.read_timeout_offset_ms)
    }

    pub fn echo_timeout(&self) -> Duration {
        Duration::from_millis(self.echo_timeout_ms)
    }

    pub fn elm_read_timeout_offset(&self) -> Duration {
        Duration::from_millis(self.elm_read_timeout_offset_ms)
    }

    pub fn elm_command_timeout(&self) -> Duration {
        Duration::from_millis(self.elm_command_timeout_ms)
    }

    pub fn elm_data_timeout(&self) -> Duration {
        Duration::from_millis(self.elm_data_timeout_ms)
    }

    pub fn min_separation_time(&self) -> Duration {
        Duration::from_millis(self.min_separation_time_ms)
    }

    pub fn pump_poll_interval(&self) -> Duration {
        Duration::from_millis(self.pump_poll_interval_ms)
    }

    pub fn adapter_ident_timeout(&self) -> Duration {
        Duration::from_millis(self.adapter_ident_timeout_ms)
    }
}
