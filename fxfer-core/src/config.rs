//! Protocol tunables. Hosts deserialize this from their config file.

use std::time::Duration;

use serde::Deserialize;

use crate::protocol::MIN_WINDOW;

/// Engine configuration. Defaults match the reference link settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Largest payload we accept; advertised in handshakes and sizes the receive buffer (default 256).
    #[serde(default = "default_window_size")]
    pub window_size: u16,
    /// Largest payload the send buffer holds (default 256).
    #[serde(default = "default_tx_payload_capacity")]
    pub tx_payload_capacity: u16,
    /// How long a request waits for its response (default 1000 ms).
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    /// Longest file name accepted in requests (default 64).
    #[serde(default = "default_max_file_name_len")]
    pub max_file_name_len: usize,
}

fn default_window_size() -> u16 {
    256
}
fn default_tx_payload_capacity() -> u16 {
    256
}
fn default_response_timeout_ms() -> u64 {
    1000
}
fn default_max_file_name_len() -> usize {
    64
}

impl Default for Config {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            tx_payload_capacity: default_tx_payload_capacity(),
            response_timeout_ms: default_response_timeout_ms(),
            max_file_name_len: default_max_file_name_len(),
        }
    }
}

impl Config {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_size < MIN_WINDOW {
            return Err(ConfigError::WindowTooSmall(self.window_size));
        }
        if self.tx_payload_capacity < MIN_WINDOW {
            return Err(ConfigError::TxCapacityTooSmall(self.tx_payload_capacity));
        }
        if self.response_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.max_file_name_len == 0 {
            return Err(ConfigError::ZeroNameLength);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("window size {0} is below the minimum of {min}", min = MIN_WINDOW)]
    WindowTooSmall(u16),
    #[error("send buffer payload {0} is below the minimum of {min}", min = MIN_WINDOW)]
    TxCapacityTooSmall(u16),
    #[error("response timeout must be non-zero")]
    ZeroTimeout,
    #[error("maximum file name length must be non-zero")]
    ZeroNameLength,
}
