use std::error::Error;
use std::fs;
use std::path::Path;
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::{CHUNK_SIZE, DEFAULT_PORT, MAX_CHUNK_SIZE, MIN_SUPPORTED_VERSION, PROTOCOL_VERSION};

/// Tunables for one transfer session.
///
/// Every field has a default, so a JSON file only needs the keys it changes.
/// Timeouts of `0` mean "wait forever". A `protocol_version` below
/// `min_supported_version` is allowed and only fails at the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub port: u16,
    pub chunk_size: usize,
    pub protocol_version: u64,
    pub min_supported_version: u64,
    pub connect_timeout_secs: u64,
    pub accept_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    /// Longest wait for any single read or write once the transfer runs.
    pub io_timeout_secs: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            port: DEFAULT_PORT,
            chunk_size: CHUNK_SIZE,
            protocol_version: PROTOCOL_VERSION,
            min_supported_version: MIN_SUPPORTED_VERSION,
            connect_timeout_secs: 30,
            accept_timeout_secs: 0,
            handshake_timeout_secs: 30,
            io_timeout_secs: 60,
        }
    }
}

fn secs(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value))
}

impl TransferConfig {
    pub fn from_file(path: &Path) -> Result<Self, Box<dyn Error>> {
        debug!("Loading config from {}", path.display());
        let raw = fs::read_to_string(path)?;
        let config: TransferConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(format!(
                "chunk_size must be between 1 and {} bytes, got {}",
                MAX_CHUNK_SIZE, self.chunk_size
            ));
        }
        if self.port == 0 {
            return Err("port must not be 0".to_string());
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        secs(self.connect_timeout_secs)
    }

    pub fn accept_timeout(&self) -> Option<Duration> {
        secs(self.accept_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        secs(self.handshake_timeout_secs)
    }

    pub fn io_timeout(&self) -> Option<Duration> {
        secs(self.io_timeout_secs)
    }
}
