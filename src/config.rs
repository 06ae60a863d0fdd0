use std::net::SocketAddr;
use std::time::Duration;

use anyhow::ensure;

use crate::{BLOCK_SIZE, DEF_RETRY_COUNT, DEF_TIMEOUT_MS};

/// Server settings, fixed once the server is bound.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the listening socket binds to
    pub listen: SocketAddr,
    /// How long a session waits for an ACK before resending
    pub timeout: Duration,
    /// Retransmissions allowed per block
    pub retries: u8,
    /// Payload bytes per DATA packet
    pub block_size: usize,
    /// Datagrams queued per session before new ones are dropped
    pub inbox_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 69)),
            timeout: Duration::from_millis(DEF_TIMEOUT_MS),
            retries: DEF_RETRY_COUNT,
            block_size: BLOCK_SIZE,
            inbox_capacity: 16,
        }
    }
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            (1..=BLOCK_SIZE).contains(&self.block_size),
            "block size must be between 1 and {BLOCK_SIZE}, got {}",
            self.block_size
        );
        ensure!(!self.timeout.is_zero(), "timeout must be greater than zero");
        ensure!(self.inbox_capacity > 0, "inbox capacity must be greater than zero");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.block_size, 512);
        assert_eq!(config.timeout, Duration::from_millis(DEF_TIMEOUT_MS));
    }

    #[test]
    fn rejects_oversized_blocks() {
        let config = Config {
            block_size: BLOCK_SIZE + 1,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            block_size: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_timeout() {
        let config = Config {
            timeout: Duration::ZERO,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
