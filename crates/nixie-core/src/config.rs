//! Configuration for Nixie.
//!
//! TigerStyle: explicit defaults, validated against the limits in
//! [`crate::constants`].

use crate::constants::*;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Main configuration for a Nixie node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NixieConfig {
    /// Node configuration
    #[serde(default)]
    pub node: NodeConfig,

    /// Store and durability configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Runtime (pool, mailboxes) configuration
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl NixieConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.node.validate()?;
        self.store.validate()?;
        self.runtime.validate()?;
        Ok(())
    }
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Address to bind the service listener (default: 0.0.0.0:50051)
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
}

fn default_listen_address() -> String {
    "0.0.0.0:50051".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
        }
    }
}

impl NodeConfig {
    fn validate(&self) -> Result<()> {
        if !self.listen_address.contains(':') {
            return Err(Error::InvalidConfiguration {
                field: "node.listen_address".into(),
                reason: "must be in host:port format".into(),
            });
        }
        Ok(())
    }
}

/// Durability mode for the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DurabilityMode {
    /// Flush the WAL record before acknowledging a write
    #[default]
    WriteAhead,
    /// Acknowledge first, batch WAL records off the hot path
    WriteBehind,
}

/// Store and durability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Durability mode
    #[serde(default)]
    pub durability: DurabilityMode,

    /// WAL file path
    #[serde(default = "default_wal_path")]
    pub wal_path: String,

    /// WAL rotation threshold in bytes
    #[serde(default = "default_wal_max_size")]
    pub wal_max_size_bytes: u64,

    /// Write-behind flush batch size (records)
    #[serde(default = "default_write_behind_batch")]
    pub write_behind_batch_size: usize,

    /// Interval between TTL sweeps (milliseconds)
    #[serde(default = "default_ttl_sweep_interval_ms")]
    pub ttl_sweep_interval_ms: u64,
}

fn default_wal_path() -> String {
    "nixie.wal".to_string()
}

fn default_wal_max_size() -> u64 {
    WAL_FILE_SIZE_BYTES_MAX
}

fn default_write_behind_batch() -> usize {
    WRITE_BEHIND_BATCH_COUNT_DEFAULT
}

fn default_ttl_sweep_interval_ms() -> u64 {
    TTL_SWEEP_INTERVAL_MS_DEFAULT
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            durability: DurabilityMode::default(),
            wal_path: default_wal_path(),
            wal_max_size_bytes: default_wal_max_size(),
            write_behind_batch_size: default_write_behind_batch(),
            ttl_sweep_interval_ms: default_ttl_sweep_interval_ms(),
        }
    }
}

impl StoreConfig {
    fn validate(&self) -> Result<()> {
        if self.wal_path.is_empty() {
            return Err(Error::InvalidConfiguration {
                field: "store.wal_path".into(),
                reason: "must not be empty".into(),
            });
        }
        if self.wal_max_size_bytes == 0 {
            return Err(Error::InvalidConfiguration {
                field: "store.wal_max_size_bytes".into(),
                reason: "must be positive".into(),
            });
        }
        if self.write_behind_batch_size == 0
            || self.write_behind_batch_size > WRITE_BEHIND_QUEUE_CAPACITY
        {
            return Err(Error::InvalidConfiguration {
                field: "store.write_behind_batch_size".into(),
                reason: format!(
                    "must be in 1..={}",
                    WRITE_BEHIND_QUEUE_CAPACITY
                ),
            });
        }
        if self.ttl_sweep_interval_ms == 0 {
            return Err(Error::InvalidConfiguration {
                field: "store.ttl_sweep_interval_ms".into(),
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }
}

/// Runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Worker pool size; 0 means the machine's available parallelism
    #[serde(default)]
    pub worker_threads: usize,

    /// Mailbox capacity for actors and dispatch queues
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
}

fn default_mailbox_capacity() -> usize {
    MAILBOX_CAPACITY_DEFAULT
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            mailbox_capacity: default_mailbox_capacity(),
        }
    }
}

impl RuntimeConfig {
    fn validate(&self) -> Result<()> {
        if self.mailbox_capacity == 0 || self.mailbox_capacity > MAILBOX_CAPACITY_MAX {
            return Err(Error::InvalidConfiguration {
                field: "runtime.mailbox_capacity".into(),
                reason: format!("must be in 1..={}", MAILBOX_CAPACITY_MAX),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = NixieConfig::default();
        config.validate().unwrap();
    }

    #[test]
    fn bad_listen_address_rejected() {
        let mut config = NixieConfig::default();
        config.node.listen_address = "nonsense".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_batch_rejected() {
        let mut config = NixieConfig::default();
        config.store.write_behind_batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn durability_mode_round_trips_kebab_case() {
        let json = serde_json::to_string(&DurabilityMode::WriteBehind).unwrap();
        assert_eq!(json, "\"write-behind\"");
        let mode: DurabilityMode = serde_json::from_str("\"write-ahead\"").unwrap();
        assert_eq!(mode, DurabilityMode::WriteAhead);
    }
}
