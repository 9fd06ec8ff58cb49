//! Node configuration
//!
//! Loaded from a JSON file; every field has a default so a missing file or a
//! partial one both work.
//!
//! ```json
//! {
//!   "confirmed_after": 6,
//!   "sync_interval_secs": 300,
//!   "retry": { "initial_delay_millis": 500 }
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{NodeError, NodeResult};
use crate::projection::ProjectionOptions;

/// Exponential backoff settings shared by the sealer and sender queues
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_delay_millis: u64,
    pub max_delay_millis: u64,
    pub factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_millis: 1_000,
            max_delay_millis: 60_000,
            factor: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Confirmations after which a seal is final and its watch is dropped
    pub confirmed_after: u32,
    /// Seal watcher polling interval
    pub sync_interval_secs: u64,
    /// Addresses per `addresses_transactions` call
    pub sync_batch_size: usize,
    /// Pause between two address batches of one network
    pub sync_batch_delay_secs: u64,
    /// How long a per-peer lock may be held before it is forcibly released
    pub lock_timeout_millis: u64,
    pub retry: RetryConfig,
    /// Log entries read per projection fold round
    pub fold_batch_size: usize,
    /// Capacity of change and event broadcasts
    pub event_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            confirmed_after: 10,
            sync_interval_secs: 600,
            sync_batch_size: 50,
            sync_batch_delay_secs: 60,
            lock_timeout_millis: 5_000,
            retry: RetryConfig::default(),
            fold_batch_size: 256,
            event_capacity: 1024,
        }
    }
}

impl NodeConfig {
    /// Read `path`, falling back to defaults when it does not exist
    pub fn load(path: impl AsRef<Path>) -> NodeResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let bytes = std::fs::read(path)?;
        let config: Self = serde_json::from_slice(&bytes)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> NodeResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> NodeResult<()> {
        let invalid = |msg: &str| Err(NodeError::Validation(format!("config: {}", msg)));
        if self.confirmed_after == 0 {
            return invalid("confirmed_after must be at least 1");
        }
        if self.sync_batch_size == 0 || self.fold_batch_size == 0 {
            return invalid("batch sizes must be at least 1");
        }
        if self.event_capacity == 0 {
            return invalid("event_capacity must be at least 1");
        }
        if self.retry.factor < 1.0 {
            return invalid("retry.factor must be >= 1");
        }
        if self.retry.initial_delay_millis > self.retry.max_delay_millis {
            return invalid("retry.initial_delay_millis exceeds retry.max_delay_millis");
        }
        Ok(())
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn sync_batch_delay(&self) -> Duration {
        Duration::from_secs(self.sync_batch_delay_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_millis)
    }

    pub fn projection_options(&self) -> ProjectionOptions {
        ProjectionOptions {
            fold_batch_size: self.fold_batch_size,
            event_capacity: self.event_capacity,
        }
    }
}
