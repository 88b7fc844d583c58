//! Subsystem configuration
//!
//! Tuning knobs for the key cache, the reuse cache, quota accounting and the
//! background work queue. Values can be built in code or loaded from TOML:
//!
//! ```toml
//! hash_table_size = 4096
//! delay_close_size = 1024
//! quota_limit_bytes = 134217728
//! ```

use crate::core::error::{HiveError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use validator::Validate;

/// Default number of hash buckets in the key cache
pub const DEFAULT_HASH_TABLE_SIZE: usize = 2048;

/// Default capacity of the delayed-close reuse cache
pub const DEFAULT_DELAY_CLOSE_SIZE: usize = 512;

/// Default per-node reference limit (16-bit counter in the on-disk era)
pub const DEFAULT_MAX_REF_COUNT: u32 = 0xFFFF;

/// Default global quota for bin memory (64 MiB)
pub const DEFAULT_QUOTA_LIMIT: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RegistryConfig {
    /// Number of independently lockable buckets in the key cache
    #[validate(range(min = 1, max = 1_048_576))]
    pub hash_table_size: usize,

    /// Capacity of the reuse cache for unreferenced nodes (0 disables it)
    #[validate(range(max = 1_048_576))]
    pub delay_close_size: usize,

    /// Maximum reference count a single node may reach
    #[validate(range(min = 2))]
    pub max_ref_count: u32,

    /// Bytes of bin memory that may be charged across all hives
    #[validate(range(min = 4096))]
    pub quota_limit_bytes: u64,

    /// Threads servicing the background work queue
    #[validate(range(min = 1, max = 64))]
    pub worker_threads: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            hash_table_size: DEFAULT_HASH_TABLE_SIZE,
            delay_close_size: DEFAULT_DELAY_CLOSE_SIZE,
            max_ref_count: DEFAULT_MAX_REF_COUNT,
            quota_limit_bytes: DEFAULT_QUOTA_LIMIT,
            worker_threads: 1,
        }
    }
}

impl RegistryConfig {
    /// Parse and validate a configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: RegistryConfig = toml::from_str(text)?;
        config.check()?;
        Ok(config)
    }

    /// Load and validate a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Run field validation, mapping failures into [`HiveError::InvalidConfig`]
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| HiveError::InvalidConfig(e.to_string()))
    }

    pub fn with_hash_table_size(mut self, size: usize) -> Self {
        self.hash_table_size = size;
        self
    }

    pub fn with_delay_close_size(mut self, size: usize) -> Self {
        self.delay_close_size = size;
        self
    }

    pub fn with_max_ref_count(mut self, limit: u32) -> Self {
        self.max_ref_count = limit;
        self
    }

    pub fn with_quota_limit(mut self, bytes: u64) -> Self {
        self.quota_limit_bytes = bytes;
        self
    }
}
