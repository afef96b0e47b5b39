//! Device and allocator configuration.
//!
//! All structs have defaults matching the reference driver, `with_*`
//! builders, an environment overlay and YAML loading.

use crate::error::{Result, StratumError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default block size for state block pools.
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// Number of blocks the first growth of an empty pool provides.
pub const INITIAL_GROWTH_BLOCKS: u32 = 32;

/// Default ceiling for a block pool mapping: 1 GiB.
pub const DEFAULT_MAX_POOL_SIZE: u64 = 1 << 30;

/// Hard ceiling for a block pool mapping. Offsets and cursors are `u32`.
pub const MAX_POOL_SIZE_LIMIT: u64 = 1 << 31;

/// Smallest state size class (64 bytes, one cache line).
pub const MIN_STATE_SIZE_LOG2: u32 = 6;

/// Largest state size class (1 KiB).
pub const MAX_STATE_SIZE_LOG2: u32 = 10;

/// Default size of a batch buffer.
pub const DEFAULT_BATCH_SIZE: u32 = 8192;

/// Default initial capacity of a relocation list.
pub const DEFAULT_RELOC_CAPACITY: usize = 256;

/// Configuration for one block pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockPoolConfig {
    /// Size of each block. Must be a power of two.
    pub block_size: u32,
    /// Largest mapping the pool may grow to.
    pub max_size: u64,
}

impl Default for BlockPoolConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            max_size: DEFAULT_MAX_POOL_SIZE,
        }
    }
}

impl BlockPoolConfig {
    /// Create config with a custom block size.
    pub fn with_block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    /// Create config with a custom size ceiling.
    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = max_size;
        self
    }

    /// Size of the mapping after the first growth of an empty pool.
    #[must_use]
    pub fn initial_size(&self) -> u64 {
        (u64::from(self.block_size) * u64::from(INITIAL_GROWTH_BLOCKS)).max(4096)
    }

    /// Check that the pool can be built from this configuration.
    pub fn validate(&self) -> Result<()> {
        if self.block_size < 64 || !self.block_size.is_power_of_two() {
            return Err(StratumError::config(
                "block_size",
                format!("{} is not a power of two >= 64", self.block_size),
            ));
        }
        if !self.max_size.is_power_of_two() || self.max_size > MAX_POOL_SIZE_LIMIT {
            return Err(StratumError::config(
                "max_size",
                format!("{} is not a power of two <= 2 GiB", self.max_size),
            ));
        }
        if self.max_size < self.initial_size() {
            return Err(StratumError::config(
                "max_size",
                format!(
                    "{} is smaller than the first growth of {} bytes",
                    self.max_size,
                    self.initial_size()
                ),
            ));
        }
        Ok(())
    }
}

/// Configuration for a fixed-size state pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatePoolConfig {
    /// log2 of the smallest size class.
    pub min_size_log2: u32,
    /// log2 of the largest size class.
    pub max_size_log2: u32,
}

impl Default for StatePoolConfig {
    fn default() -> Self {
        Self {
            min_size_log2: MIN_STATE_SIZE_LOG2,
            max_size_log2: MAX_STATE_SIZE_LOG2,
        }
    }
}

impl StatePoolConfig {
    /// Create config with a custom size-class range.
    pub fn with_size_classes(mut self, min_size_log2: u32, max_size_log2: u32) -> Self {
        self.min_size_log2 = min_size_log2;
        self.max_size_log2 = max_size_log2;
        self
    }

    /// Number of buckets.
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        (self.max_size_log2 - self.min_size_log2 + 1) as usize
    }

    /// Check the size classes against the block size they carve.
    pub fn validate(&self, block_size: u32) -> Result<()> {
        if self.min_size_log2 > self.max_size_log2 {
            return Err(StratumError::config(
                "min_size_log2",
                format!(
                    "{} is greater than max_size_log2 {}",
                    self.min_size_log2, self.max_size_log2
                ),
            ));
        }
        if self.min_size_log2 < 2 {
            return Err(StratumError::config(
                "min_size_log2",
                "size classes must hold a 4-byte free-list link",
            ));
        }
        if self.max_size_log2 >= 32 || (1u32 << self.max_size_log2) > block_size {
            return Err(StratumError::config(
                "max_size_log2",
                format!(
                    "size class 2^{} does not fit in a {}-byte block",
                    self.max_size_log2, block_size
                ),
            ));
        }
        Ok(())
    }
}

/// Configuration for batch buffers and relocation lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Size of each pooled batch buffer.
    pub buffer_size: u32,
    /// Initial capacity of relocation lists.
    pub reloc_capacity: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BATCH_SIZE,
            reloc_capacity: DEFAULT_RELOC_CAPACITY,
        }
    }
}

impl BatchConfig {
    /// Create config with a custom batch buffer size.
    pub fn with_buffer_size(mut self, buffer_size: u32) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Create config with a custom initial relocation capacity.
    pub fn with_reloc_capacity(mut self, reloc_capacity: usize) -> Self {
        self.reloc_capacity = reloc_capacity;
        self
    }

    /// Check that a batch buffer can hold a chain jump plus payload.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size < 64 || self.buffer_size % 8 != 0 {
            return Err(StratumError::config(
                "buffer_size",
                format!("{} is not a multiple of 8 >= 64", self.buffer_size),
            ));
        }
        if self.reloc_capacity == 0 {
            return Err(StratumError::config("reloc_capacity", "must be non-zero"));
        }
        Ok(())
    }
}

/// Top-level configuration of a [`Device`](crate::device::Device).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Dynamic state block pool.
    pub dynamic_state: BlockPoolConfig,
    /// Surface state block pool.
    pub surface_state: BlockPoolConfig,
    /// Instruction block pool.
    pub instruction: BlockPoolConfig,
    /// Size classes shared by the dynamic and surface state pools.
    pub state_pool: StatePoolConfig,
    /// Batch buffers.
    pub batch: BatchConfig,
}

impl DeviceConfig {
    /// Use one block size for all three block pools.
    pub fn with_block_size(mut self, block_size: u32) -> Self {
        self.dynamic_state.block_size = block_size;
        self.surface_state.block_size = block_size;
        self.instruction.block_size = block_size;
        self
    }

    /// Use one size ceiling for all three block pools.
    pub fn with_max_pool_size(mut self, max_size: u64) -> Self {
        self.dynamic_state.max_size = max_size;
        self.surface_state.max_size = max_size;
        self.instruction.max_size = max_size;
        self
    }

    /// Replace the state pool size classes.
    pub fn with_state_pool(mut self, state_pool: StatePoolConfig) -> Self {
        self.state_pool = state_pool;
        self
    }

    /// Replace the batch configuration.
    pub fn with_batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    /// Create configuration from defaults overlaid with environment variables.
    ///
    /// Environment variables:
    /// - `STRATUM_BLOCK_SIZE`: block size of every block pool
    /// - `STRATUM_MAX_POOL_SIZE`: size ceiling of every block pool
    /// - `STRATUM_STATE_MIN_LOG2` / `STRATUM_STATE_MAX_LOG2`: state size classes
    /// - `STRATUM_BATCH_SIZE`: batch buffer size
    pub fn from_env() -> Result<Self> {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    /// Apply overrides looked up by variable name.
    pub fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(v) = lookup("STRATUM_BLOCK_SIZE") {
            self = self.with_block_size(parse_var("STRATUM_BLOCK_SIZE", &v)?);
        }
        if let Some(v) = lookup("STRATUM_MAX_POOL_SIZE") {
            self = self.with_max_pool_size(parse_var("STRATUM_MAX_POOL_SIZE", &v)?);
        }
        if let Some(v) = lookup("STRATUM_STATE_MIN_LOG2") {
            self.state_pool.min_size_log2 = parse_var("STRATUM_STATE_MIN_LOG2", &v)?;
        }
        if let Some(v) = lookup("STRATUM_STATE_MAX_LOG2") {
            self.state_pool.max_size_log2 = parse_var("STRATUM_STATE_MAX_LOG2", &v)?;
        }
        if let Some(v) = lookup("STRATUM_BATCH_SIZE") {
            self.batch.buffer_size = parse_var("STRATUM_BATCH_SIZE", &v)?;
        }
        Ok(self)
    }

    /// Parse a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| StratumError::ConfigParse {
            origin: "<inline>".to_string(),
            cause: e.to_string(),
        })
    }

    /// Load a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| StratumError::Io {
            path: path.to_path_buf(),
            cause: e.to_string(),
        })?;
        serde_yaml::from_str(&text).map_err(|e| StratumError::ConfigParse {
            origin: path.display().to_string(),
            cause: e.to_string(),
        })
    }

    /// Serialize to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| StratumError::ConfigParse {
            origin: "<inline>".to_string(),
            cause: e.to_string(),
        })
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<()> {
        for pool in [&self.dynamic_state, &self.surface_state, &self.instruction] {
            pool.validate()?;
        }
        self.state_pool.validate(self.dynamic_state.block_size)?;
        self.state_pool.validate(self.surface_state.block_size)?;
        self.batch.validate()
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| StratumError::config(name, format!("'{}': {}", value, e)))
}
