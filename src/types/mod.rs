//! Common types used throughout the storage engine.

mod block_id;
mod varint;

pub use block_id::{BlockId, NodeId, RecordId};
pub use varint::{put_varint, read_varint, varint_len, MAX_VARINT_LEN};

use crate::error::{Result, StorageError};
use serde::{Deserialize, Serialize};

/// Default block size in bytes (4KB)
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Default caller-defined metadata region in block 0
pub const DEFAULT_RESERVED_BYTES: usize = 48;

/// Smallest supported block size
pub const MIN_BLOCK_SIZE: usize = 256;

/// Largest supported block size
pub const MAX_BLOCK_SIZE: usize = 1 << 20;

/// Size of the per-block header
pub const BLOCK_HEADER_SIZE: usize = 32;

/// Size of the store's own header at the start of block 0
pub const STORE_HEADER_SIZE: usize = 24;

/// Bytes of the caller region used by a tree: root pointer, height and flags
pub const TREE_METADATA_SIZE: usize = 24;

/// Smallest fanout that keeps split and merge well defined
pub const MIN_FANOUT: usize = 3;

/// Default maximum entries per node
pub const DEFAULT_MAX_ENTRIES: usize = 64;

/// Block store geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockStoreConfig {
    /// Size of every block, header included
    pub block_size: usize,
    /// Caller-defined metadata bytes in block 0
    pub reserved_bytes: usize,
}

impl Default for BlockStoreConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            reserved_bytes: DEFAULT_RESERVED_BYTES,
        }
    }
}

impl BlockStoreConfig {
    /// Create a new config
    pub fn new(block_size: usize, reserved_bytes: usize) -> Self {
        Self {
            block_size,
            reserved_bytes,
        }
    }

    /// Payload bytes per block
    pub fn content_capacity(&self) -> usize {
        self.block_size - BLOCK_HEADER_SIZE
    }

    /// Reject geometries the on-disk layout cannot represent
    pub fn validate(&self) -> Result<()> {
        if !self.block_size.is_power_of_two()
            || self.block_size < MIN_BLOCK_SIZE
            || self.block_size > MAX_BLOCK_SIZE
        {
            return Err(StorageError::invalid_operation(format!(
                "block size must be a power of two in [{}, {}], got {}",
                MIN_BLOCK_SIZE, MAX_BLOCK_SIZE, self.block_size
            )));
        }
        if STORE_HEADER_SIZE + self.reserved_bytes > self.block_size {
            return Err(StorageError::invalid_operation(format!(
                "reserved region of {} bytes does not fit in a {} byte metadata block",
                self.reserved_bytes, self.block_size
            )));
        }
        Ok(())
    }
}

/// B+-tree configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeConfig {
    /// Fanout: maximum entries (leaf) or keys (branch) before a split
    pub max_entries: usize,
    /// Minimum entries a non-root leaf keeps before rebalancing
    pub min_entries: usize,
    /// Whether equal keys may be inserted more than once
    pub allow_duplicates: bool,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

impl TreeConfig {
    /// Create a unique-key config with the given fanout
    pub fn new(max_entries: usize) -> Self {
        let max_entries = max_entries.max(MIN_FANOUT);
        Self {
            max_entries,
            min_entries: max_entries.div_ceil(2),
            allow_duplicates: false,
        }
    }

    /// Allow or forbid duplicate keys
    pub fn allow_duplicates(mut self, allow: bool) -> Self {
        self.allow_duplicates = allow;
        self
    }

    /// Override the leaf occupancy floor
    pub fn min_entries(mut self, min: usize) -> Self {
        self.min_entries = min;
        self
    }

    /// Occupancy floor for branch nodes (counted in keys)
    pub fn min_branch_keys(&self) -> usize {
        self.min_entries.min(self.max_entries / 2).max(1)
    }

    /// Check that split and merge stay within bounds for this config
    pub fn validate(&self) -> Result<()> {
        if self.max_entries < MIN_FANOUT {
            return Err(StorageError::invalid_operation(format!(
                "max_entries must be at least {}, got {}",
                MIN_FANOUT, self.max_entries
            )));
        }
        let ceiling = self.max_entries.div_ceil(2);
        if self.min_entries == 0 || self.min_entries > ceiling {
            return Err(StorageError::invalid_operation(format!(
                "min_entries must be in 1..={} for max_entries {}, got {}",
                ceiling, self.max_entries, self.min_entries
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_config_validation() {
        assert!(BlockStoreConfig::default().validate().is_ok());
        assert!(BlockStoreConfig::new(1000, 0).validate().is_err());
        assert!(BlockStoreConfig::new(128, 0).validate().is_err());
        assert!(BlockStoreConfig::new(256, 256).validate().is_err());
        assert_eq!(BlockStoreConfig::new(512, 16).content_capacity(), 480);
    }

    #[test]
    fn test_tree_config_defaults() {
        let config = TreeConfig::new(4);
        assert_eq!(config.min_entries, 2);
        assert_eq!(config.min_branch_keys(), 2);
        assert!(config.validate().is_ok());

        let config = TreeConfig::new(3);
        assert_eq!(config.min_entries, 2);
        assert_eq!(config.min_branch_keys(), 1);

        // Clamped to the smallest fanout
        assert_eq!(TreeConfig::new(1).max_entries, MIN_FANOUT);
    }

    #[test]
    fn test_tree_config_rejects_high_floor() {
        assert!(TreeConfig::new(4).min_entries(3).validate().is_err());
        assert!(TreeConfig::new(4).min_entries(0).validate().is_err());
        assert!(TreeConfig::new(4).min_entries(1).validate().is_ok());
    }

    #[test]
    fn test_tree_config_json() {
        let config = TreeConfig::new(8).allow_duplicates(true);
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"allowDuplicates\":true"));
        let back: TreeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
