//! Block identifier type.

use std::fmt;

/// Index of a block within a container.
///
/// Block 0 is the metadata block and doubles as the "no block" terminator
/// in chain and free-list links. Data blocks start at 1. A record is named
/// by the id of its first block, and a tree node by the id of its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct BlockId(pub u64);

/// Records are addressed by the id of their head block
pub type RecordId = BlockId;

/// Tree nodes are addressed by the id of the record holding them
pub type NodeId = BlockId;

impl BlockId {
    /// Terminator for chain and free-list links
    pub const NONE: BlockId = BlockId(0);

    /// Create a new block id
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw id value
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Whether this id names a data block rather than the terminator
    pub const fn is_some(self) -> bool {
        self.0 != 0
    }

    /// Convert a raw link field into an optional id
    pub const fn from_link(raw: u64) -> Option<Self> {
        if raw == 0 {
            None
        } else {
            Some(Self(raw))
        }
    }

    /// Convert an optional id into a raw link field
    pub fn to_link(id: Option<Self>) -> u64 {
        id.map_or(0, |id| id.0)
    }

    /// Byte offset of this block in the container
    pub const fn file_offset(self, block_size: usize) -> u64 {
        self.0 * block_size as u64
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u64> for BlockId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<BlockId> for u64 {
    fn from(id: BlockId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_links() {
        assert_eq!(BlockId::from_link(0), None);
        assert_eq!(BlockId::from_link(7), Some(BlockId::new(7)));
        assert_eq!(BlockId::to_link(None), 0);
        assert_eq!(BlockId::to_link(Some(BlockId::new(9))), 9);
        assert!(!BlockId::NONE.is_some());
    }

    #[test]
    fn test_file_offset() {
        assert_eq!(BlockId::new(3).file_offset(4096), 3 * 4096);
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", BlockId::new(42)), "#42");
    }
}
