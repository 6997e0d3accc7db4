//! On-disk headers.
//!
//! Block 0 of every container starts with the store header, followed by
//! the caller-defined reserved region. Every data block starts with a
//! block header that links it into a record chain or the free list.

use crate::error::{Result, StorageError};
use crate::types::{BlockId, BLOCK_HEADER_SIZE, STORE_HEADER_SIZE};

/// Magic bytes identifying a block store container
pub const MAGIC: &[u8; 4] = b"TBS1";

/// Store header at the start of block 0
///
/// Layout:
/// ```text
/// Offset  Size  Description
/// 0       4     Magic "TBS1"
/// 4       4     Block size
/// 8       8     Free-list head block id (0 if empty)
/// 16      8     Number of blocks on the free list
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreHeader {
    /// Block size in bytes
    pub block_size: u32,
    /// First block on the free list
    pub free_head: Option<BlockId>,
    /// Number of blocks on the free list
    pub free_count: u64,
}

impl StoreHeader {
    /// Create a header for an empty store
    pub fn new(block_size: u32) -> Self {
        Self {
            block_size,
            free_head: None,
            free_count: 0,
        }
    }

    /// Read a store header from bytes
    pub fn read(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < STORE_HEADER_SIZE {
            return Err(StorageError::invalid_container("store header too short"));
        }

        if &bytes[0..4] != MAGIC {
            return Err(StorageError::invalid_container("invalid magic bytes"));
        }

        Ok(Self {
            block_size: read_u32(bytes, 4),
            free_head: BlockId::from_link(read_u64(bytes, 8)),
            free_count: read_u64(bytes, 16),
        })
    }

    /// Write this header to bytes
    pub fn write(&self, bytes: &mut [u8]) {
        bytes[0..4].copy_from_slice(MAGIC);
        bytes[4..8].copy_from_slice(&self.block_size.to_le_bytes());
        bytes[8..16].copy_from_slice(&BlockId::to_link(self.free_head).to_le_bytes());
        bytes[16..24].copy_from_slice(&self.free_count.to_le_bytes());
    }
}

/// What a data block currently holds
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// On the free list, or never written
    Free = 0,
    /// First block of a record
    Head = 1,
    /// Any later block of a record
    Continuation = 2,
    /// Handed out by the allocator but not yet part of a record
    Allocated = 3,
}

impl BlockKind {
    /// Convert from byte value
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Free),
            1 => Some(Self::Head),
            2 => Some(Self::Continuation),
            3 => Some(Self::Allocated),
            _ => None,
        }
    }
}

/// Individually addressable header fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderField {
    /// Next block in the chain or free list
    Next,
    /// Previous block in the chain
    Previous,
    /// Payload bytes used in this block
    ContentLength,
    /// Total record length (head block only)
    RecordLength,
}

impl HeaderField {
    /// Byte offset and width within the header
    pub(crate) fn span(self) -> (usize, usize) {
        match self {
            Self::Next => (0, 8),
            Self::Previous => (8, 8),
            Self::ContentLength => (16, 4),
            Self::RecordLength => (20, 4),
        }
    }
}

/// Per-block header
///
/// Layout:
/// ```text
/// Offset  Size  Description
/// 0       8     Next block id (0 terminates)
/// 8       8     Previous block id (0 for a chain head)
/// 16      4     Content length in this block
/// 20      4     Total record length (head block only)
/// 24      1     Block kind
/// 25      7     Zero padding
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub next: Option<BlockId>,
    pub previous: Option<BlockId>,
    pub content_length: u32,
    pub record_length: u32,
    pub kind: BlockKind,
}

impl Default for BlockHeader {
    fn default() -> Self {
        Self {
            next: None,
            previous: None,
            content_length: 0,
            record_length: 0,
            kind: BlockKind::Free,
        }
    }
}

impl BlockHeader {
    /// Decode a header; an unknown kind byte is corruption
    pub fn read(id: BlockId, bytes: &[u8; BLOCK_HEADER_SIZE]) -> Result<Self> {
        let kind = BlockKind::from_byte(bytes[24]).ok_or_else(|| {
            StorageError::corruption(format!("block {} has unknown kind {}", id, bytes[24]))
        })?;

        Ok(Self {
            next: BlockId::from_link(read_u64(bytes, 0)),
            previous: BlockId::from_link(read_u64(bytes, 8)),
            content_length: read_u32(bytes, 16),
            record_length: read_u32(bytes, 20),
            kind,
        })
    }

    /// Encode this header
    pub fn to_bytes(&self) -> [u8; BLOCK_HEADER_SIZE] {
        let mut bytes = [0u8; BLOCK_HEADER_SIZE];
        bytes[0..8].copy_from_slice(&BlockId::to_link(self.next).to_le_bytes());
        bytes[8..16].copy_from_slice(&BlockId::to_link(self.previous).to_le_bytes());
        bytes[16..20].copy_from_slice(&self.content_length.to_le_bytes());
        bytes[20..24].copy_from_slice(&self.record_length.to_le_bytes());
        bytes[24] = self.kind as u8;
        bytes
    }
}

pub(crate) fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(raw)
}

pub(crate) fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}
