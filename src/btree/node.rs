//! Tree nodes and their record encoding.
//!
//! Record layout:
//! ```text
//! Offset  Size  Description
//! 0       1     Tag: 1 = leaf, 2 = branch
//! 1       4     Entry count (leaf) or key count (branch)
//! leaf:
//! 5       8     Previous leaf id (0 if none)
//! 13      8     Next leaf id (0 if none)
//! 21      ..    Entries: key, value
//! branch:
//! 5       ..    Keys, then count + 1 child ids (8 bytes each)
//! end-4   4     CRC32 of everything before it
//! ```
//! Variable-size keys and values carry a varint length prefix.

use crate::btree::serializer::Serializer;
use crate::error::{Result, StorageError};
use crate::types::{put_varint, read_varint, BlockId, NodeId};

const TAG_LEAF: u8 = 1;
const TAG_BRANCH: u8 = 2;
const CHECKSUM_SIZE: usize = 4;

/// A B+-tree node
#[derive(Debug, Clone, PartialEq)]
pub enum Node<K, V> {
    Leaf(LeafNode<K, V>),
    Branch(BranchNode<K>),
}

/// Ordered entries plus links to the neighbouring leaves
#[derive(Debug, Clone, PartialEq)]
pub struct LeafNode<K, V> {
    pub entries: Vec<(K, V)>,
    pub prev: Option<NodeId>,
    pub next: Option<NodeId>,
}

/// Ordered separator keys with one more child than keys.
///
/// Child `i` holds keys between `keys[i - 1]` and `keys[i]`.
#[derive(Debug, Clone, PartialEq)]
pub struct BranchNode<K> {
    pub keys: Vec<K>,
    pub children: Vec<NodeId>,
}

impl<K, V> LeafNode<K, V> {
    /// An empty leaf with no neighbours
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
            prev: None,
            next: None,
        }
    }
}

impl<K, V> Node<K, V> {
    /// Whether this is a leaf
    pub fn is_leaf(&self) -> bool {
        matches!(self, Self::Leaf(_))
    }

    /// Entries in a leaf, keys in a branch
    pub fn len(&self) -> usize {
        match self {
            Self::Leaf(leaf) => leaf.entries.len(),
            Self::Branch(branch) => branch.keys.len(),
        }
    }

    /// Whether the node holds no entries or keys
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Encode into a record
    pub fn encode<KS, VS>(&self, keys: &KS, values: &VS) -> Result<Vec<u8>>
    where
        KS: Serializer<K>,
        VS: Serializer<V>,
    {
        let mut buf = Vec::new();

        match self {
            Self::Leaf(leaf) => {
                buf.push(TAG_LEAF);
                buf.extend_from_slice(&count_u32(leaf.entries.len())?.to_le_bytes());
                buf.extend_from_slice(&BlockId::to_link(leaf.prev).to_le_bytes());
                buf.extend_from_slice(&BlockId::to_link(leaf.next).to_le_bytes());
                for (key, value) in &leaf.entries {
                    let key = keys
                        .serialize(key)
                        .map_err(|e| StorageError::serialization("encode leaf key", e))?;
                    put_item(&mut buf, &key, keys.fixed_size(), "key")?;
                    let value = values
                        .serialize(value)
                        .map_err(|e| StorageError::serialization("encode leaf value", e))?;
                    put_item(&mut buf, &value, values.fixed_size(), "value")?;
                }
            }
            Self::Branch(branch) => {
                if branch.children.len() != branch.keys.len() + 1 {
                    return Err(StorageError::corruption(format!(
                        "branch with {} keys has {} children",
                        branch.keys.len(),
                        branch.children.len()
                    )));
                }
                buf.push(TAG_BRANCH);
                buf.extend_from_slice(&count_u32(branch.keys.len())?.to_le_bytes());
                for key in &branch.keys {
                    let key = keys
                        .serialize(key)
                        .map_err(|e| StorageError::serialization("encode branch key", e))?;
                    put_item(&mut buf, &key, keys.fixed_size(), "key")?;
                }
                for child in &branch.children {
                    buf.extend_from_slice(&child.value().to_le_bytes());
                }
            }
        }

        let checksum = crc32fast::hash(&buf);
        buf.extend_from_slice(&checksum.to_le_bytes());
        Ok(buf)
    }

    /// Decode a record written by `encode`
    pub fn decode<KS, VS>(id: NodeId, bytes: &[u8], keys: &KS, values: &VS) -> Result<Self>
    where
        KS: Serializer<K>,
        VS: Serializer<V>,
    {
        if bytes.len() < 1 + 4 + CHECKSUM_SIZE {
            return Err(StorageError::corruption(format!(
                "node {} record is only {} bytes",
                id,
                bytes.len()
            )));
        }

        let (body, trailer) = bytes.split_at(bytes.len() - CHECKSUM_SIZE);
        let mut stored = [0u8; CHECKSUM_SIZE];
        stored.copy_from_slice(trailer);
        if u32::from_le_bytes(stored) != crc32fast::hash(body) {
            return Err(StorageError::corruption(format!("node {} checksum mismatch", id)));
        }

        let mut reader = Reader::new(id, body);
        let tag = reader.u8()?;
        let count = reader.u32()? as usize;

        let node = match tag {
            TAG_LEAF => {
                let prev = BlockId::from_link(reader.u64()?);
                let next = BlockId::from_link(reader.u64()?);
                let min_entry =
                    min_item_size(keys.fixed_size()) + min_item_size(values.fixed_size());
                reader.check_count(count, min_entry)?;

                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let key = reader.item(keys.fixed_size())?;
                    let key = keys.deserialize(key).map_err(|e| {
                        StorageError::serialization(format!("decode key of node {}", id), e)
                    })?;
                    let value = reader.item(values.fixed_size())?;
                    let value = values.deserialize(value).map_err(|e| {
                        StorageError::serialization(format!("decode value of node {}", id), e)
                    })?;
                    entries.push((key, value));
                }
                Self::Leaf(LeafNode { entries, prev, next })
            }
            TAG_BRANCH => {
                reader.check_count(count, min_item_size(keys.fixed_size()) + 8)?;

                let mut branch_keys = Vec::with_capacity(count);
                for _ in 0..count {
                    let key = reader.item(keys.fixed_size())?;
                    let key = keys.deserialize(key).map_err(|e| {
                        StorageError::serialization(format!("decode key of node {}", id), e)
                    })?;
                    branch_keys.push(key);
                }
                let mut children = Vec::with_capacity(count + 1);
                for _ in 0..=count {
                    let child = reader.u64()?;
                    if child == 0 {
                        return Err(StorageError::corruption(format!(
                            "node {} has a null child",
                            id
                        )));
                    }
                    children.push(BlockId::new(child));
                }
                Self::Branch(BranchNode {
                    keys: branch_keys,
                    children,
                })
            }
            other => {
                return Err(StorageError::corruption(format!(
                    "node {} has unknown tag {}",
                    id, other
                )))
            }
        };

        if !reader.is_done() {
            return Err(StorageError::corruption(format!("node {} has trailing bytes", id)));
        }
        Ok(node)
    }
}

fn count_u32(count: usize) -> Result<u32> {
    u32::try_from(count).map_err(|_| {
        StorageError::invalid_operation(format!("{} entries exceed node limit", count))
    })
}

fn min_item_size(fixed: Option<usize>) -> usize {
    fixed.unwrap_or(1)
}

fn put_item(buf: &mut Vec<u8>, item: &[u8], fixed: Option<usize>, what: &str) -> Result<()> {
    match fixed {
        Some(n) if item.len() != n => Err(StorageError::serialization(
            format!("encode {}", what),
            format!("fixed-size serializer produced {} bytes, expected {}", item.len(), n).into(),
        )),
        Some(_) => {
            buf.extend_from_slice(item);
            Ok(())
        }
        None => {
            put_varint(buf, item.len() as u64);
            buf.extend_from_slice(item);
            Ok(())
        }
    }
}

/// Bounds-checked cursor over a node body
struct Reader<'a> {
    id: NodeId,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(id: NodeId, bytes: &'a [u8]) -> Self {
        Self { id, bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn is_done(&self) -> bool {
        self.pos == self.bytes.len()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(StorageError::corruption(format!(
                "node {} truncated: need {} bytes at offset {}, {} left",
                self.id,
                len,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(raw))
    }

    fn u64(&mut self) -> Result<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(raw))
    }

    fn item(&mut self, fixed: Option<usize>) -> Result<&'a [u8]> {
        let len = match fixed {
            Some(n) => n,
            None => {
                let (len, used) = read_varint(&self.bytes[self.pos..]).ok_or_else(|| {
                    StorageError::corruption(format!("node {} has a bad length prefix", self.id))
                })?;
                self.pos += used;
                usize::try_from(len).map_err(|_| {
                    StorageError::corruption(format!(
                        "node {} item length {} too large",
                        self.id, len
                    ))
                })?
            }
        };
        self.take(len)
    }

    /// Reject counts the remaining bytes cannot possibly hold
    fn check_count(&self, count: usize, min_each: usize) -> Result<()> {
        if count.saturating_mul(min_each.max(1)) > self.remaining() {
            return Err(StorageError::corruption(format!(
                "node {} claims {} items in {} bytes",
                self.id,
                count,
                self.remaining()
            )));
        }
        Ok(())
    }
}
