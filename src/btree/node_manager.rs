//! Persistence of tree nodes.
//!
//! The tree talks to its nodes through the `NodeStore` trait; the disk
//! implementation keeps one record per node in a record store and the
//! root pointer in the store's reserved region.

use crate::btree::node::Node;
use crate::btree::serializer::Serializer;
use crate::buffer::{CacheStats, NodeCache};
use crate::error::{Result, StorageError};
use crate::storage::{Container, RecordStore};
use crate::types::{NodeId, TREE_METADATA_SIZE};
use std::marker::PhantomData;

/// Default number of decoded nodes kept in memory
pub const DEFAULT_NODE_CACHE: usize = 256;

/// Flag bit: the tree accepts duplicate keys
const FLAG_DUPLICATES: u64 = 1;

/// Persisted location of the root, with the tree's key mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootPointer {
    pub id: NodeId,
    pub height: usize,
    pub allow_duplicates: bool,
}

/// Trait for node persistence
pub trait NodeStore<K, V> {
    /// Persist a new node and return its id
    fn create_node(&mut self, node: &Node<K, V>) -> Result<NodeId>;

    /// Overwrite an existing node
    fn update_node(&mut self, id: NodeId, node: &Node<K, V>) -> Result<()>;

    /// Load a node; a missing node is corruption
    fn find_node(&mut self, id: NodeId) -> Result<Node<K, V>>;

    /// Remove a node
    fn delete_node(&mut self, id: NodeId) -> Result<()>;

    /// The persisted root, if a tree has been created
    fn root(&mut self) -> Result<Option<RootPointer>>;

    /// Persist a new root
    fn set_root(&mut self, root: RootPointer) -> Result<()>;

    /// Flush to durable storage
    fn sync(&mut self) -> Result<()>;
}

/// Node store backed by a record store
pub struct DiskNodeManager<K, V, KS, VS, C: Container> {
    records: RecordStore<C>,
    key_serializer: KS,
    value_serializer: VS,
    cache: NodeCache<Node<K, V>>,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V, KS, VS, C> DiskNodeManager<K, V, KS, VS, C>
where
    K: Clone,
    V: Clone,
    KS: Serializer<K>,
    VS: Serializer<V>,
    C: Container,
{
    /// Create a manager over `records`.
    ///
    /// The record store's reserved region must have room for the root pointer.
    pub fn new(records: RecordStore<C>, key_serializer: KS, value_serializer: VS) -> Result<Self> {
        let reserved = records.block_store().config().reserved_bytes;
        if reserved < TREE_METADATA_SIZE {
            return Err(StorageError::invalid_operation(format!(
                "tree needs {} reserved bytes, store has {}",
                TREE_METADATA_SIZE, reserved
            )));
        }

        Ok(Self {
            records,
            key_serializer,
            value_serializer,
            cache: NodeCache::new(DEFAULT_NODE_CACHE),
            _marker: PhantomData,
        })
    }

    /// Replace the node cache with one of `capacity` nodes (0 disables it)
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache = NodeCache::new(capacity);
        self
    }

    /// Cache counters
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// The underlying record store
    pub fn records(&self) -> &RecordStore<C> {
        &self.records
    }

    /// Give back the record store
    pub fn into_inner(self) -> RecordStore<C> {
        self.records
    }

    fn encode(&self, node: &Node<K, V>) -> Result<Vec<u8>> {
        node.encode(&self.key_serializer, &self.value_serializer)
    }
}

impl<K, V, KS, VS, C> NodeStore<K, V> for DiskNodeManager<K, V, KS, VS, C>
where
    K: Clone,
    V: Clone,
    KS: Serializer<K>,
    VS: Serializer<V>,
    C: Container,
{
    fn create_node(&mut self, node: &Node<K, V>) -> Result<NodeId> {
        let bytes = self.encode(node)?;
        let id = self.records.create(&bytes)?;
        self.cache.put(id, node.clone());
        Ok(id)
    }

    fn update_node(&mut self, id: NodeId, node: &Node<K, V>) -> Result<()> {
        let bytes = self.encode(node)?;
        self.records.update(id, &bytes)?;
        self.cache.put(id, node.clone());
        Ok(())
    }

    fn find_node(&mut self, id: NodeId) -> Result<Node<K, V>> {
        if let Some(node) = self.cache.get(id) {
            return Ok(node);
        }

        let bytes = self
            .records
            .find(id)?
            .ok_or_else(|| StorageError::corruption(format!("tree node {} does not exist", id)))?;
        let node = Node::decode(id, &bytes, &self.key_serializer, &self.value_serializer)?;
        self.cache.put(id, node.clone());
        Ok(node)
    }

    fn delete_node(&mut self, id: NodeId) -> Result<()> {
        self.cache.remove(id);
        self.records.delete(id)
    }

    fn root(&mut self) -> Result<Option<RootPointer>> {
        let mut buf = [0u8; TREE_METADATA_SIZE];
        self.records.read_reserved(0, &mut buf)?;

        let mut raw = [0u8; 8];
        raw.copy_from_slice(&buf[0..8]);
        let id = u64::from_le_bytes(raw);
        raw.copy_from_slice(&buf[8..16]);
        let height = u64::from_le_bytes(raw);
        raw.copy_from_slice(&buf[16..24]);
        let flags = u64::from_le_bytes(raw);

        if id == 0 {
            return Ok(None);
        }
        let height = usize::try_from(height)
            .ok()
            .filter(|&h| h >= 1)
            .ok_or_else(|| {
                StorageError::corruption(format!("implausible tree height {}", height))
            })?;

        if flags & !FLAG_DUPLICATES != 0 {
            return Err(StorageError::corruption(format!("unknown tree flags {:#x}", flags)));
        }

        Ok(Some(RootPointer {
            id: NodeId::new(id),
            height,
            allow_duplicates: flags & FLAG_DUPLICATES != 0,
        }))
    }

    fn set_root(&mut self, root: RootPointer) -> Result<()> {
        let mut buf = [0u8; TREE_METADATA_SIZE];
        buf[0..8].copy_from_slice(&root.id.value().to_le_bytes());
        buf[8..16].copy_from_slice(&(root.height as u64).to_le_bytes());
        let flags = if root.allow_duplicates { FLAG_DUPLICATES } else { 0 };
        buf[16..24].copy_from_slice(&flags.to_le_bytes());
        self.records.write_reserved(0, &buf)
    }

    fn sync(&mut self) -> Result<()> {
        self.records.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::node::{BranchNode, LeafNode};
    use crate::btree::serializer::{RecordIdSerializer, U64Serializer};
    use crate::storage::MemoryContainer;
    use crate::types::{BlockId, BlockStoreConfig, BLOCK_HEADER_SIZE};

    type Manager =
        DiskNodeManager<u64, BlockId, U64Serializer, RecordIdSerializer, MemoryContainer>;

    fn manager(cache: usize) -> Result<Manager> {
        let records = RecordStore::open(MemoryContainer::new(), BlockStoreConfig::new(256, 24))?;
        let nodes = DiskNodeManager::new(records, U64Serializer, RecordIdSerializer)?;
        Ok(nodes.with_cache_capacity(cache))
    }

    fn leaf(keys: &[u64]) -> Node<u64, BlockId> {
        Node::Leaf(LeafNode {
            entries: keys.iter().map(|&k| (k, BlockId::new(k + 100))).collect(),
            prev: None,
            next: None,
        })
    }

    #[test]
    fn test_node_lifecycle_uncached() -> Result<()> {
        let mut nodes = manager(0)?;

        let id = nodes.create_node(&leaf(&[1, 2, 3]))?;
        assert_eq!(nodes.find_node(id)?, leaf(&[1, 2, 3]));

        // Large enough to span several blocks
        let big: Vec<u64> = (0..100).collect();
        nodes.update_node(id, &leaf(&big))?;
        assert_eq!(nodes.find_node(id)?, leaf(&big));

        nodes.delete_node(id)?;
        assert!(nodes.find_node(id).unwrap_err().is_corruption());
        Ok(())
    }

    #[test]
    fn test_cache_serves_repeat_reads() -> Result<()> {
        let mut nodes = manager(8)?;
        let branch = Node::Branch(BranchNode {
            keys: vec![5],
            children: vec![BlockId::new(1), BlockId::new(2)],
        });
        let id = nodes.create_node(&branch)?;

        assert_eq!(nodes.find_node(id)?, branch);
        assert_eq!(nodes.find_node(id)?, branch);
        assert_eq!(nodes.cache_stats().hits, 2);
        assert_eq!(nodes.cache_stats().misses, 0);
        Ok(())
    }

    #[test]
    fn test_root_pointer() -> Result<()> {
        let mut nodes = manager(0)?;
        assert_eq!(nodes.root()?, None);

        let root = RootPointer {
            id: NodeId::new(4),
            height: 3,
            allow_duplicates: true,
        };
        nodes.set_root(root)?;
        assert_eq!(nodes.root()?, Some(root));
        Ok(())
    }

    #[test]
    fn test_flipped_byte_is_corruption() -> Result<()> {
        let mut nodes = manager(0)?;
        let id = nodes.create_node(&leaf(&[1, 2, 3]))?;
        let mut container = nodes.into_inner().into_inner().into_inner();

        // First key of the leaf: tag, count, prev and next come before it
        let offset = id.value() as usize * 256 + BLOCK_HEADER_SIZE + 21;
        container.as_bytes_mut()[offset] ^= 0xFF;

        let records = RecordStore::open(container, BlockStoreConfig::new(256, 24))?;
        let mut nodes: Manager = DiskNodeManager::new(records, U64Serializer, RecordIdSerializer)?;
        assert!(nodes.find_node(id).unwrap_err().is_corruption());
        Ok(())
    }

    #[test]
    fn test_requires_reserved_space() -> Result<()> {
        let records = RecordStore::open(MemoryContainer::new(), BlockStoreConfig::new(256, 16))?;
        assert!(matches!(
            DiskNodeManager::<u64, BlockId, _, _, _>::new(
                records,
                U64Serializer,
                RecordIdSerializer,
            ),
            Err(StorageError::InvalidOperation(_))
        ));
        Ok(())
    }
}
