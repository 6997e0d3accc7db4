//! # Tiny Block Storage
//!
//! An embedded single-file storage engine: fixed-size blocks, variable-length
//! records threaded across block chains, and a B+-tree index whose nodes are
//! themselves records.
//!
//! ## Architecture
//!
//! Data flows strictly upward; no layer reaches past the one below it:
//!
//! - **Containers** (`storage::Container`): a seekable byte container, file or memory
//! - **Block Store** (`storage::BlockStore`): block allocation over a LIFO free list
//! - **Record Store** (`storage::RecordStore`): records as doubly linked block chains
//! - **Node Manager** (`btree::DiskNodeManager`): tree nodes as records, with an LRU cache
//! - **B+-Tree** (`btree::Tree`): ordered index with range scans
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tiny_block_storage::{Config, Store};
//!
//! let store = Store::open(Config::new("my_data.tbs"))?;
//!
//! store.put(b"hello", b"world")?;
//! let value = store.get(b"hello")?;
//! store.delete(b"hello")?;
//!
//! for (key, value) in store.range(Some(b"a"), Some(b"z"))? {
//!     println!("{:?} -> {:?}", key, value);
//! }
//! ```

pub mod btree;
pub mod buffer;
pub mod error;
pub mod storage;
pub mod types;

pub use error::{Result, StorageError};
pub use types::{BlockId, BlockStoreConfig, NodeId, RecordId, TreeConfig};

pub use btree::{DiskNodeManager, KeyComparer, NaturalOrder, NodeStore, Serializer, Tree};
pub use storage::{BlockStore, Container, FileContainer, MemoryContainer, RecordStore};

use btree::{BytesSerializer, RecordIdSerializer, TreeSnapshot, TreeStats, DEFAULT_NODE_CACHE};
use buffer::CacheStats;
use parking_lot::Mutex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use types::{DEFAULT_BLOCK_SIZE, DEFAULT_RESERVED_BYTES};

/// Extension appended to the data path for the primary index file
pub const INDEX_EXTENSION: &str = "pidx";

/// Store configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the data file; the index lives next to it
    pub path: PathBuf,
    /// Block size for both files (default: 4096)
    pub block_size: usize,
    /// Index node cache size in nodes (default: 256)
    pub cache_capacity: usize,
    /// Whether to sync writes immediately (default: false for performance)
    pub sync_on_write: bool,
    /// Primary index fanout
    pub tree_config: TreeConfig,
}

impl Config {
    /// Create a new configuration with default settings
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            block_size: DEFAULT_BLOCK_SIZE,
            cache_capacity: DEFAULT_NODE_CACHE,
            sync_on_write: false,
            tree_config: TreeConfig::default(),
        }
    }

    /// Set block size
    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// Set node cache size
    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Enable sync on write for durability
    pub fn sync_on_write(mut self, enabled: bool) -> Self {
        self.sync_on_write = enabled;
        self
    }

    /// Set primary index configuration.
    ///
    /// Duplicate keys are always disabled for the primary index.
    pub fn tree_config(mut self, config: TreeConfig) -> Self {
        self.tree_config = config.allow_duplicates(false);
        self
    }

    /// Path of the primary index file
    pub fn index_path(&self) -> PathBuf {
        index_path(&self.path)
    }
}

fn index_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(INDEX_EXTENSION);
    PathBuf::from(name)
}

type PrimaryNodes =
    DiskNodeManager<Vec<u8>, RecordId, BytesSerializer, RecordIdSerializer, FileContainer>;
type PrimaryIndex = Tree<Vec<u8>, RecordId, PrimaryNodes>;

/// Record store and index, always mutated together
struct Inner {
    records: RecordStore<FileContainer>,
    index: PrimaryIndex,
}

impl Inner {
    fn load(&mut self, key: &[u8], id: RecordId) -> Result<Vec<u8>> {
        self.records.find(id)?.ok_or_else(|| {
            StorageError::corruption(format!(
                "index entry {:?} points at missing record {}",
                String::from_utf8_lossy(key),
                id
            ))
        })
    }

    /// Entries from `start` while `keep` holds for the key
    fn scan(
        &mut self,
        start: Option<&[u8]>,
        keep: impl Fn(&[u8]) -> bool,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let Inner { records, index } = self;
        let cursor = match start {
            Some(start) => index.larger_than_or_equal_to(&start.to_vec())?,
            None => index.all()?,
        };

        let mut out = Vec::new();
        for entry in cursor {
            let (key, id) = entry?;
            if !keep(&key) {
                break;
            }
            let value = records.find(id)?.ok_or_else(|| {
                StorageError::corruption(format!("index points at missing record {}", id))
            })?;
            out.push((key, value));
        }
        Ok(out)
    }
}

/// Keyed record store: a record file plus a unique primary index
///
/// This is the primary public interface for the storage engine. All
/// operations run under one lock, so a multi-step update of records and
/// index is never observed half done by another thread.
pub struct Store {
    inner: Mutex<Inner>,
    config: Config,
}

impl Store {
    /// Open or create a store at the configured path
    pub fn open(config: Config) -> Result<Self> {
        let tree_config = config.tree_config.allow_duplicates(false);
        tree_config.validate()?;

        let data = FileContainer::open(&config.path, config.sync_on_write)?;
        let records = RecordStore::open(data, BlockStoreConfig::new(config.block_size, 0))?;

        let index_file = FileContainer::open(&config.index_path(), config.sync_on_write)?;
        let index_records = RecordStore::open(
            index_file,
            BlockStoreConfig::new(config.block_size, DEFAULT_RESERVED_BYTES),
        )?;
        let nodes = DiskNodeManager::new(index_records, BytesSerializer, RecordIdSerializer)?
            .with_cache_capacity(config.cache_capacity);
        let index = Tree::open(nodes, tree_config)?;

        tracing::debug!(
            path = %config.path.display(),
            height = index.height(),
            "store opened"
        );

        Ok(Self {
            inner: Mutex::new(Inner { records, index }),
            config,
        })
    }

    /// Store configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get a value by key
    ///
    /// Returns `None` if the key does not exist.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut inner = self.inner.lock();
        match inner.index.get(&key.to_vec())? {
            Some(id) => inner.load(key, id).map(Some),
            None => Ok(None),
        }
    }

    /// Insert or update a key-value pair.
    ///
    /// An update rewrites the existing record in place, keeping its id.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        let key = key.to_vec();

        if let Some(id) = inner.index.get(&key)? {
            return inner.records.update(id, value);
        }

        let id = inner.records.create(value)?;
        if let Err(err) = inner.index.insert(key, id) {
            inner.records.delete(id)?;
            return Err(err);
        }
        Ok(())
    }

    /// Delete a key-value pair
    ///
    /// Returns `true` if the key existed and was deleted.
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        let mut inner = self.inner.lock();
        let key = key.to_vec();

        let Some(id) = inner.index.get(&key)? else {
            return Ok(false);
        };
        inner.index.delete(&key)?;
        inner.records.delete(id)?;
        Ok(true)
    }

    /// Check if a key exists
    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        self.inner.lock().index.contains(&key.to_vec())
    }

    /// Key-value pairs with `start <= key < end`, ascending
    ///
    /// Both bounds are optional; `None` means unbounded on that side.
    pub fn range(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.inner
            .lock()
            .scan(start, |key| end.map_or(true, |end| key < end))
    }

    /// Key-value pairs whose key starts with `prefix`, ascending
    pub fn prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.inner
            .lock()
            .scan(Some(prefix), |key| key.starts_with(prefix))
    }

    /// Every key-value pair, ascending
    pub fn iter(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.range(None, None)
    }

    /// Flush both files to disk
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.records.sync()?;
        inner.index.sync()
    }

    /// Flush both files and release their locks
    pub fn close(self) -> Result<()> {
        let Inner { records, index } = self.inner.into_inner();
        records.into_inner().into_inner().close()?;
        index.into_store().into_inner().into_inner().into_inner().close()?;
        tracing::debug!(path = %self.config.path.display(), "store closed");
        Ok(())
    }

    /// Get statistics about the store
    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.lock();
        let data = inner.records.block_store();
        let index = inner.index.store().records().block_store();

        StoreStats {
            data_blocks: data.block_count(),
            data_free_blocks: data.free_count(),
            index_blocks: index.block_count(),
            index_free_blocks: index.free_count(),
            block_size: data.config().block_size,
            tree_height: inner.index.height(),
            cache: inner.index.store().cache_stats(),
        }
    }

    /// Check index structure, record chains and block accounting.
    ///
    /// Every data block must be either on the free list or in exactly one
    /// record chain reachable from the index.
    pub fn verify(&self) -> Result<TreeStats> {
        let mut guard = self.inner.lock();
        let Inner { records, index } = &mut *guard;

        let stats = index.verify()?;

        let mut used = 0u64;
        for entry in index.all()? {
            let (key, id) = entry?;
            let chain = records.record_blocks(id).map_err(|err| match err {
                StorageError::RecordNotFound(_) => StorageError::corruption(format!(
                    "index entry {:?} points at missing record {}",
                    String::from_utf8_lossy(&key),
                    id
                )),
                other => other,
            })?;
            used += chain.len() as u64;
        }

        let blocks = records.block_store_mut();
        let free = blocks.free_blocks()?.len() as u64;
        // Block 0 holds metadata
        let data_blocks = blocks.block_count().saturating_sub(1);
        if used + free != data_blocks {
            return Err(StorageError::corruption(format!(
                "{} blocks in records and {} free, but the file has {}",
                used, free, data_blocks
            )));
        }

        Ok(stats)
    }

    /// Export the index structure for inspection
    pub fn snapshot(&self) -> Result<TreeSnapshot> {
        self.inner.lock().index.snapshot()
    }
}

/// Store statistics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    /// Blocks in the data file, metadata block included
    pub data_blocks: u64,
    pub data_free_blocks: u64,
    /// Blocks in the index file, metadata block included
    pub index_blocks: u64,
    pub index_free_blocks: u64,
    pub block_size: usize,
    /// Height of the primary index
    pub tree_height: usize,
    pub cache: CacheStats,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn small_config(path: &Path) -> Config {
        Config::new(path).block_size(256).tree_config(TreeConfig::new(4))
    }

    #[test]
    fn test_basic_operations() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.tbs");
        let store = Store::open(Config::new(&path))?;

        // Test put and get
        store.put(b"key1", b"value1")?;
        assert_eq!(store.get(b"key1")?, Some(b"value1".to_vec()));

        // Test update
        store.put(b"key1", b"value2")?;
        assert_eq!(store.get(b"key1")?, Some(b"value2".to_vec()));

        // Test delete
        assert!(store.delete(b"key1")?);
        assert_eq!(store.get(b"key1")?, None);

        // Test non-existent key
        assert_eq!(store.get(b"nonexistent")?, None);
        assert!(!store.delete(b"nonexistent")?);
        assert!(!store.contains(b"nonexistent")?);

        Ok(())
    }

    #[test]
    fn test_range_and_prefix() -> Result<()> {
        let dir = tempdir().unwrap();
        let store = Store::open(small_config(&dir.path().join("test.tbs")))?;

        store.put(b"apple", b"1")?;
        store.put(b"banana", b"2")?;
        store.put(b"blueberry", b"3")?;
        store.put(b"cherry", b"4")?;
        store.put(b"date", b"5")?;

        assert_eq!(store.iter()?.len(), 5);

        let range = store.range(Some(b"banana"), Some(b"date"))?;
        let keys: Vec<&[u8]> = range.iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(keys, vec![&b"banana"[..], b"blueberry", b"cherry"]);

        let prefixed = store.prefix(b"b")?;
        assert_eq!(prefixed.len(), 2);
        assert_eq!(prefixed[1], (b"blueberry".to_vec(), b"3".to_vec()));

        assert!(store.prefix(b"z")?.is_empty());
        Ok(())
    }

    #[test]
    fn test_update_keeps_record_id() -> Result<()> {
        let dir = tempdir().unwrap();
        let store = Store::open(small_config(&dir.path().join("test.tbs")))?;

        store.put(b"k", b"short")?;
        let id = store.inner.lock().index.get(&b"k".to_vec())?;

        let long = vec![7u8; 2000];
        store.put(b"k", &long)?;
        assert_eq!(store.inner.lock().index.get(&b"k".to_vec())?, id);
        assert_eq!(store.get(b"k")?, Some(long));

        store.put(b"k", b"tiny")?;
        assert_eq!(store.get(b"k")?, Some(b"tiny".to_vec()));
        store.verify()?;
        Ok(())
    }

    #[test]
    fn test_reopen_persists() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.tbs");

        {
            let store = Store::open(small_config(&path))?;
            for i in 0..100u32 {
                store.put(format!("key{:03}", i).as_bytes(), &i.to_le_bytes())?;
            }
            store.flush()?;
        }

        let store = Store::open(small_config(&path))?;
        assert!(store.stats().tree_height > 1);
        assert_eq!(store.get(b"key042")?, Some(42u32.to_le_bytes().to_vec()));
        assert_eq!(store.iter()?.len(), 100);
        assert_eq!(store.verify()?.entry_count, 100);
        Ok(())
    }

    #[test]
    fn test_second_open_is_locked() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.tbs");

        let _store = Store::open(Config::new(&path))?;
        assert!(matches!(
            Store::open(Config::new(&path)),
            Err(StorageError::Locked(_))
        ));
        Ok(())
    }

    #[test]
    fn test_close_releases_lock() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.tbs");

        let store = Store::open(small_config(&path))?;
        for i in 0..50u32 {
            store.put(format!("key{:03}", i).as_bytes(), &i.to_le_bytes())?;
        }
        store.close()?;

        let store = Store::open(small_config(&path))?;
        assert_eq!(store.get(b"key007")?, Some(7u32.to_le_bytes().to_vec()));
        assert_eq!(store.verify()?.entry_count, 50);
        store.close()
    }

    #[test]
    fn test_block_size_mismatch_rejected() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.tbs");

        {
            let store = Store::open(Config::new(&path).block_size(512))?;
            store.put(b"a", b"b")?;
        }
        assert!(matches!(
            Store::open(Config::new(&path).block_size(1024)),
            Err(StorageError::InvalidContainer(_))
        ));
        Ok(())
    }

    #[test]
    fn test_delete_frees_blocks_for_reuse() -> Result<()> {
        let dir = tempdir().unwrap();
        let store = Store::open(small_config(&dir.path().join("test.tbs")))?;

        store.put(b"big", &vec![1u8; 1500])?;
        let grown = store.stats().data_blocks;
        store.delete(b"big")?;
        assert!(store.stats().data_free_blocks > 0);

        store.put(b"again", &vec![2u8; 1500])?;
        assert_eq!(store.stats().data_blocks, grown);
        store.verify()?;
        Ok(())
    }

    #[test]
    fn test_stats_serialize() -> Result<()> {
        let dir = tempdir().unwrap();
        let store = Store::open(Config::new(dir.path().join("test.tbs")))?;
        store.put(b"a", b"1")?;

        let json = serde_json::to_value(store.stats()).unwrap();
        assert_eq!(json["treeHeight"], 1);
        assert_eq!(json["blockSize"], 4096);
        Ok(())
    }
}
