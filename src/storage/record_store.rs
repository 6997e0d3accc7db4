//! Variable-length records as chains of blocks.
//!
//! A record is stored in as many blocks as its length needs. The head
//! block carries the total length; every block carries its own content
//! length plus next/previous links. The head block id is the record id
//! and never changes for the life of the record.

use crate::error::{Result, StorageError};
use crate::storage::header::{BlockHeader, BlockKind};
use crate::storage::{BlockStore, Container};
use crate::types::{BlockId, BlockStoreConfig, RecordId};

/// Record manager on top of a block store
pub struct RecordStore<C: Container> {
    blocks: BlockStore<C>,
}

impl<C: Container> RecordStore<C> {
    /// Wrap an open block store
    pub fn new(blocks: BlockStore<C>) -> Self {
        Self { blocks }
    }

    /// Open a block store over `container` and wrap it
    pub fn open(container: C, config: BlockStoreConfig) -> Result<Self> {
        Ok(Self::new(BlockStore::open(container, config)?))
    }

    /// The underlying block store
    pub fn block_store(&self) -> &BlockStore<C> {
        &self.blocks
    }

    /// Mutable access to the underlying block store
    pub fn block_store_mut(&mut self) -> &mut BlockStore<C> {
        &mut self.blocks
    }

    /// Number of blocks a record of `len` bytes occupies
    pub fn blocks_needed(&self, len: usize) -> usize {
        len.div_ceil(self.blocks.content_capacity()).max(1)
    }

    fn check_len(data: &[u8]) -> Result<u32> {
        u32::try_from(data.len()).map_err(|_| {
            StorageError::invalid_operation(format!("record of {} bytes is too large", data.len()))
        })
    }

    /// Store `data` as a new record and return its id
    pub fn create(&mut self, data: &[u8]) -> Result<RecordId> {
        Self::check_len(data)?;
        let needed = self.blocks_needed(data.len());

        let mut ids = Vec::with_capacity(needed);
        for _ in 0..needed {
            match self.blocks.allocate() {
                Ok(id) => ids.push(id),
                Err(e) => {
                    self.release(&ids);
                    return Err(e);
                }
            }
        }

        if let Err(e) = self.write_chain(&ids, data) {
            self.release(&ids);
            return Err(e);
        }
        tracing::debug!(record = %ids[0], len = data.len(), blocks = needed, "created record");
        Ok(ids[0])
    }

    /// Read a record, or `None` if `id` is not a live record head
    pub fn find(&mut self, id: RecordId) -> Result<Option<Vec<u8>>> {
        let Some(head) = self.head_header(id)? else {
            return Ok(None);
        };

        let total = head.record_length as usize;
        let capacity = self.blocks.content_capacity();
        let data_blocks = self.blocks.block_count().saturating_sub(1) as usize;
        let plausible = data_blocks.saturating_mul(capacity);
        if total > plausible {
            return Err(StorageError::corruption(format!(
                "record {} claims {} bytes but the container holds at most {}",
                id, total, plausible
            )));
        }

        let chain = self.walk(id, head)?;
        let mut data = Vec::with_capacity(total);
        let mut buf = vec![0u8; capacity];

        for (block, header) in &chain {
            let len = header.content_length as usize;
            if data.len() + len > total {
                return Err(StorageError::corruption(format!(
                    "record {} chain holds more than its declared {} bytes",
                    id, total
                )));
            }
            self.blocks.read_content(*block, &mut buf[..len])?;
            data.extend_from_slice(&buf[..len]);
        }

        if data.len() != total {
            return Err(StorageError::corruption(format!(
                "record {} declares {} bytes but its chain holds {}",
                id,
                total,
                data.len()
            )));
        }

        Ok(Some(data))
    }

    /// Whether `id` names a live record
    pub fn exists(&mut self, id: RecordId) -> Result<bool> {
        Ok(self.head_header(id)?.is_some())
    }

    /// Replace a record's content, keeping its id.
    ///
    /// Surplus tail blocks are freed; missing ones are allocated and appended.
    pub fn update(&mut self, id: RecordId, data: &[u8]) -> Result<()> {
        Self::check_len(data)?;
        let mut ids = self.record_blocks(id)?;
        let needed = self.blocks_needed(data.len());
        let surplus = if needed < ids.len() {
            ids.split_off(needed)
        } else {
            Vec::new()
        };

        // Blocks from here on are new and go back to the free list on failure
        let kept = ids.len();
        while ids.len() < needed {
            match self.blocks.allocate() {
                Ok(block) => ids.push(block),
                Err(e) => {
                    self.release(&ids[kept..]);
                    return Err(e);
                }
            }
        }

        if let Err(e) = self.write_chain(&ids, data) {
            self.release(&ids[kept..]);
            return Err(e);
        }
        for block in &surplus {
            self.blocks.free(*block)?;
        }

        tracing::debug!(
            record = %id,
            len = data.len(),
            blocks = ids.len(),
            freed = surplus.len(),
            "updated record"
        );
        Ok(())
    }

    /// Free every block of a record
    pub fn delete(&mut self, id: RecordId) -> Result<()> {
        let ids = self.record_blocks(id)?;
        for block in &ids {
            self.blocks.free(*block)?;
        }
        tracing::debug!(record = %id, blocks = ids.len(), "deleted record");
        Ok(())
    }

    /// Block ids of a record's chain, head first
    pub fn record_blocks(&mut self, id: RecordId) -> Result<Vec<BlockId>> {
        let head = self.head_header(id)?.ok_or(StorageError::RecordNotFound(id))?;
        Ok(self.walk(id, head)?.into_iter().map(|(block, _)| block).collect())
    }

    /// Read from the caller-defined reserved region
    pub fn read_reserved(&mut self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.blocks.read_reserved(offset, buf)
    }

    /// Write into the caller-defined reserved region
    pub fn write_reserved(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        self.blocks.write_reserved(offset, data)
    }

    /// Flush the container
    pub fn sync(&mut self) -> Result<()> {
        self.blocks.sync()
    }

    /// Give back the block store
    pub fn into_inner(self) -> BlockStore<C> {
        self.blocks
    }

    fn head_header(&mut self, id: RecordId) -> Result<Option<BlockHeader>> {
        if !self.blocks.contains(id) {
            return Ok(None);
        }
        let header = self.blocks.read_header(id)?;
        Ok((header.kind == BlockKind::Head).then_some(header))
    }

    /// Follow a chain from its head, checking links and block kinds
    fn walk(&mut self, id: RecordId, head: BlockHeader) -> Result<Vec<(BlockId, BlockHeader)>> {
        let capacity = self.blocks.content_capacity();
        let limit = self.blocks.block_count() as usize;
        let mut chain = Vec::new();
        let mut previous = None;
        let mut current = Some((id, head));

        while let Some((block, header)) = current {
            if chain.len() >= limit {
                return Err(StorageError::corruption(format!("cycle in record {} chain", id)));
            }
            if header.previous != previous {
                return Err(StorageError::corruption(format!(
                    "block {} of record {} has a broken back link",
                    block, id
                )));
            }
            if header.content_length as usize > capacity {
                return Err(StorageError::corruption(format!(
                    "block {} content length {} exceeds capacity {}",
                    block, header.content_length, capacity
                )));
            }

            chain.push((block, header));
            previous = Some(block);

            current = match header.next {
                Some(next) => {
                    let next_header = self.blocks.read_header(next)?;
                    if next_header.kind != BlockKind::Continuation {
                        return Err(StorageError::corruption(format!(
                            "record {} links to {:?} block {}",
                            id, next_header.kind, next
                        )));
                    }
                    Some((next, next_header))
                }
                None => None,
            };
        }

        Ok(chain)
    }

    /// Lay `data` out across `ids` in order
    fn write_chain(&mut self, ids: &[BlockId], data: &[u8]) -> Result<()> {
        let capacity = self.blocks.content_capacity();
        let total = Self::check_len(data)?;

        for (i, &id) in ids.iter().enumerate() {
            let start = (i * capacity).min(data.len());
            let end = (start + capacity).min(data.len());
            let chunk = &data[start..end];

            let header = BlockHeader {
                next: ids.get(i + 1).copied(),
                previous: if i == 0 { None } else { Some(ids[i - 1]) },
                content_length: chunk.len() as u32,
                record_length: if i == 0 { total } else { 0 },
                kind: if i == 0 { BlockKind::Head } else { BlockKind::Continuation },
            };
            self.blocks.write_header(id, &header)?;
            self.blocks.write_content(id, chunk)?;
        }

        Ok(())
    }

    /// Best-effort return of blocks allocated by a failed create or update
    fn release(&mut self, ids: &[BlockId]) {
        for &id in ids {
            if let Err(e) = self.blocks.free(id) {
                tracing::warn!(block = %id, error = %e, "failed to release block");
            }
        }
    }
}
