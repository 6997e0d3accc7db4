//! Fixed-size block allocation over a container.
//!
//! The container is an array of `block_size` blocks. Block 0 holds the
//! store header and the caller's reserved region; blocks 1.. carry data.
//! Freed blocks are threaded into a LIFO free list through their `next`
//! header field, with the head kept in the store header.

use crate::error::{Result, StorageError};
use crate::storage::header::{
    read_u32, read_u64, BlockHeader, BlockKind, HeaderField, StoreHeader,
};
use crate::storage::Container;
use crate::types::{BlockId, BlockStoreConfig, BLOCK_HEADER_SIZE, STORE_HEADER_SIZE};

/// Block allocator over a single container
pub struct BlockStore<C: Container> {
    container: C,
    config: BlockStoreConfig,
    header: StoreHeader,
    /// Number of blocks in the container, metadata block included
    block_count: u64,
}

impl<C: Container> BlockStore<C> {
    /// Open a store, formatting the container if it is empty
    pub fn open(mut container: C, config: BlockStoreConfig) -> Result<Self> {
        config.validate()?;
        let block_size = config.block_size as u64;
        let len = container.len()?;

        let (header, block_count) = if len == 0 {
            let header = StoreHeader::new(config.block_size as u32);
            let mut block = vec![0u8; config.block_size];
            header.write(&mut block);
            container.write_at(0, &block)?;
            tracing::debug!(block_size, "formatted new block store");
            (header, 1)
        } else {
            if len < STORE_HEADER_SIZE as u64 {
                return Err(StorageError::invalid_container("container shorter than store header"));
            }
            let mut buf = [0u8; STORE_HEADER_SIZE];
            container.read_at(0, &mut buf)?;
            let header = StoreHeader::read(&buf)?;

            if header.block_size as usize != config.block_size {
                return Err(StorageError::invalid_container(format!(
                    "block size mismatch: container uses {}, configured {}",
                    header.block_size, config.block_size
                )));
            }
            if len % block_size != 0 {
                return Err(StorageError::corruption(format!(
                    "container length {} is not a multiple of block size {}",
                    len, block_size
                )));
            }
            (header, len / block_size)
        };

        let store = Self {
            container,
            config,
            header,
            block_count,
        };

        if let Some(head) = store.header.free_head {
            store.check_range(head)?;
        }
        if store.header.free_count >= store.block_count {
            return Err(StorageError::corruption(format!(
                "free count {} exceeds block count {}",
                store.header.free_count, store.block_count
            )));
        }

        Ok(store)
    }

    /// Store geometry
    pub fn config(&self) -> BlockStoreConfig {
        self.config
    }

    /// Payload bytes per block
    pub fn content_capacity(&self) -> usize {
        self.config.content_capacity()
    }

    /// Number of blocks in the container, metadata block included
    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    /// Number of blocks on the free list
    pub fn free_count(&self) -> u64 {
        self.header.free_count
    }

    /// Whether `id` names an existing data block
    pub fn contains(&self, id: BlockId) -> bool {
        id.is_some() && id.value() < self.block_count
    }

    fn check_range(&self, id: BlockId) -> Result<()> {
        if self.contains(id) {
            Ok(())
        } else {
            Err(StorageError::corruption(format!(
                "block {} out of range (block count {})",
                id, self.block_count
            )))
        }
    }

    fn offset(&self, id: BlockId) -> u64 {
        id.file_offset(self.config.block_size)
    }

    /// Persist `header` and adopt it once the write succeeds
    fn commit_header(&mut self, header: StoreHeader) -> Result<()> {
        let mut buf = [0u8; STORE_HEADER_SIZE];
        header.write(&mut buf);
        self.container.write_at(0, &buf)?;
        self.header = header;
        Ok(())
    }

    /// Take a block off the free list, or append one to the container.
    ///
    /// The returned block has a zeroed header of kind `Allocated`.
    pub fn allocate(&mut self) -> Result<BlockId> {
        let fresh = BlockHeader {
            kind: BlockKind::Allocated,
            ..BlockHeader::default()
        };

        if let Some(head) = self.header.free_head {
            self.check_range(head)?;
            let block = self.read_header(head)?;
            if block.kind != BlockKind::Free {
                return Err(StorageError::corruption(format!(
                    "free-list head {} is a live {:?} block",
                    head, block.kind
                )));
            }
            if self.header.free_count == 0 {
                return Err(StorageError::corruption("free list is non-empty but count is 0"));
            }

            let unlinked = StoreHeader {
                free_head: block.next,
                free_count: self.header.free_count - 1,
                ..self.header
            };
            self.write_header(head, &fresh)?;
            if let Err(e) = self.commit_header(unlinked) {
                // Still the list head, so it must read as free again
                if let Err(restore) = self.write_header(head, &block) {
                    tracing::warn!(block = %head, error = %restore, "failed to restore free block");
                }
                return Err(e);
            }

            tracing::trace!(block = %head, "reused free block");
            return Ok(head);
        }

        let id = BlockId::new(self.block_count);
        let mut block = vec![0u8; self.config.block_size];
        block[..BLOCK_HEADER_SIZE].copy_from_slice(&fresh.to_bytes());
        let offset = self.offset(id);
        self.container.write_at(offset, &block)?;
        self.block_count += 1;

        tracing::trace!(block = %id, "appended block");
        Ok(id)
    }

    /// Push a block onto the free list, zeroing its content.
    ///
    /// Freeing a block that is already free is rejected, so a block can
    /// never sit on the list twice.
    pub fn free(&mut self, id: BlockId) -> Result<()> {
        if self.read_header(id)?.kind == BlockKind::Free {
            return Err(StorageError::invalid_operation(format!(
                "block {} is already free",
                id
            )));
        }

        let header = BlockHeader {
            next: self.header.free_head,
            ..BlockHeader::default()
        };
        let mut block = vec![0u8; self.config.block_size];
        block[..BLOCK_HEADER_SIZE].copy_from_slice(&header.to_bytes());
        let offset = self.offset(id);
        self.container.write_at(offset, &block)?;

        self.commit_header(StoreHeader {
            free_head: Some(id),
            free_count: self.header.free_count + 1,
            ..self.header
        })?;

        tracing::trace!(block = %id, "freed block");
        Ok(())
    }

    /// Read a block's full header
    pub fn read_header(&mut self, id: BlockId) -> Result<BlockHeader> {
        self.check_range(id)?;
        let mut buf = [0u8; BLOCK_HEADER_SIZE];
        let offset = self.offset(id);
        self.container.read_at(offset, &mut buf)?;
        BlockHeader::read(id, &buf)
    }

    /// Overwrite a block's full header
    pub fn write_header(&mut self, id: BlockId, header: &BlockHeader) -> Result<()> {
        self.check_range(id)?;
        let offset = self.offset(id);
        self.container.write_at(offset, &header.to_bytes())
    }

    /// Read a single header field
    pub fn read_field(&mut self, id: BlockId, field: HeaderField) -> Result<u64> {
        self.check_range(id)?;
        let (at, width) = field.span();
        let mut buf = [0u8; 8];
        let offset = self.offset(id) + at as u64;
        self.container.read_at(offset, &mut buf[..width])?;
        Ok(if width == 4 {
            read_u32(&buf, 0) as u64
        } else {
            read_u64(&buf, 0)
        })
    }

    /// Write a single header field
    pub fn write_field(&mut self, id: BlockId, field: HeaderField, value: u64) -> Result<()> {
        self.check_range(id)?;
        let (at, width) = field.span();
        let offset = self.offset(id) + at as u64;
        if width == 4 {
            let value = u32::try_from(value).map_err(|_| {
                StorageError::invalid_operation(format!("{:?} value {} exceeds u32", field, value))
            })?;
            self.container.write_at(offset, &value.to_le_bytes())
        } else {
            self.container.write_at(offset, &value.to_le_bytes())
        }
    }

    fn check_content_len(&self, len: usize) -> Result<()> {
        if len > self.content_capacity() {
            return Err(StorageError::invalid_operation(format!(
                "{} bytes exceed block content capacity {}",
                len,
                self.content_capacity()
            )));
        }
        Ok(())
    }

    /// Read the first `buf.len()` payload bytes of a block
    pub fn read_content(&mut self, id: BlockId, buf: &mut [u8]) -> Result<()> {
        self.check_range(id)?;
        self.check_content_len(buf.len())?;
        let offset = self.offset(id) + BLOCK_HEADER_SIZE as u64;
        self.container.read_at(offset, buf)
    }

    /// Write payload bytes at the start of a block's content region
    pub fn write_content(&mut self, id: BlockId, data: &[u8]) -> Result<()> {
        self.check_range(id)?;
        self.check_content_len(data.len())?;
        let offset = self.offset(id) + BLOCK_HEADER_SIZE as u64;
        self.container.write_at(offset, data)
    }

    fn check_reserved(&self, offset: usize, len: usize) -> Result<()> {
        if offset + len > self.config.reserved_bytes {
            return Err(StorageError::invalid_operation(format!(
                "reserved access {}..{} outside the {} byte region",
                offset,
                offset + len,
                self.config.reserved_bytes
            )));
        }
        Ok(())
    }

    /// Read from the caller-defined reserved region
    pub fn read_reserved(&mut self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check_reserved(offset, buf.len())?;
        self.container.read_at((STORE_HEADER_SIZE + offset) as u64, buf)
    }

    /// Write into the caller-defined reserved region
    pub fn write_reserved(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        self.check_reserved(offset, data.len())?;
        self.container.write_at((STORE_HEADER_SIZE + offset) as u64, data)
    }

    /// Walk the free list from its head.
    ///
    /// A cycle, an out-of-range link or a live block on the list is corruption.
    pub fn free_blocks(&mut self) -> Result<Vec<BlockId>> {
        let mut blocks = Vec::new();
        let mut current = self.header.free_head;

        while let Some(id) = current {
            if blocks.len() as u64 >= self.block_count {
                return Err(StorageError::corruption("cycle in free list"));
            }
            let header = self.read_header(id)?;
            if header.kind != BlockKind::Free {
                return Err(StorageError::corruption(format!(
                    "live {:?} block {} on free list",
                    header.kind, id
                )));
            }
            blocks.push(id);
            current = header.next;
        }

        if blocks.len() as u64 != self.header.free_count {
            tracing::warn!(
                walked = blocks.len(),
                recorded = self.header.free_count,
                "free-list count disagrees with walk"
            );
        }

        Ok(blocks)
    }

    /// Flush the container
    pub fn sync(&mut self) -> Result<()> {
        self.container.sync()
    }

    /// Give back the container
    pub fn into_inner(self) -> C {
        self.container
    }
}
