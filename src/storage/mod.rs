//! Storage layer: containers, blocks and records.
//!
//! Data flows strictly upward: the record store chains blocks from the
//! block store, which reads and writes fixed-size blocks of a container.

mod block_store;
mod container;
mod header;
mod record_store;

pub use block_store::BlockStore;
pub use container::{Container, FileContainer, MemoryContainer};
pub use header::{BlockHeader, BlockKind, HeaderField, StoreHeader, MAGIC};
pub use record_store::RecordStore;
