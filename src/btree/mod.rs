//! B+-tree index.
//!
//! This module provides a disk-resident B+-tree that supports:
//! - Point lookups (get)
//! - Unique and duplicate-key inserts
//! - Deletions with rebalancing
//! - Ascending scans from a key along the leaf chain

mod compare;
mod cursor;
mod node;
mod node_manager;
mod serializer;
mod tree;

pub use compare::{KeyComparer, NaturalOrder};
pub use cursor::Cursor;
pub use node::{BranchNode, LeafNode, Node};
pub use node_manager::{DiskNodeManager, NodeStore, RootPointer, DEFAULT_NODE_CACHE};
pub use serializer::{
    BytesSerializer, I32Serializer, I64Serializer, PairSerializer, RecordIdSerializer,
    SerializeResult, Serializer, StringSerializer, U32Serializer, U64Serializer, UuidSerializer,
};
pub use tree::{Tree, TreeSnapshot, TreeStats};
