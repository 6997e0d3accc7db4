//! Buffering: an in-memory cache of decoded nodes with LRU eviction.

mod lru;
mod node_cache;

pub use node_cache::{CacheStats, NodeCache};
