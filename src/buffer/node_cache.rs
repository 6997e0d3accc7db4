//! Write-through cache of decoded tree nodes.
//!
//! Nodes are written to the record store on every change, so the cache
//! never holds dirty state and eviction is just a drop.

use crate::buffer::lru::LruOrder;
use crate::types::NodeId;
use serde::Serialize;
use std::collections::HashMap;

/// Bounded map from node id to decoded node
pub struct NodeCache<N> {
    nodes: HashMap<NodeId, N>,
    order: LruOrder,
    capacity: usize,
    hits: u64,
    misses: u64,
}

/// Cache hit/miss counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub len: usize,
}

impl<N: Clone> NodeCache<N> {
    /// Create a cache holding at most `capacity` nodes; 0 disables caching
    pub fn new(capacity: usize) -> Self {
        Self {
            nodes: HashMap::with_capacity(capacity),
            order: LruOrder::new(capacity),
            capacity,
            hits: 0,
            misses: 0,
        }
    }

    /// Look up a node, marking it recently used
    pub fn get(&mut self, id: NodeId) -> Option<N> {
        match self.nodes.get(&id) {
            Some(node) => {
                self.hits += 1;
                self.order.touch(id);
                Some(node.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Insert or replace a node, evicting the least recently used one if full
    pub fn put(&mut self, id: NodeId, node: N) {
        if self.capacity == 0 {
            return;
        }
        if !self.nodes.contains_key(&id) && self.nodes.len() >= self.capacity {
            if let Some(victim) = self.order.pop_lru() {
                self.nodes.remove(&victim);
            }
        }
        self.nodes.insert(id, node);
        self.order.touch(id);
    }

    /// Drop a node
    pub fn remove(&mut self, id: NodeId) {
        self.nodes.remove(&id);
        self.order.remove(id);
    }

    /// Current counters
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            len: self.nodes.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eviction() {
        let mut cache = NodeCache::new(2);
        cache.put(NodeId::new(1), "a");
        cache.put(NodeId::new(2), "b");
        assert_eq!(cache.get(NodeId::new(1)), Some("a"));

        cache.put(NodeId::new(3), "c");
        assert_eq!(cache.get(NodeId::new(2)), None);
        assert_eq!(cache.get(NodeId::new(1)), Some("a"));
        assert_eq!(cache.get(NodeId::new(3)), Some("c"));

        let stats = cache.stats();
        assert_eq!(stats.len, 2);
        assert_eq!(stats.hits, 3);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_replace_does_not_evict() {
        let mut cache = NodeCache::new(2);
        cache.put(NodeId::new(1), 1);
        cache.put(NodeId::new(2), 2);
        cache.put(NodeId::new(2), 20);
        assert_eq!(cache.get(NodeId::new(1)), Some(1));
        assert_eq!(cache.get(NodeId::new(2)), Some(20));
    }

    #[test]
    fn test_disabled() {
        let mut cache = NodeCache::new(0);
        cache.put(NodeId::new(1), 1);
        assert_eq!(cache.get(NodeId::new(1)), None);
    }

    #[test]
    fn test_remove() {
        let mut cache = NodeCache::new(4);
        cache.put(NodeId::new(1), 1);
        cache.remove(NodeId::new(1));
        assert_eq!(cache.get(NodeId::new(1)), None);
        assert_eq!(cache.stats().len, 0);
    }
}
