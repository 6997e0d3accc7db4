//! Recency ordering for cached nodes.

use crate::types::BlockId;
use std::collections::HashMap;

/// Doubly-linked recency list over slot indices
pub struct LruOrder {
    /// Maps block id to its slot
    positions: HashMap<BlockId, usize>,
    slots: Vec<Slot>,
    /// Most recently used
    head: Option<usize>,
    /// Least recently used
    tail: Option<usize>,
    /// Reusable slots
    vacant: Vec<usize>,
}

#[derive(Clone, Copy)]
struct Slot {
    id: BlockId,
    prev: Option<usize>,
    next: Option<usize>,
}

impl LruOrder {
    /// Create an empty order with room for `capacity` ids
    pub fn new(capacity: usize) -> Self {
        Self {
            positions: HashMap::with_capacity(capacity),
            slots: Vec::with_capacity(capacity),
            head: None,
            tail: None,
            vacant: Vec::new(),
        }
    }

    /// Mark `id` as most recently used, adding it if absent
    pub fn touch(&mut self, id: BlockId) {
        match self.positions.get(&id) {
            Some(&pos) => {
                if self.head != Some(pos) {
                    self.unlink(pos);
                    self.link_front(pos);
                }
            }
            None => {
                let slot = Slot { id, prev: None, next: None };
                let pos = match self.vacant.pop() {
                    Some(pos) => {
                        self.slots[pos] = slot;
                        pos
                    }
                    None => {
                        self.slots.push(slot);
                        self.slots.len() - 1
                    }
                };
                self.link_front(pos);
                self.positions.insert(id, pos);
            }
        }
    }

    /// Forget `id`
    pub fn remove(&mut self, id: BlockId) {
        if let Some(pos) = self.positions.remove(&id) {
            self.unlink(pos);
            self.vacant.push(pos);
        }
    }

    /// Remove and return the least recently used id
    pub fn pop_lru(&mut self) -> Option<BlockId> {
        let id = self.slots[self.tail?].id;
        self.remove(id);
        Some(id)
    }

    fn link_front(&mut self, pos: usize) {
        self.slots[pos].prev = None;
        self.slots[pos].next = self.head;
        if let Some(old_head) = self.head {
            self.slots[old_head].prev = Some(pos);
        }
        self.head = Some(pos);
        if self.tail.is_none() {
            self.tail = Some(pos);
        }
    }

    fn unlink(&mut self, pos: usize) {
        let slot = self.slots[pos];

        match slot.prev {
            Some(prev) => self.slots[prev].next = slot.next,
            None => self.head = slot.next,
        }
        match slot.next {
            Some(next) => self.slots[next].prev = slot.prev,
            None => self.tail = slot.prev,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> BlockId {
        BlockId::new(n)
    }

    #[test]
    fn test_touch_reorders() {
        let mut order = LruOrder::new(3);
        order.touch(id(1));
        order.touch(id(2));
        order.touch(id(3));
        order.touch(id(1));

        assert_eq!(order.pop_lru(), Some(id(2)));
        assert_eq!(order.pop_lru(), Some(id(3)));
        assert_eq!(order.pop_lru(), Some(id(1)));
        assert_eq!(order.pop_lru(), None);
    }

    #[test]
    fn test_remove_middle() {
        let mut order = LruOrder::new(3);
        order.touch(id(1));
        order.touch(id(2));
        order.touch(id(3));

        order.remove(id(2));
        order.remove(id(2));
        assert_eq!(order.pop_lru(), Some(id(1)));

        // Vacant slot is reused
        order.touch(id(4));
        assert_eq!(order.slots.len(), 3);
        assert_eq!(order.pop_lru(), Some(id(3)));
        assert_eq!(order.pop_lru(), Some(id(4)));
        assert_eq!(order.pop_lru(), None);
    }
}
