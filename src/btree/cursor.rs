//! Forward iteration over leaf entries.
//!
//! A cursor holds the remaining entries of one leaf and the id of the
//! next leaf. Leaves are loaded only when the previous one is exhausted,
//! so a scan the caller stops early never touches the rest of the tree.

use crate::btree::node::Node;
use crate::btree::node_manager::NodeStore;
use crate::error::{Result, StorageError};
use crate::types::NodeId;
use std::iter::FusedIterator;
use std::marker::PhantomData;

/// Lazy ascending sequence of `(key, value)` entries
pub struct Cursor<'a, K, V, S: NodeStore<K, V>> {
    store: &'a mut S,
    entries: std::vec::IntoIter<(K, V)>,
    next_leaf: Option<NodeId>,
    done: bool,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<'a, K, V, S: NodeStore<K, V>> Cursor<'a, K, V, S> {
    pub(crate) fn new(store: &'a mut S, entries: Vec<(K, V)>, next_leaf: Option<NodeId>) -> Self {
        Self {
            store,
            entries: entries.into_iter(),
            next_leaf,
            done: false,
            _marker: PhantomData,
        }
    }

    fn fail(&mut self, err: StorageError) -> Option<Result<(K, V)>> {
        self.done = true;
        Some(Err(err))
    }
}

impl<K, V, S: NodeStore<K, V>> Iterator for Cursor<'_, K, V, S> {
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            if let Some(entry) = self.entries.next() {
                return Some(Ok(entry));
            }

            let Some(id) = self.next_leaf.take() else {
                self.done = true;
                return None;
            };

            match self.store.find_node(id) {
                Ok(Node::Leaf(leaf)) => {
                    self.next_leaf = leaf.next;
                    self.entries = leaf.entries.into_iter();
                }
                Ok(Node::Branch(_)) => {
                    return self.fail(StorageError::corruption(format!(
                        "leaf sibling link points at branch {}",
                        id
                    )));
                }
                Err(e) => return self.fail(e),
            }
        }
    }
}

impl<K, V, S: NodeStore<K, V>> FusedIterator for Cursor<'_, K, V, S> {}
