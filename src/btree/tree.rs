//! B+-tree core implementation.
//!
//! Entries live in leaves, which are chained left to right for scans.
//! Branches hold separator keys: child `i` covers keys from `keys[i - 1]`
//! up to `keys[i]`. In a unique tree the bound is strict on the right; in
//! a duplicate-key tree equal keys may sit on both sides of a separator,
//! so lookups start at the leftmost candidate child and walk forward.
//!
//! Every node is written back to the node store as soon as it changes.

use crate::btree::compare::{KeyComparer, NaturalOrder};
use crate::btree::cursor::Cursor;
use crate::btree::node::{BranchNode, LeafNode, Node};
use crate::btree::node_manager::{NodeStore, RootPointer};
use crate::error::{Result, StorageError};
use crate::types::{NodeId, TreeConfig};
use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;
use std::marker::PhantomData;

/// A disk-resident B+-tree
pub struct Tree<K, V, S, C = NaturalOrder> {
    store: S,
    comparer: C,
    config: TreeConfig,
    root: NodeId,
    height: usize,
    _marker: PhantomData<fn() -> (K, V)>,
}

/// Shape of a tree, as counted by `verify`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeStats {
    pub height: usize,
    pub node_count: usize,
    pub leaf_count: usize,
    pub entry_count: usize,
}

/// Debug view of a subtree
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeSnapshot {
    pub node_id: u64,
    pub is_leaf: bool,
    pub keys: Vec<String>,
    /// Values (only for leaf nodes)
    pub values: Vec<String>,
    /// Child nodes (only for branch nodes)
    pub children: Vec<TreeSnapshot>,
}

/// Result of a split: separator for the parent and the new right node
type Split<K> = Option<(K, NodeId)>;

/// Leaf id with its sibling links, in scan order
type LeafLinks = (NodeId, Option<NodeId>, Option<NodeId>);

impl<K, V, S> Tree<K, V, S, NaturalOrder>
where
    K: Ord + Clone + fmt::Debug,
    V: Clone,
    S: NodeStore<K, V>,
{
    /// Open the tree in `store`, creating an empty root leaf if there is none
    pub fn open(store: S, config: TreeConfig) -> Result<Self> {
        Self::with_comparer(store, config, NaturalOrder)
    }
}

impl<K, V, S, C> Tree<K, V, S, C>
where
    K: Clone + fmt::Debug,
    V: Clone,
    S: NodeStore<K, V>,
    C: KeyComparer<K>,
{
    /// Open the tree with a custom key order
    pub fn with_comparer(mut store: S, config: TreeConfig, comparer: C) -> Result<Self> {
        config.validate()?;

        let (root, height) = match store.root()? {
            Some(root) if root.allow_duplicates != config.allow_duplicates => {
                return Err(StorageError::invalid_operation(format!(
                    "tree was created with allow_duplicates = {}, opened with {}",
                    root.allow_duplicates, config.allow_duplicates
                )));
            }
            Some(root) => (root.id, root.height),
            None => {
                let id = store.create_node(&Node::Leaf(LeafNode::empty()))?;
                store.set_root(RootPointer {
                    id,
                    height: 1,
                    allow_duplicates: config.allow_duplicates,
                })?;
                tracing::debug!(root = %id, "created empty tree");
                (id, 1)
            }
        };

        Ok(Self {
            store,
            comparer,
            config,
            root,
            height,
            _marker: PhantomData,
        })
    }

    /// Number of levels, 1 for a lone root leaf
    pub fn height(&self) -> usize {
        self.height
    }

    /// Current root node
    pub fn root_id(&self) -> NodeId {
        self.root
    }

    /// Tree configuration
    pub fn config(&self) -> TreeConfig {
        self.config
    }

    /// Whether equal keys may repeat
    pub fn allows_duplicates(&self) -> bool {
        self.config.allow_duplicates
    }

    /// The node store
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Give back the node store
    pub fn into_store(self) -> S {
        self.store
    }

    /// Flush the node store
    pub fn sync(&mut self) -> Result<()> {
        self.store.sync()
    }

    fn cmp(&self, a: &K, b: &K) -> Ordering {
        self.comparer.compare(a, b)
    }

    /// Number of keys strictly less than `key`
    fn lower_bound(&self, keys: &[K], key: &K) -> usize {
        keys.partition_point(|k| self.cmp(k, key) == Ordering::Less)
    }

    /// Number of keys less than or equal to `key`
    fn upper_bound(&self, keys: &[K], key: &K) -> usize {
        keys.partition_point(|k| self.cmp(k, key) != Ordering::Greater)
    }

    fn lower_bound_entries(&self, entries: &[(K, V)], key: &K) -> usize {
        entries.partition_point(|(k, _)| self.cmp(k, key) == Ordering::Less)
    }

    fn upper_bound_entries(&self, entries: &[(K, V)], key: &K) -> usize {
        entries.partition_point(|(k, _)| self.cmp(k, key) != Ordering::Greater)
    }

    fn load_leaf(&mut self, id: NodeId) -> Result<LeafNode<K, V>> {
        match self.store.find_node(id)? {
            Node::Leaf(leaf) => Ok(leaf),
            Node::Branch(_) => Err(StorageError::corruption(format!(
                "expected leaf at {}, found branch",
                id
            ))),
        }
    }

    fn load_branch(&mut self, id: NodeId) -> Result<BranchNode<K>> {
        match self.store.find_node(id)? {
            Node::Branch(branch) => Ok(branch),
            Node::Leaf(_) => Err(StorageError::corruption(format!(
                "expected branch at {}, found leaf",
                id
            ))),
        }
    }

    fn child_at(branch: &BranchNode<K>, id: NodeId, i: usize) -> Result<NodeId> {
        if branch.children.len() != branch.keys.len() + 1 {
            return Err(StorageError::corruption(format!(
                "branch {} has {} keys but {} children",
                id,
                branch.keys.len(),
                branch.children.len()
            )));
        }
        Ok(branch.children[i])
    }

    fn set_root(&mut self, id: NodeId, height: usize) -> Result<()> {
        self.store.set_root(RootPointer {
            id,
            height,
            allow_duplicates: self.config.allow_duplicates,
        })?;
        self.root = id;
        self.height = height;
        Ok(())
    }

    /// Leftmost leaf that can hold `key` (or the leftmost leaf for `None`),
    /// with the index of its first entry not less than `key`
    fn seek_leaf(&mut self, key: Option<&K>) -> Result<(LeafNode<K, V>, usize)> {
        let mut id = self.root;

        for _ in 0..self.height {
            match self.store.find_node(id)? {
                Node::Leaf(leaf) => {
                    let pos = key.map_or(0, |key| self.lower_bound_entries(&leaf.entries, key));
                    return Ok((leaf, pos));
                }
                Node::Branch(branch) => {
                    let i = key.map_or(0, |key| self.lower_bound(&branch.keys, key));
                    id = Self::child_at(&branch, id, i)?;
                }
            }
        }

        Err(StorageError::corruption(format!(
            "no leaf reached within tree height {}",
            self.height
        )))
    }

    /// Look up the value of `key`; for duplicate keys, the first inserted
    pub fn get(&mut self, key: &K) -> Result<Option<V>> {
        let (mut leaf, mut pos) = self.seek_leaf(Some(key))?;

        loop {
            if let Some((found, value)) = leaf.entries.get(pos) {
                return Ok((self.cmp(found, key) == Ordering::Equal).then(|| value.clone()));
            }
            match leaf.next {
                Some(next) => {
                    leaf = self.load_leaf(next)?;
                    pos = 0;
                }
                None => return Ok(None),
            }
        }
    }

    /// Whether `key` is present
    pub fn contains(&mut self, key: &K) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Insert an entry.
    ///
    /// A unique tree rejects an existing key with `DuplicateKey` and leaves
    /// the stored entry untouched. A duplicate-key tree places the new entry
    /// after all entries with an equal key.
    pub fn insert(&mut self, key: K, value: V) -> Result<()> {
        let root = self.root;
        if let Some((separator, right)) = self.insert_into(root, key, value, 1)? {
            let new_root = Node::Branch(BranchNode {
                keys: vec![separator],
                children: vec![root, right],
            });
            let id = self.store.create_node(&new_root)?;
            self.set_root(id, self.height + 1)?;
            tracing::debug!(root = %id, height = self.height, "root split");
        }
        Ok(())
    }

    fn insert_into(&mut self, id: NodeId, key: K, value: V, depth: usize) -> Result<Split<K>> {
        if depth > self.height {
            return Err(StorageError::corruption(format!(
                "node {} below tree height {}",
                id, self.height
            )));
        }

        match self.store.find_node(id)? {
            Node::Leaf(mut leaf) => {
                let pos = self.upper_bound_entries(&leaf.entries, &key);
                if !self.config.allow_duplicates
                    && pos > 0
                    && self.cmp(&leaf.entries[pos - 1].0, &key) == Ordering::Equal
                {
                    return Err(StorageError::DuplicateKey(format!("{:?}", key)));
                }

                leaf.entries.insert(pos, (key, value));
                if leaf.entries.len() <= self.config.max_entries {
                    self.store.update_node(id, &Node::Leaf(leaf))?;
                    return Ok(None);
                }
                self.split_leaf(id, leaf).map(Some)
            }
            Node::Branch(mut branch) => {
                let i = self.upper_bound(&branch.keys, &key);
                let child = Self::child_at(&branch, id, i)?;

                let split = self.insert_into(child, key, value, depth + 1)?;
                let Some((separator, right)) = split else {
                    return Ok(None);
                };

                branch.keys.insert(i, separator);
                branch.children.insert(i + 1, right);
                if branch.keys.len() <= self.config.max_entries {
                    self.store.update_node(id, &Node::Branch(branch))?;
                    return Ok(None);
                }
                self.split_branch(id, branch).map(Some)
            }
        }
    }

    /// Move the upper half of an overfull leaf into a new right sibling
    fn split_leaf(&mut self, id: NodeId, mut leaf: LeafNode<K, V>) -> Result<(K, NodeId)> {
        let mid = leaf.entries.len() / 2;
        let upper = leaf.entries.split_off(mid);
        let separator = upper[0].0.clone();

        let right = LeafNode {
            entries: upper,
            prev: Some(id),
            next: leaf.next,
        };
        let right_id = self.store.create_node(&Node::Leaf(right))?;

        if let Some(next) = leaf.next {
            self.relink_prev(next, Some(right_id))?;
        }
        leaf.next = Some(right_id);
        self.store.update_node(id, &Node::Leaf(leaf))?;

        tracing::trace!(left = %id, right = %right_id, "leaf split");
        Ok((separator, right_id))
    }

    /// Push the middle key of an overfull branch up, moving the keys and
    /// children above it into a new right sibling
    fn split_branch(&mut self, id: NodeId, mut branch: BranchNode<K>) -> Result<(K, NodeId)> {
        let mid = branch.keys.len() / 2;
        let right_keys = branch.keys.split_off(mid + 1);
        let separator = branch
            .keys
            .pop()
            .ok_or_else(|| StorageError::corruption(format!("split of empty branch {}", id)))?;
        let right_children = branch.children.split_off(mid + 1);

        let right_id = self.store.create_node(&Node::Branch(BranchNode {
            keys: right_keys,
            children: right_children,
        }))?;
        self.store.update_node(id, &Node::Branch(branch))?;

        tracing::trace!(left = %id, right = %right_id, "branch split");
        Ok((separator, right_id))
    }

    fn relink_prev(&mut self, id: NodeId, prev: Option<NodeId>) -> Result<()> {
        let mut leaf = self.load_leaf(id)?;
        leaf.prev = prev;
        self.store.update_node(id, &Node::Leaf(leaf))
    }

    /// Remove `key` from a unique tree.
    ///
    /// Returns whether the key was present. Duplicate-key trees must name
    /// the entry with `delete_entry`.
    pub fn delete(&mut self, key: &K) -> Result<bool> {
        if self.config.allow_duplicates {
            return Err(StorageError::invalid_operation(
                "delete by key alone needs a unique tree; use delete_entry",
            ));
        }
        self.delete_matching(key, &|_: &V| true)
    }

    /// Remove the first entry equal to `(key, value)`
    pub fn delete_entry(&mut self, key: &K, value: &V) -> Result<bool>
    where
        V: PartialEq,
    {
        self.delete_matching(key, &|v: &V| v == value)
    }

    fn delete_matching(&mut self, key: &K, matches: &dyn Fn(&V) -> bool) -> Result<bool> {
        let root = self.root;
        if self.delete_from(root, key, matches, 1)?.is_none() {
            return Ok(false);
        }

        if let Node::Branch(branch) = self.store.find_node(root)? {
            if branch.keys.is_empty() {
                let child = Self::child_at(&branch, root, 0)?;
                self.set_root(child, self.height - 1)?;
                self.store.delete_node(root)?;
                tracing::debug!(root = %child, height = self.height, "root collapsed");
            }
        }

        Ok(true)
    }

    /// Returns `None` if nothing matched, otherwise whether `id` underflowed
    fn delete_from(
        &mut self,
        id: NodeId,
        key: &K,
        matches: &dyn Fn(&V) -> bool,
        depth: usize,
    ) -> Result<Option<bool>> {
        if depth > self.height {
            return Err(StorageError::corruption(format!(
                "node {} below tree height {}",
                id, self.height
            )));
        }

        match self.store.find_node(id)? {
            Node::Leaf(mut leaf) => {
                let start = self.lower_bound_entries(&leaf.entries, key);
                let offset = leaf.entries[start..]
                    .iter()
                    .take_while(|(k, _)| self.cmp(k, key) == Ordering::Equal)
                    .position(|(_, v)| matches(v));

                let Some(offset) = offset else {
                    return Ok(None);
                };
                leaf.entries.remove(start + offset);

                let underflow = leaf.entries.len() < self.config.min_entries;
                self.store.update_node(id, &Node::Leaf(leaf))?;
                Ok(Some(underflow))
            }
            Node::Branch(mut branch) => {
                let lo = self.lower_bound(&branch.keys, key);
                let hi = self.upper_bound(&branch.keys, key);

                for i in lo..=hi {
                    let child = Self::child_at(&branch, id, i)?;
                    match self.delete_from(child, key, matches, depth + 1)? {
                        None => continue,
                        Some(false) => return Ok(Some(false)),
                        Some(true) => {
                            self.rebalance_child(&mut branch, i)?;
                            let underflow = branch.keys.len() < self.config.min_branch_keys();
                            self.store.update_node(id, &Node::Branch(branch))?;
                            return Ok(Some(underflow));
                        }
                    }
                }

                Ok(None)
            }
        }
    }

    /// Restore occupancy of `parent.children[i]` by borrowing from or
    /// merging with a sibling. The caller persists `parent`.
    fn rebalance_child(&mut self, parent: &mut BranchNode<K>, i: usize) -> Result<()> {
        let child_id = parent.children[i];
        match self.store.find_node(child_id)? {
            Node::Leaf(child) => self.rebalance_leaf(parent, i, child),
            Node::Branch(child) => self.rebalance_branch(parent, i, child),
        }
    }

    fn rebalance_leaf(
        &mut self,
        parent: &mut BranchNode<K>,
        i: usize,
        mut child: LeafNode<K, V>,
    ) -> Result<()> {
        let min = self.config.min_entries;
        let child_id = parent.children[i];
        let left = match i.checked_sub(1) {
            Some(l) => Some(self.load_leaf(parent.children[l])?),
            None => None,
        };
        let right = match parent.children.get(i + 1).copied() {
            Some(r) => Some(self.load_leaf(r)?),
            None => None,
        };

        match (left, right) {
            (Some(mut left), _) if left.entries.len() > min => {
                let left_id = parent.children[i - 1];
                let moved = left
                    .entries
                    .pop()
                    .ok_or_else(|| StorageError::corruption(format!("leaf {} is empty", left_id)))?;
                child.entries.insert(0, moved);
                parent.keys[i - 1] = child.entries[0].0.clone();

                self.store.update_node(left_id, &Node::Leaf(left))?;
                self.store.update_node(child_id, &Node::Leaf(child))?;
                tracing::trace!(from = %left_id, to = %child_id, "leaf borrowed from left");
            }
            (_, Some(mut right)) if right.entries.len() > min => {
                let right_id = parent.children[i + 1];
                let moved = right.entries.remove(0);
                child.entries.push(moved);
                parent.keys[i] = right.entries[0].0.clone();

                self.store.update_node(right_id, &Node::Leaf(right))?;
                self.store.update_node(child_id, &Node::Leaf(child))?;
                tracing::trace!(from = %right_id, to = %child_id, "leaf borrowed from right");
            }
            (Some(mut left), _) => {
                let left_id = parent.children[i - 1];
                left.entries.append(&mut child.entries);
                left.next = child.next;
                if let Some(next) = child.next {
                    self.relink_prev(next, Some(left_id))?;
                }

                self.store.update_node(left_id, &Node::Leaf(left))?;
                self.store.delete_node(child_id)?;
                parent.keys.remove(i - 1);
                parent.children.remove(i);
                tracing::trace!(into = %left_id, freed = %child_id, "leaf merged left");
            }
            (None, Some(mut right)) => {
                let right_id = parent.children[i + 1];
                child.entries.append(&mut right.entries);
                child.next = right.next;
                if let Some(next) = right.next {
                    self.relink_prev(next, Some(child_id))?;
                }

                self.store.update_node(child_id, &Node::Leaf(child))?;
                self.store.delete_node(right_id)?;
                parent.keys.remove(i);
                parent.children.remove(i + 1);
                tracing::trace!(into = %child_id, freed = %right_id, "leaf merged right");
            }
            (None, None) => {
                return Err(StorageError::corruption(format!(
                    "leaf {} has no siblings under its parent",
                    child_id
                )))
            }
        }

        Ok(())
    }

    fn rebalance_branch(
        &mut self,
        parent: &mut BranchNode<K>,
        i: usize,
        mut child: BranchNode<K>,
    ) -> Result<()> {
        let min = self.config.min_branch_keys();
        let child_id = parent.children[i];
        let left = match i.checked_sub(1) {
            Some(l) => Some(self.load_branch(parent.children[l])?),
            None => None,
        };
        let right = match parent.children.get(i + 1).copied() {
            Some(r) => Some(self.load_branch(r)?),
            None => None,
        };

        match (left, right) {
            (Some(mut left), _) if left.keys.len() > min => {
                let left_id = parent.children[i - 1];
                let (Some(key), Some(grandchild)) = (left.keys.pop(), left.children.pop()) else {
                    return Err(StorageError::corruption(format!("branch {} is empty", left_id)));
                };
                let separator = std::mem::replace(&mut parent.keys[i - 1], key);
                child.keys.insert(0, separator);
                child.children.insert(0, grandchild);

                self.store.update_node(left_id, &Node::Branch(left))?;
                self.store.update_node(child_id, &Node::Branch(child))?;
                tracing::trace!(from = %left_id, to = %child_id, "branch borrowed from left");
            }
            (_, Some(mut right)) if right.keys.len() > min => {
                let right_id = parent.children[i + 1];
                let key = right.keys.remove(0);
                let grandchild = right.children.remove(0);
                let separator = std::mem::replace(&mut parent.keys[i], key);
                child.keys.push(separator);
                child.children.push(grandchild);

                self.store.update_node(right_id, &Node::Branch(right))?;
                self.store.update_node(child_id, &Node::Branch(child))?;
                tracing::trace!(from = %right_id, to = %child_id, "branch borrowed from right");
            }
            (Some(mut left), _) => {
                let left_id = parent.children[i - 1];
                left.keys.push(parent.keys.remove(i - 1));
                parent.children.remove(i);
                left.keys.append(&mut child.keys);
                left.children.append(&mut child.children);

                self.store.update_node(left_id, &Node::Branch(left))?;
                self.store.delete_node(child_id)?;
                tracing::trace!(into = %left_id, freed = %child_id, "branch merged left");
            }
            (None, Some(mut right)) => {
                let right_id = parent.children[i + 1];
                child.keys.push(parent.keys.remove(i));
                parent.children.remove(i + 1);
                child.keys.append(&mut right.keys);
                child.children.append(&mut right.children);

                self.store.update_node(child_id, &Node::Branch(child))?;
                self.store.delete_node(right_id)?;
                tracing::trace!(into = %child_id, freed = %right_id, "branch merged right");
            }
            (None, None) => {
                return Err(StorageError::corruption(format!(
                    "branch {} has no siblings under its parent",
                    child_id
                )))
            }
        }

        Ok(())
    }

    /// Entries with keys not less than `key`, ascending.
    ///
    /// The sequence runs to the end of the tree; callers wanting a bounded
    /// range stop on the first key past their upper bound.
    pub fn larger_than_or_equal_to(&mut self, key: &K) -> Result<Cursor<'_, K, V, S>> {
        let (mut leaf, pos) = self.seek_leaf(Some(key))?;
        leaf.entries.drain(..pos);
        Ok(Cursor::new(&mut self.store, leaf.entries, leaf.next))
    }

    /// Every entry, ascending
    pub fn all(&mut self) -> Result<Cursor<'_, K, V, S>> {
        let (leaf, _) = self.seek_leaf(None)?;
        Ok(Cursor::new(&mut self.store, leaf.entries, leaf.next))
    }

    /// Walk the whole tree checking ordering, separator bounds, occupancy,
    /// uniform leaf depth and sibling links
    pub fn verify(&mut self) -> Result<TreeStats> {
        let mut stats = TreeStats {
            height: self.height,
            ..TreeStats::default()
        };
        let mut leaves: Vec<LeafLinks> = Vec::new();
        let root = self.root;
        self.verify_node(root, 1, None, None, &mut leaves, &mut stats)?;

        for (j, &(id, prev, next)) in leaves.iter().enumerate() {
            let expected_prev = j.checked_sub(1).map(|p| leaves[p].0);
            let expected_next = leaves.get(j + 1).map(|l| l.0);
            if prev != expected_prev || next != expected_next {
                return Err(StorageError::corruption(format!(
                    "leaf {} links {:?}/{:?}, expected {:?}/{:?}",
                    id, prev, next, expected_prev, expected_next
                )));
            }
        }

        Ok(stats)
    }

    fn verify_node(
        &mut self,
        id: NodeId,
        depth: usize,
        lower: Option<&K>,
        upper: Option<&K>,
        leaves: &mut Vec<LeafLinks>,
        stats: &mut TreeStats,
    ) -> Result<()> {
        if depth > self.height {
            return Err(StorageError::corruption(format!(
                "node {} below tree height {}",
                id, self.height
            )));
        }
        stats.node_count += 1;
        let is_root = id == self.root;

        match self.store.find_node(id)? {
            Node::Leaf(leaf) => {
                if depth != self.height {
                    return Err(StorageError::corruption(format!(
                        "leaf {} at depth {} in a tree of height {}",
                        id, depth, self.height
                    )));
                }
                self.check_keys(id, leaf.entries.iter().map(|(k, _)| k), lower, upper)?;
                self.check_occupancy(id, leaf.entries.len(), is_root, self.config.min_entries)?;

                stats.leaf_count += 1;
                stats.entry_count += leaf.entries.len();
                leaves.push((id, leaf.prev, leaf.next));
            }
            Node::Branch(branch) => {
                Self::child_at(&branch, id, 0)?;
                self.check_keys(id, branch.keys.iter(), lower, upper)?;
                let floor = if is_root { 1 } else { self.config.min_branch_keys() };
                self.check_occupancy(id, branch.keys.len(), false, floor)?;

                let last = branch.keys.len();
                for (c, &child) in branch.children.iter().enumerate() {
                    let lo = if c == 0 { lower } else { Some(&branch.keys[c - 1]) };
                    let hi = if c == last { upper } else { Some(&branch.keys[c]) };
                    self.verify_node(child, depth + 1, lo, hi, leaves, stats)?;
                }
            }
        }

        Ok(())
    }

    fn check_keys<'k>(
        &self,
        id: NodeId,
        keys: impl Iterator<Item = &'k K>,
        lower: Option<&K>,
        upper: Option<&K>,
    ) -> Result<()>
    where
        K: 'k,
    {
        let unique = !self.config.allow_duplicates;
        let mut previous: Option<&K> = None;

        for key in keys {
            let out_of_order = previous.is_some_and(|p| match self.cmp(p, key) {
                Ordering::Less => false,
                Ordering::Equal => unique,
                Ordering::Greater => true,
            });
            let below = lower.is_some_and(|l| self.cmp(key, l) == Ordering::Less);
            let above = upper.is_some_and(|u| match self.cmp(key, u) {
                Ordering::Less => false,
                Ordering::Equal => unique,
                Ordering::Greater => true,
            });

            if out_of_order || below || above {
                return Err(StorageError::corruption(format!(
                    "node {} key {:?} violates ordering",
                    id, key
                )));
            }
            previous = Some(key);
        }

        Ok(())
    }

    fn check_occupancy(&self, id: NodeId, len: usize, is_root: bool, floor: usize) -> Result<()> {
        if len > self.config.max_entries || (!is_root && len < floor) {
            return Err(StorageError::corruption(format!(
                "node {} holds {} entries, outside {}..={}",
                id, len, floor, self.config.max_entries
            )));
        }
        Ok(())
    }

    /// Nested view of the tree for debugging
    pub fn snapshot(&mut self) -> Result<TreeSnapshot>
    where
        V: fmt::Debug,
    {
        let root = self.root;
        self.snapshot_node(root, 1)
    }

    fn snapshot_node(&mut self, id: NodeId, depth: usize) -> Result<TreeSnapshot>
    where
        V: fmt::Debug,
    {
        if depth > self.height {
            return Err(StorageError::corruption(format!(
                "node {} below tree height {}",
                id, self.height
            )));
        }

        match self.store.find_node(id)? {
            Node::Leaf(leaf) => Ok(TreeSnapshot {
                node_id: id.value(),
                is_leaf: true,
                keys: leaf.entries.iter().map(|(k, _)| format!("{:?}", k)).collect(),
                values: leaf.entries.iter().map(|(_, v)| format!("{:?}", v)).collect(),
                children: Vec::new(),
            }),
            Node::Branch(branch) => {
                let mut children = Vec::with_capacity(branch.children.len());
                for &child in &branch.children {
                    children.push(self.snapshot_node(child, depth + 1)?);
                }
                Ok(TreeSnapshot {
                    node_id: id.value(),
                    is_leaf: false,
                    keys: branch.keys.iter().map(|k| format!("{:?}", k)).collect(),
                    values: Vec::new(),
                    children,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::node_manager::DiskNodeManager;
    use crate::btree::serializer::{RecordIdSerializer, StringSerializer, U64Serializer};
    use crate::storage::{MemoryContainer, RecordStore};
    use crate::types::{BlockId, BlockStoreConfig};

    type NumTree = Tree<
        u64,
        BlockId,
        DiskNodeManager<u64, BlockId, U64Serializer, RecordIdSerializer, MemoryContainer>,
    >;
    type StrTree = Tree<
        String,
        BlockId,
        DiskNodeManager<String, BlockId, StringSerializer, RecordIdSerializer, MemoryContainer>,
    >;

    fn records() -> Result<RecordStore<MemoryContainer>> {
        RecordStore::open(MemoryContainer::new(), BlockStoreConfig::new(512, 24))
    }

    fn num_tree(config: TreeConfig) -> Result<NumTree> {
        let nodes = DiskNodeManager::new(records()?, U64Serializer, RecordIdSerializer)?;
        Tree::open(nodes, config)
    }

    fn str_tree(config: TreeConfig) -> Result<StrTree> {
        let nodes = DiskNodeManager::new(records()?, StringSerializer, RecordIdSerializer)?;
        Tree::open(nodes, config)
    }

    fn rid(n: u64) -> BlockId {
        BlockId::new(n)
    }

    fn keys_from(tree: &mut NumTree, start: u64) -> Result<Vec<u64>> {
        tree.larger_than_or_equal_to(&start)?
            .map(|entry| entry.map(|(k, _)| k))
            .collect()
    }

    #[test]
    fn test_empty_tree() -> Result<()> {
        let mut tree = num_tree(TreeConfig::new(4))?;
        assert_eq!(tree.height(), 1);
        assert_eq!(tree.get(&1)?, None);
        assert_eq!(tree.all()?.count(), 0);
        assert!(!tree.delete(&1)?);
        assert_eq!(tree.verify()?.entry_count, 0);
        Ok(())
    }

    #[test]
    fn test_insert_and_get() -> Result<()> {
        let mut tree = num_tree(TreeConfig::new(4))?;
        for k in [5u64, 1, 9, 3, 7] {
            tree.insert(k, rid(k * 10))?;
        }
        for k in [5u64, 1, 9, 3, 7] {
            assert_eq!(tree.get(&k)?, Some(rid(k * 10)));
        }
        assert_eq!(tree.get(&4)?, None);
        assert_eq!(tree.get(&100)?, None);
        assert!(tree.contains(&9)?);
        Ok(())
    }

    #[test]
    fn test_splits_grow_height() -> Result<()> {
        let mut tree = num_tree(TreeConfig::new(4))?;
        for k in 0..200u64 {
            tree.insert(k, rid(k))?;
        }
        assert!(tree.height() >= 3);

        let stats = tree.verify()?;
        assert_eq!(stats.entry_count, 200);
        for k in 0..200u64 {
            assert_eq!(tree.get(&k)?, Some(rid(k)), "key {}", k);
        }
        Ok(())
    }

    #[test]
    fn test_reverse_insert_order() -> Result<()> {
        let mut tree = num_tree(TreeConfig::new(3))?;
        for k in (0..100u64).rev() {
            tree.insert(k, rid(k))?;
        }
        tree.verify()?;
        assert_eq!(keys_from(&mut tree, 0)?, (0..100).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn test_unique_violation_keeps_original() -> Result<()> {
        let mut tree = num_tree(TreeConfig::new(4))?;
        for k in 0..20u64 {
            tree.insert(k, rid(k))?;
        }

        let err = tree.insert(7, rid(999)).unwrap_err();
        assert!(matches!(err, StorageError::DuplicateKey(ref msg) if msg == "7"));
        assert_eq!(tree.get(&7)?, Some(rid(7)));
        assert_eq!(tree.verify()?.entry_count, 20);
        Ok(())
    }

    #[test]
    fn test_range_scan_from_middle() -> Result<()> {
        let mut tree = num_tree(TreeConfig::new(4))?;
        for k in (0..100u64).map(|k| k * 2) {
            tree.insert(k, rid(k))?;
        }

        // Between keys
        assert_eq!(keys_from(&mut tree, 51)?, (26..100).map(|k| k * 2).collect::<Vec<_>>());
        // On a key
        assert_eq!(keys_from(&mut tree, 50)?, (25..100).map(|k| k * 2).collect::<Vec<_>>());
        // Past the end
        assert!(keys_from(&mut tree, 1000)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_scan_stops_early() -> Result<()> {
        let mut tree = num_tree(TreeConfig::new(4))?;
        for k in 0..50u64 {
            tree.insert(k, rid(k))?;
        }

        let bounded: Vec<u64> = tree
            .larger_than_or_equal_to(&10)?
            .map(|e| e.map(|(k, _)| k))
            .take_while(|k| k.as_ref().map_or(true, |k| *k < 15))
            .collect::<Result<_>>()?;
        assert_eq!(bounded, vec![10, 11, 12, 13, 14]);
        Ok(())
    }

    #[test]
    fn test_duplicates_keep_insertion_order() -> Result<()> {
        let mut tree = str_tree(TreeConfig::new(4).allow_duplicates(true))?;
        tree.insert("w".to_string(), rid(0))?;
        tree.insert("x".to_string(), rid(1))?;
        tree.insert("y".to_string(), rid(9))?;
        tree.insert("x".to_string(), rid(2))?;
        tree.insert("x".to_string(), rid(3))?;

        let scanned: Vec<(String, BlockId)> =
            tree.larger_than_or_equal_to(&"x".to_string())?.collect::<Result<_>>()?;
        assert_eq!(
            scanned,
            vec![
                ("x".to_string(), rid(1)),
                ("x".to_string(), rid(2)),
                ("x".to_string(), rid(3)),
                ("y".to_string(), rid(9)),
            ]
        );
        assert_eq!(tree.get(&"x".to_string())?, Some(rid(1)));
        Ok(())
    }

    #[test]
    fn test_many_duplicates_span_leaves() -> Result<()> {
        let mut tree = num_tree(TreeConfig::new(4).allow_duplicates(true))?;
        tree.insert(1, rid(0))?;
        for v in 0..30u64 {
            tree.insert(5, rid(v))?;
        }
        tree.insert(9, rid(0))?;
        tree.verify()?;

        let fives: Vec<BlockId> = tree
            .larger_than_or_equal_to(&5)?
            .map(|e| e.map(|(_, v)| v))
            .take(30)
            .collect::<Result<_>>()?;
        assert_eq!(fives, (0..30).map(rid).collect::<Vec<_>>());

        assert!(tree.delete_entry(&5, &rid(17))?);
        assert!(!tree.delete_entry(&5, &rid(17))?);
        tree.verify()?;
        let count = tree.larger_than_or_equal_to(&5)?.count();
        assert_eq!(count, 30);
        Ok(())
    }

    #[test]
    fn test_delete_by_key_on_duplicate_tree_rejected() -> Result<()> {
        let mut tree = num_tree(TreeConfig::new(4).allow_duplicates(true))?;
        tree.insert(1, rid(1))?;
        assert!(matches!(tree.delete(&1), Err(StorageError::InvalidOperation(_))));
        Ok(())
    }

    #[test]
    fn test_delete_shrinks_height() -> Result<()> {
        let mut tree = num_tree(TreeConfig::new(4))?;
        for k in 0..100u64 {
            tree.insert(k, rid(k))?;
        }
        let tall = tree.height();
        assert!(tall >= 3);

        for k in 0..99u64 {
            assert!(tree.delete(&k)?, "delete {}", k);
            tree.verify()?;
        }

        assert_eq!(tree.height(), 1);
        assert_eq!(tree.get(&99)?, Some(rid(99)));
        assert_eq!(tree.get(&0)?, None);
        Ok(())
    }

    #[test]
    fn test_delete_from_both_ends_and_middle() -> Result<()> {
        let mut tree = num_tree(TreeConfig::new(5))?;
        for k in 0..120u64 {
            tree.insert(k, rid(k))?;
        }

        let order: Vec<u64> = (0..40).rev().chain(80..120).chain(40..60).collect();
        for k in &order {
            assert!(tree.delete(k)?);
        }
        tree.verify()?;
        assert_eq!(keys_from(&mut tree, 0)?, (60..80).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn test_deleted_nodes_are_freed() -> Result<()> {
        let mut tree = num_tree(TreeConfig::new(4))?;
        for k in 0..100u64 {
            tree.insert(k, rid(k))?;
        }
        for k in 0..100u64 {
            tree.delete(&k)?;
        }
        let stats = tree.verify()?;
        assert_eq!(stats.node_count, 1);

        let blocks = tree.store().records().block_store();
        // Metadata block plus one root leaf remain in use
        assert_eq!(blocks.block_count() - blocks.free_count(), 2);
        Ok(())
    }

    #[test]
    fn test_reopen_keeps_root() -> Result<()> {
        let mut tree = num_tree(TreeConfig::new(4))?;
        for k in 0..50u64 {
            tree.insert(k, rid(k))?;
        }
        let height = tree.height();
        let records = tree.into_store().into_inner();

        let nodes = DiskNodeManager::new(records, U64Serializer, RecordIdSerializer)?;
        let mut tree: NumTree = Tree::open(nodes, TreeConfig::new(4))?;
        assert_eq!(tree.height(), height);
        assert_eq!(tree.get(&42)?, Some(rid(42)));
        Ok(())
    }

    #[test]
    fn test_reopen_with_other_key_mode_rejected() -> Result<()> {
        let mut tree = num_tree(TreeConfig::new(4).allow_duplicates(true))?;
        tree.insert(1, rid(1))?;
        tree.insert(1, rid(2))?;
        let records = tree.into_store().into_inner();

        let nodes = DiskNodeManager::new(records, U64Serializer, RecordIdSerializer)?;
        let reopened: Result<NumTree> = Tree::open(nodes, TreeConfig::new(4));
        let Err(err) = reopened else {
            panic!("unique open of a duplicate-key tree succeeded");
        };
        assert!(matches!(err, StorageError::InvalidOperation(_)));
        Ok(())
    }

    #[test]
    fn test_custom_comparer() -> Result<()> {
        let nodes = DiskNodeManager::new(records()?, U64Serializer, RecordIdSerializer)?;
        let descending = |a: &u64, b: &u64| b.cmp(a);
        let mut tree = Tree::with_comparer(nodes, TreeConfig::new(4), descending)?;
        for k in 0..20u64 {
            tree.insert(k, rid(k))?;
        }

        let keys: Vec<u64> = tree
            .larger_than_or_equal_to(&5)?
            .map(|e| e.map(|(k, _)| k))
            .collect::<Result<_>>()?;
        assert_eq!(keys, vec![5, 4, 3, 2, 1, 0]);
        tree.verify()?;
        Ok(())
    }

    #[test]
    fn test_snapshot_shape() -> Result<()> {
        let mut tree = num_tree(TreeConfig::new(3))?;
        for k in 0..4u64 {
            tree.insert(k, rid(k))?;
        }

        let snapshot = tree.snapshot()?;
        assert!(!snapshot.is_leaf);
        assert_eq!(snapshot.keys, vec!["2".to_string()]);
        assert_eq!(snapshot.children.len(), 2);
        assert_eq!(snapshot.children[1].keys, vec!["2".to_string(), "3".to_string()]);

        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"isLeaf\":false"));
        Ok(())
    }

    #[test]
    fn test_verify_detects_broken_sibling_link() -> Result<()> {
        let mut tree = num_tree(TreeConfig::new(3))?;
        for k in 0..10u64 {
            tree.insert(k, rid(k))?;
        }

        let mut leftmost = tree.root_id();
        while let Node::Branch(branch) = tree.store.find_node(leftmost)? {
            leftmost = branch.children[0];
        }
        let (mut first, _) = tree.seek_leaf(None)?;
        first.next = None;
        tree.store.update_node(leftmost, &Node::Leaf(first))?;
        assert!(tree.verify().unwrap_err().is_corruption());
        Ok(())
    }
}
