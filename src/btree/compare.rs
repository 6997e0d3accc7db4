//! Key ordering.

use std::cmp::Ordering;

/// Total order over keys, pluggable per tree
pub trait KeyComparer<K> {
    fn compare(&self, a: &K, b: &K) -> Ordering;
}

/// The key type's own `Ord`.
///
/// Byte-string keys (`Vec<u8>`) order lexicographically, so a prefix sorts
/// before every key that extends it.
#[derive(Debug, Clone, Copy, Default)]
pub struct NaturalOrder;

impl<K: Ord> KeyComparer<K> for NaturalOrder {
    fn compare(&self, a: &K, b: &K) -> Ordering {
        a.cmp(b)
    }
}

impl<K, F> KeyComparer<K> for F
where
    F: Fn(&K, &K) -> Ordering,
{
    fn compare(&self, a: &K, b: &K) -> Ordering {
        self(a, b)
    }
}
