//! # Ordered indices
//!
//! The cache keeps its entries reachable by hash, destination, and due time
//! through ordered multimaps from a `u64` key to entry slots. Duplicate keys
//! are expected (hash collisions, shared destinations, equal timers); a
//! caller-supplied matcher disambiguates within a key's chain, mirroring the
//! insert-resolver scheme of the original intrusive tree.

use std::collections::BTreeMap;
use std::ops::Bound;

use crate::pool::BlockId;

/// Ordered multimap `key → block slots`, duplicate keys chained.
#[derive(Debug, Default)]
pub struct OrdIndex {
    map: BTreeMap<(u64, u32), ()>,
}

impl OrdIndex {
    pub fn new() -> Self {
        OrdIndex::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Insert a value under `key`. Returns false if this exact node is
    /// already a member (the duplicate-rejection arm of the resolver).
    pub fn insert(&mut self, key: u64, value: BlockId) -> bool {
        self.map.insert((key, value.raw()), ()).is_none()
    }

    /// Remove a specific node. Returns whether it was present.
    pub fn extract(&mut self, key: u64, value: BlockId) -> bool {
        self.map.remove(&(key, value.raw())).is_some()
    }

    /// Membership test for one node.
    pub fn is_member(&self, key: u64, value: BlockId) -> bool {
        self.map.contains_key(&(key, value.raw()))
    }

    /// Walk the chain of equal-keyed nodes, returning the first for which
    /// `matcher` reports a full match.
    pub fn search<F>(&self, key: u64, mut matcher: F) -> Option<BlockId>
    where
        F: FnMut(BlockId) -> bool,
    {
        self.iter_key(key).find(|&id| matcher(id))
    }

    /// All values stored under exactly `key`.
    pub fn iter_key(&self, key: u64) -> impl Iterator<Item = BlockId> + '_ {
        self.map
            .range((Bound::Included((key, 0)), Bound::Included((key, u32::MAX))))
            .map(|(&(_, raw), _)| BlockId::from_raw(raw))
    }

    /// The smallest-keyed node with `key <= max_key`, if any.
    pub fn first_at_most(&self, max_key: u64) -> Option<(u64, BlockId)> {
        self.map
            .range(..=(max_key, u32::MAX))
            .next()
            .map(|(&(key, raw), _)| (key, BlockId::from_raw(raw)))
    }

    /// Every `(key, value)` pair in key order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, BlockId)> + '_ {
        self.map
            .iter()
            .map(|(&(key, raw), _)| (key, BlockId::from_raw(raw)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: u32) -> BlockId {
        BlockId::from_raw(raw)
    }

    #[test]
    fn insert_extract_membership() {
        let mut idx = OrdIndex::new();
        assert!(idx.insert(10, id(1)));
        assert!(idx.insert(10, id(2)));
        assert!(!idx.insert(10, id(1)), "same node rejected as duplicate");

        assert!(idx.is_member(10, id(1)));
        assert!(idx.extract(10, id(1)));
        assert!(!idx.is_member(10, id(1)));
        assert!(!idx.extract(10, id(1)));
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn search_walks_duplicate_chain() {
        let mut idx = OrdIndex::new();
        idx.insert(7, id(1));
        idx.insert(7, id(2));
        idx.insert(7, id(3));
        idx.insert(8, id(4));

        let found = idx.search(7, |b| b.raw() == 3);
        assert_eq!(found, Some(id(3)));
        assert_eq!(idx.search(7, |b| b.raw() == 4), None);
    }

    #[test]
    fn first_at_most_orders_by_key() {
        let mut idx = OrdIndex::new();
        idx.insert(50, id(5));
        idx.insert(20, id(2));
        idx.insert(90, id(9));

        assert_eq!(idx.first_at_most(10), None);
        assert_eq!(idx.first_at_most(20), Some((20, id(2))));
        assert_eq!(idx.first_at_most(100), Some((20, id(2))));

        idx.extract(20, id(2));
        assert_eq!(idx.first_at_most(100), Some((50, id(5))));
    }

    #[test]
    fn iter_key_isolates_one_key() {
        let mut idx = OrdIndex::new();
        idx.insert(1, id(1));
        idx.insert(2, id(2));
        idx.insert(2, id(3));
        let under_2: Vec<u32> = idx.iter_key(2).map(|b| b.raw()).collect();
        assert_eq!(under_2, vec![2, 3]);
    }
}


