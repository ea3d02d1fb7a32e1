//! # Subqs
//!
//! A subq is the pool's FIFO of blocks, with monotone push/pull counters so
//! depth is always `push_count - pull_count` even while both sides move.
//! A [`SubqWork`] adds a depth limit; the blocking waits that honor the limit
//! live on the pool, which owns the lock and condition variable.
//!
//! These operations assume the pool lock is already held.

use std::collections::VecDeque;

use crate::pool::BlockId;

/// FIFO of blocks with push/pull accounting.
#[derive(Debug, Default)]
pub struct Subq {
    queue: VecDeque<BlockId>,
    push_count: u32,
    pull_count: u32,
}

impl Subq {
    pub fn new() -> Self {
        Subq::default()
    }

    /// Current depth. Counters are monotone; only the difference matters.
    pub fn depth(&self) -> u32 {
        self.push_count.wrapping_sub(self.pull_count)
    }

    pub fn push_count(&self) -> u32 {
        self.push_count
    }

    pub fn pull_count(&self) -> u32 {
        self.pull_count
    }

    pub fn push_single(&mut self, block: BlockId) {
        self.queue.push_back(block);
        self.push_count = self.push_count.wrapping_add(1);
    }

    pub fn pull_single(&mut self) -> Option<BlockId> {
        let block = self.queue.pop_front()?;
        self.pull_count = self.pull_count.wrapping_add(1);
        Some(block)
    }

    /// Splice the entire contents of `src` onto the tail of `self`.
    pub fn move_all(&mut self, src: &mut Subq) -> u32 {
        let moved = src.depth();
        if moved > 0 {
            self.queue.append(&mut src.queue);
            src.pull_count = src.pull_count.wrapping_add(moved);
            self.push_count = self.push_count.wrapping_add(moved);
        }
        moved
    }

    /// Splice a plain block list into `self`. Plain lists carry no counters,
    /// so the count comes from the list itself.
    pub fn merge_list(&mut self, list: &mut VecDeque<BlockId>) -> u32 {
        let moved = list.len() as u32;
        self.queue.append(list);
        self.push_count = self.push_count.wrapping_add(moved);
        moved
    }

    /// Empty the queue, handing every block back for recycling.
    pub fn drop_all(&mut self) -> Vec<BlockId> {
        let dropped: Vec<BlockId> = self.queue.drain(..).collect();
        self.pull_count = self.pull_count.wrapping_add(dropped.len() as u32);
        dropped
    }
}

/// A subq with a depth limit, as embedded in each flow direction.
///
/// A disabled subq has limit 0: pushes are refused and the contents drained.
#[derive(Debug, Default)]
pub struct SubqWork {
    pub base: Subq,
    pub depth_limit: u32,
}

impl SubqWork {
    pub fn new(depth_limit: u32) -> Self {
        SubqWork {
            base: Subq::new(),
            depth_limit,
        }
    }

    /// Would `quantity` more blocks fit right now?
    pub fn has_space(&self, quantity: u32) -> bool {
        self.base.depth() + quantity <= self.depth_limit
    }

    /// Are `quantity` blocks available right now?
    pub fn has_fill(&self, quantity: u32) -> bool {
        self.base.depth() >= quantity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[u32]) -> Vec<BlockId> {
        raw.iter().map(|&i| BlockId::from_raw(i)).collect()
    }

    #[test]
    fn fifo_order_is_preserved() {
        let mut q = Subq::new();
        for id in ids(&[1, 2, 3]) {
            q.push_single(id);
        }
        assert_eq!(q.depth(), 3);
        assert_eq!(q.pull_single(), Some(BlockId::from_raw(1)));
        assert_eq!(q.pull_single(), Some(BlockId::from_raw(2)));
        assert_eq!(q.pull_single(), Some(BlockId::from_raw(3)));
        assert_eq!(q.pull_single(), None);
        assert_eq!(q.depth(), 0);
    }

    #[test]
    fn counters_survive_wraparound() {
        let mut q = Subq::new();
        q.push_count = u32::MAX;
        q.pull_count = u32::MAX;
        q.push_single(BlockId::from_raw(9));
        assert_eq!(q.depth(), 1);
        assert_eq!(q.pull_single(), Some(BlockId::from_raw(9)));
        assert_eq!(q.depth(), 0);
    }

    #[test]
    fn move_all_updates_both_counters() {
        let mut src = Subq::new();
        let mut dst = Subq::new();
        for id in ids(&[4, 5]) {
            src.push_single(id);
        }
        assert_eq!(dst.move_all(&mut src), 2);
        assert_eq!(src.depth(), 0);
        assert_eq!(dst.depth(), 2);
        assert_eq!(dst.pull_single(), Some(BlockId::from_raw(4)));
    }

    #[test]
    fn merge_list_counts_the_source() {
        let mut dst = Subq::new();
        let mut list: VecDeque<BlockId> = ids(&[7, 8, 9]).into();
        assert_eq!(dst.merge_list(&mut list), 3);
        assert!(list.is_empty());
        assert_eq!(dst.depth(), 3);
    }

    #[test]
    fn drop_all_drains_and_accounts() {
        let mut q = Subq::new();
        for id in ids(&[1, 2]) {
            q.push_single(id);
        }
        let dropped = q.drop_all();
        assert_eq!(dropped, ids(&[1, 2]));
        assert_eq!(q.depth(), 0);
        assert_eq!(q.pull_count(), 2);
    }

    #[test]
    fn workitem_space_and_fill() {
        let mut w = SubqWork::new(2);
        assert!(w.has_space(2));
        assert!(!w.has_space(3));
        w.base.push_single(BlockId::from_raw(1));
        w.base.push_single(BlockId::from_raw(2));
        assert!(!w.has_space(1));
        assert!(w.has_fill(2));
        assert!(!w.has_fill(3));
    }
}


