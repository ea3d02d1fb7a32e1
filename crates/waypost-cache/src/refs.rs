//! # References
//!
//! Two ways to share a primary block:
//!
//! - A lightweight [`Ref`]: a token that accounts for one increment of the
//!   target's refcount. It is deliberately not `Clone`/`Copy` — duplication
//!   goes through `ref_duplicate` and disposal through `ref_release`, so the
//!   count can never silently drift.
//! - A reified ref *block*: a pool cell standing in for the primary, used
//!   when the reference itself must sit on a queue (a block can be on at
//!   most one list). Recycling the ref block releases its count.
//!
//! An egress ref block also remembers the cache entry it was queued for, by
//! handle; its destructor clears `LOCALLY_QUEUED` and re-pends the entry,
//! which is how the FSM observes that the CLA consumed the reference.

use crate::bblock::DeliveryPolicy;
use crate::cache;
use crate::pool::{BlockId, Handle, PoolInner};

/// Lightweight reference to a primary block; holds no pool memory.
#[must_use = "dropping a Ref without ref_release leaks a refcount"]
#[derive(Debug)]
pub struct Ref {
    pub(crate) target: BlockId,
}

impl Ref {
    pub fn target(&self) -> BlockId {
        self.target
    }
}

/// Pool-resident reified reference.
pub struct RefBlock {
    pub target: BlockId,
    /// Cache entry this reference was queued on behalf of, if any.
    pub entry: Option<Handle>,
}

impl PoolInner {
    /// Create a new reference, incrementing the target's refcount.
    pub fn ref_create(&mut self, block: BlockId) -> Ref {
        let target = self.resolve(block);
        self.refcount_inc(target);
        Ref { target }
    }

    /// Wrap an already-owned count (e.g. the allocation's own) in a `Ref`
    /// without incrementing.
    pub fn ref_adopt(&mut self, block: BlockId) -> Ref {
        let target = self.resolve(block);
        debug_assert!(self.refcount(target) >= 1);
        Ref { target }
    }

    pub fn ref_duplicate(&mut self, r: &Ref) -> Ref {
        self.refcount_inc(r.target);
        Ref { target: r.target }
    }

    /// Release a reference; at zero the target is recycled.
    pub fn ref_release(&mut self, r: Ref) {
        self.refcount_dec(r.target);
    }

    /// Allocate a reified ref block for `r`'s target, taking its own count.
    pub fn alloc_ref_block(&mut self, r: &Ref, entry: Option<Handle>) -> Option<BlockId> {
        self.alloc_ref_block_for(r.target, entry)
    }

    /// As [`alloc_ref_block`](Self::alloc_ref_block), addressed by target.
    pub fn alloc_ref_block_for(&mut self, target: BlockId, entry: Option<Handle>) -> Option<BlockId> {
        let target = self.resolve(target);
        let id = self.alloc_ref_cell(RefBlock { target, entry })?;
        self.refcount_inc(target);
        Some(id)
    }
}

/// Destructor for ref blocks, run by the pool collector.
///
/// Releases the held count, and if the owning entry is still live, clears
/// its queued flag (plus custody, for locally-acknowledged bundles — their
/// custody obligation ends at transmission) and re-pends it.
pub(crate) fn ref_block_destruct(inner: &mut PoolInner, rblock: RefBlock) {
    let local_ack = inner
        .primary(rblock.target)
        .map(|p| p.delivery.delivery_policy == DeliveryPolicy::LocalAck)
        .unwrap_or(false);
    inner.refcount_dec(rblock.target);

    if let Some(handle) = rblock.entry {
        if let Some(entry_id) = inner.handle_to_id(handle) {
            let mut clear = cache::FLAG_LOCALLY_QUEUED;
            if local_ack {
                clear |= cache::FLAG_LOCAL_CUSTODY
                    | cache::FLAG_ACTION_TIME_WAIT
                    | cache::FLAG_PENDING_FORWARD;
            }
            cache::make_pending_inner(inner, entry_id, 0, clear);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{AllocPriority, BlockState, Pool};
    use std::sync::Arc;
    use waypost_common::{DtnTime, SimClock};

    fn test_pool() -> Pool {
        Pool::with_blocks(16, Arc::new(SimClock::new(DtnTime::from_ms(0))))
    }

    #[test]
    fn refcount_equals_outstanding_refs_plus_ref_blocks() {
        let pool = test_pool();
        let mut inner = pool.lock();
        let pri = inner.alloc_primary(AllocPriority::Med).unwrap();
        assert_eq!(inner.refcount(pri), 1);

        let r1 = inner.ref_adopt(pri);
        let r2 = inner.ref_duplicate(&r1);
        assert_eq!(inner.refcount(pri), 2);

        let rblk = inner.alloc_ref_block(&r1, None).unwrap();
        assert_eq!(inner.refcount(pri), 3);

        // Ref blocks dereference transparently.
        assert!(inner.primary(rblk).is_some());
        assert_eq!(inner.resolve(rblk), pri);

        inner.recycle_block(rblk);
        inner.collect();
        assert_eq!(inner.refcount(pri), 2);

        inner.ref_release(r2);
        assert_eq!(inner.refcount(pri), 1);
        inner.ref_release(r1);
        inner.collect();
        assert_eq!(inner.state_of(pri), BlockState::Free);
    }

    #[test]
    fn releasing_last_ref_recycles_target() {
        let pool = test_pool();
        let mut inner = pool.lock();
        let pri = inner.alloc_primary(AllocPriority::Med).unwrap();
        let r = inner.ref_adopt(pri);
        inner.ref_release(r);
        assert_eq!(inner.state_of(pri), BlockState::Recycled);
        inner.collect();
        assert_eq!(inner.state_of(pri), BlockState::Free);
    }
}


