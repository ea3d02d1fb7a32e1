//! # Per-entry state machine
//!
//! Every storage entry moves through a small FSM, advanced whenever the
//! entry lands on the pending list (flag change, timer due, ref consumed)
//! and serialized under the pool lock:
//!
//! ```text
//! undefined ──► delete            (nothing committed: drop)
//! idle ◄──────► queue             (forward attempt / ref consumed)
//! generate_dacs ──► idle          (open window closed: send like a bundle)
//! idle | queue | generate_dacs ──► delete   (expired, or nothing retains it)
//! ```
//!
//! The transition decision is a pure function of the entry and the clock;
//! enter/exit hooks do the queue pushes, index removals, and reparking.

use tracing::debug;
use waypost_common::DtnTime;

use crate::cache::{
    CacheState, AGE_OUT_TIME_MS, FLAG_ACTION_TIME_WAIT, FLAG_LOCALLY_QUEUED, FLAG_LOCAL_CUSTODY,
    FLAG_PENDING_FORWARD, IDLE_RETRY_TIME_MS,
};
use crate::custody;
use crate::pool::{BlockId, PoolInner};

/// Loop bound for chained transitions of one entry in one evaluation.
const MAX_CHAINED_TRANSITIONS: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Undefined,
    Idle,
    Queue,
    GenerateDacs,
    Delete,
}

impl EntryState {
    pub const COUNT: usize = 5;

    pub fn index(self) -> usize {
        match self {
            EntryState::Undefined => 0,
            EntryState::Idle => 1,
            EntryState::Queue => 2,
            EntryState::GenerateDacs => 3,
            EntryState::Delete => 4,
        }
    }
}

/// Next-state decision. Pure: no side effects, no reparking.
pub fn next_state(entry: &crate::cache::EntryBlock, now: DtnTime) -> EntryState {
    match entry.state {
        // Never committed to storage: nothing worth keeping.
        EntryState::Undefined => EntryState::Delete,
        EntryState::Idle => {
            if now >= entry.expire_time {
                EntryState::Delete
            } else if entry.has(FLAG_LOCAL_CUSTODY)
                && entry.has(FLAG_PENDING_FORWARD)
                && now >= entry.action_time
            {
                EntryState::Queue
            } else if !entry.has(FLAG_LOCAL_CUSTODY)
                && entry.flags & crate::cache::FLAGS_RETENTION == 0
            {
                EntryState::Delete
            } else {
                EntryState::Idle
            }
        }
        EntryState::Queue => {
            if now >= entry.expire_time {
                EntryState::Delete
            } else if !entry.has(FLAG_LOCALLY_QUEUED) {
                // Egress consumed the ref (or the push never stuck).
                EntryState::Idle
            } else {
                EntryState::Queue
            }
        }
        EntryState::GenerateDacs => {
            if now >= entry.expire_time {
                EntryState::Delete
            } else if now >= entry.action_time || !entry.has(FLAG_ACTION_TIME_WAIT) {
                EntryState::Idle
            } else {
                EntryState::GenerateDacs
            }
        }
        EntryState::Delete => EntryState::Delete,
    }
}

/// Advance one entry until its state is stable, then re-park it. Must run
/// under the pool lock; per-entry transitions never interleave.
pub(crate) fn execute(
    inner: &mut PoolInner,
    state: &mut CacheState,
    entry_id: BlockId,
    now: DtnTime,
) {
    let mut guard = 0;
    loop {
        let Some(entry) = inner.entry(entry_id) else {
            return;
        };
        let current = entry.state;
        let next = next_state(entry, now);
        if next == current {
            reschedule(inner, state, entry_id);
            return;
        }
        transition(inner, state, entry_id, current, next, now);
        if next == EntryState::Delete {
            return;
        }
        guard += 1;
        if guard > MAX_CHAINED_TRANSITIONS {
            debug_assert!(false, "entry {entry_id:?} FSM did not stabilize");
            reschedule(inner, state, entry_id);
            return;
        }
    }
}

fn transition(
    inner: &mut PoolInner,
    state: &mut CacheState,
    entry_id: BlockId,
    from: EntryState,
    to: EntryState,
    now: DtnTime,
) {
    state.fsm_exit_count[from.index()] += 1;

    // Exit hooks.
    match from {
        EntryState::Queue => {
            if let Some(entry) = inner.entry_mut(entry_id) {
                entry.flags &= !FLAG_LOCALLY_QUEUED;
            }
        }
        EntryState::GenerateDacs => {
            // Closed to appends; from here on it is a normal outbound
            // bundle wanting a forward attempt right away.
            custody::finalize_dacs(state, inner, entry_id);
            if let Some(entry) = inner.entry_mut(entry_id) {
                entry.flags &= !FLAG_ACTION_TIME_WAIT;
                entry.flags |= FLAG_PENDING_FORWARD;
                entry.action_time = now;
            }
        }
        _ => {}
    }

    if let Some(entry) = inner.entry_mut(entry_id) {
        entry.state = to;
    }
    state.fsm_enter_count[to.index()] += 1;
    debug!(entry = entry_id.raw(), ?from, ?to, "entry transition");

    // Enter hooks.
    match to {
        EntryState::Idle => {
            if from == EntryState::Queue {
                let retx = inner
                    .entry(entry_id)
                    .and_then(|e| e.refptr.as_ref().map(|r| r.target()))
                    .and_then(|target| inner.primary(target))
                    .map(|pri| pri.delivery.local_retx_interval)
                    .unwrap_or(state.local_retx_interval);
                if let Some(entry) = inner.entry_mut(entry_id) {
                    // The queue hook may have scheduled a longer backoff
                    // (no egress, or a block shortage); keep the later.
                    entry.action_time = entry.action_time.max(now.offset(retx));
                    entry.flags |= FLAG_ACTION_TIME_WAIT;
                }
            }
        }
        EntryState::Queue => queue_enter(inner, state, entry_id, now),
        EntryState::Delete => delete_enter(inner, state, entry_id, from),
        EntryState::Undefined | EntryState::GenerateDacs => {}
    }
}

/// Queue entry: push a reified ref onto the egress flow's egress subq for
/// the convergence layer to pull.
fn queue_enter(inner: &mut PoolInner, state: &mut CacheState, entry_id: BlockId, now: DtnTime) {
    // Terminal traffic goes to local delivery; everything else to egress.
    let is_local = inner
        .entry(entry_id)
        .map(|e| e.dest_node == state.self_addr.node)
        .unwrap_or(false);
    let target_flow = if is_local {
        state.delivery_flow.or(state.egress_flow)
    } else {
        state.egress_flow
    };
    let Some(egress_flow) = target_flow else {
        // No interface at all: park on the long retry. An egress coming
        // up re-arms the entry immediately.
        if let Some(entry) = inner.entry_mut(entry_id) {
            entry.action_time = now.offset(IDLE_RETRY_TIME_MS);
        }
        return;
    };

    let target = inner
        .entry(entry_id)
        .and_then(|e| e.refptr.as_ref().map(|r| r.target()));
    let Some(target) = target else {
        return;
    };
    let handle = inner.handle_of(entry_id);
    let Some(rblk) = inner.alloc_ref_block_for(target, Some(handle)) else {
        // Shortage: stay unqueued, the queue eval will fall back to idle.
        if let Some(entry) = inner.entry_mut(entry_id) {
            entry.action_time = now.offset(AGE_OUT_TIME_MS);
        }
        return;
    };

    let pushed = inner
        .flow_mut(egress_flow)
        .map(|flow| {
            flow.egress.base.push_single(rblk);
            true
        })
        .unwrap_or(false);
    if pushed {
        if let Some(entry) = inner.entry_mut(entry_id) {
            entry.flags |= FLAG_LOCALLY_QUEUED;
            entry.flags &= !FLAG_ACTION_TIME_WAIT;
        }
    } else {
        inner.recycle_block(rblk);
    }
}

/// Delete entry: out of every index, release storage and the bundle ref,
/// recycle the entry block. Terminal.
fn delete_enter(inner: &mut PoolInner, state: &mut CacheState, entry_id: BlockId, from: EntryState) {
    if from == EntryState::Undefined {
        state.discard_count += 1;
    }

    let Some(entry) = inner.entry_mut(entry_id) else {
        return;
    };
    let hash = entry.eid_hash;
    let dest = entry.dest_node;
    let park = entry.park_key.take();
    let refptr = entry.refptr.take();
    let offload_sid = entry.offload_sid.take();
    let on_pending = entry.on_pending;
    let parent_flow = entry.parent_flow;

    state.bundle_index.extract(hash, entry_id);
    state.dacs_index.extract(hash, entry_id);
    state.dest_eid_index.extract(dest, entry_id);
    if let Some(key) = park {
        state.time_index.extract(key, entry_id);
    }
    if let Some(sid) = offload_sid {
        if let Some(api) = state.offload.as_mut() {
            api.release(sid);
        }
    }
    if on_pending {
        if let Some(flow) = inner.flow_mut(parent_flow) {
            flow.pending_entries.retain(|&id| id != entry_id);
        }
    }
    if let Some(refptr) = refptr {
        inner.ref_release(refptr);
    }
    inner.recycle_block(entry_id);
}

/// Park a stable entry in the time index under its next-due time.
fn reschedule(inner: &mut PoolInner, state: &mut CacheState, entry_id: BlockId) {
    let Some(entry) = inner.entry(entry_id) else {
        return;
    };
    let key = match entry.state {
        // While queued, only expiry can preempt; the ref consumption comes
        // back through the pending list.
        EntryState::Queue => entry.expire_time.ms(),
        EntryState::GenerateDacs => entry.action_time.ms().min(entry.expire_time.ms()),
        _ => {
            if entry.has(FLAG_LOCAL_CUSTODY) && entry.has(FLAG_PENDING_FORWARD) {
                entry.action_time.ms().min(entry.expire_time.ms())
            } else {
                entry.expire_time.ms()
            }
        }
    };
    let old = entry.park_key;
    if old == Some(key) {
        return;
    }
    if let Some(old_key) = old {
        state.time_index.extract(old_key, entry_id);
    }
    state.time_index.insert(key, entry_id);
    if let Some(entry) = inner.entry_mut(entry_id) {
        entry.park_key = Some(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::EntryBlock;
    use crate::pool::BlockId;
    use waypost_common::DtnTime;

    fn entry_in(state: EntryState, flags: u32, action: u64, expire: u64) -> EntryBlock {
        let mut entry = EntryBlock::new(BlockId::from_raw(0));
        entry.state = state;
        entry.flags = flags;
        entry.action_time = DtnTime::from_ms(action);
        entry.expire_time = DtnTime::from_ms(expire);
        entry
    }

    #[test]
    fn undefined_always_deletes() {
        let entry = entry_in(EntryState::Undefined, 0, 0, u64::MAX);
        assert_eq!(next_state(&entry, DtnTime::from_ms(0)), EntryState::Delete);
    }

    #[test]
    fn idle_queues_when_due_and_forwardable() {
        let flags = FLAG_LOCAL_CUSTODY | FLAG_PENDING_FORWARD;
        let entry = entry_in(EntryState::Idle, flags, 100, 10_000);
        assert_eq!(next_state(&entry, DtnTime::from_ms(99)), EntryState::Idle);
        assert_eq!(next_state(&entry, DtnTime::from_ms(100)), EntryState::Queue);
    }

    #[test]
    fn idle_deletes_on_expiry_even_with_custody() {
        let flags = FLAG_LOCAL_CUSTODY | FLAG_ACTION_TIME_WAIT;
        let entry = entry_in(EntryState::Idle, flags, u64::MAX, 5_000);
        assert_eq!(next_state(&entry, DtnTime::from_ms(5_000)), EntryState::Delete);
    }

    #[test]
    fn idle_deletes_when_nothing_retains_it() {
        let entry = entry_in(EntryState::Idle, 0, u64::MAX, u64::MAX - 1);
        assert_eq!(next_state(&entry, DtnTime::from_ms(0)), EntryState::Delete);
    }

    #[test]
    fn idle_holds_while_custody_and_timer_armed() {
        let flags = FLAG_LOCAL_CUSTODY | FLAG_ACTION_TIME_WAIT;
        let entry = entry_in(EntryState::Idle, flags, u64::MAX, u64::MAX - 1);
        assert_eq!(next_state(&entry, DtnTime::from_ms(0)), EntryState::Idle);
    }

    #[test]
    fn queue_returns_to_idle_once_consumed() {
        let queued = entry_in(
            EntryState::Queue,
            FLAG_LOCAL_CUSTODY | FLAG_LOCALLY_QUEUED,
            0,
            10_000,
        );
        assert_eq!(next_state(&queued, DtnTime::from_ms(1)), EntryState::Queue);

        let consumed = entry_in(EntryState::Queue, FLAG_LOCAL_CUSTODY, 0, 10_000);
        assert_eq!(next_state(&consumed, DtnTime::from_ms(1)), EntryState::Idle);
    }

    #[test]
    fn generate_dacs_closes_at_action_time_or_forced() {
        let flags = FLAG_LOCAL_CUSTODY | FLAG_ACTION_TIME_WAIT;
        let open = entry_in(EntryState::GenerateDacs, flags, 10_000, 86_400_000);
        assert_eq!(
            next_state(&open, DtnTime::from_ms(9_999)),
            EntryState::GenerateDacs
        );
        assert_eq!(
            next_state(&open, DtnTime::from_ms(10_000)),
            EntryState::Idle
        );

        // Forced finalize: the wait flag was cleared early (payload full).
        let forced = entry_in(EntryState::GenerateDacs, FLAG_LOCAL_CUSTODY, 10_000, 86_400_000);
        assert_eq!(next_state(&forced, DtnTime::from_ms(0)), EntryState::Idle);
    }
}


