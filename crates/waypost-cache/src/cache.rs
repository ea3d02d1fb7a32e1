//! # Cache state and entries
//!
//! The per-bundle storage entry, the cache-wide state (indices, counters,
//! policies), and the processing loop that the scheduler drives: drain the
//! storage flow's ingress, run the FSM over pended entries, then sweep the
//! time index for due timers.
//!
//! The cache's queues live in an ordinary flow block so the scheduler
//! reaches storage exactly like an interface; the index bookkeeping lives
//! here, outside the arena, keeping cell borrows disjoint.

use std::sync::Arc;

use tracing::debug;
use waypost_common::{DtnTime, IpnAddr};

use crate::bblock::DeliveryPolicy;
use crate::custody;
use crate::flow::FlowEvent;
use crate::fsm::{self, EntryState};
use crate::index::OrdIndex;
use crate::offload::{OffloadApi, StorageId};
use crate::pool::{BlockId, Pool, PoolInner};
use crate::refs::Ref;

// ─── Entry flags ────────────────────────────────────────────────────────────

/// Touched since the last sweep (duplicate seen, lookup hit).
pub const FLAG_ACTIVITY: u32 = 0x01;
/// This node still owes delivery or an acknowledgement upstream.
pub const FLAG_LOCAL_CUSTODY: u32 = 0x02;
/// Parked until `action_time`.
pub const FLAG_ACTION_TIME_WAIT: u32 = 0x04;
/// A reified ref for this entry sits on an egress subq.
pub const FLAG_LOCALLY_QUEUED: u32 = 0x08;
/// A forward attempt is wanted.
pub const FLAG_PENDING_FORWARD: u32 = 0x10;

/// Flags whose presence requires retaining the entry.
pub const FLAGS_RETENTION: u32 = FLAG_ACTION_TIME_WAIT | FLAG_LOCALLY_QUEUED;

// ─── Timing constants ───────────────────────────────────────────────────────

/// Lifetime of a generated custody signal bundle.
pub const DACS_LIFETIME_MS: u64 = 86_400_000;
/// Aggregation window during which an open custody signal accepts appends.
pub const DACS_OPEN_TIME_MS: u64 = 10_000;
/// Retransmit interval for traffic we expect to clear quickly.
pub const FAST_RETRY_TIME_MS: u64 = 3_000;
/// Retransmit interval for parked long-lived traffic.
pub const IDLE_RETRY_TIME_MS: u64 = 3_600_000;
/// Grace period between forward attempts when no egress exists yet.
pub const AGE_OUT_TIME_MS: u64 = 5_000;

// ─── Entry ──────────────────────────────────────────────────────────────────

/// Extra state carried only while an entry aggregates a custody signal.
#[derive(Debug, Clone, Copy)]
pub struct DacsPending {
    pub prev_custodian_id: IpnAddr,
    /// The canonical block holding the custody-accept payload being filled.
    pub payload_block: BlockId,
}

/// Pool-resident per-bundle storage record.
pub struct EntryBlock {
    pub parent_flow: BlockId,
    pub state: EntryState,
    pub flags: u32,
    /// Identity copies for index lookups after the bundle itself is gone.
    pub flow_id_copy: IpnAddr,
    pub flow_seq_copy: u64,
    pub refptr: Option<Ref>,
    pub offload_sid: Option<StorageId>,
    pub action_time: DtnTime,
    pub expire_time: DtnTime,
    /// Key under which this entry sits in the hash index.
    pub eid_hash: u64,
    /// Key under which this entry sits in the destination index.
    pub dest_node: u64,
    /// Key under which this entry is parked in the time index, if parked.
    pub park_key: Option<u64>,
    pub on_pending: bool,
    pub dacs: Option<DacsPending>,
}

impl EntryBlock {
    pub fn new(parent_flow: BlockId) -> Self {
        EntryBlock {
            parent_flow,
            state: EntryState::Undefined,
            flags: 0,
            flow_id_copy: IpnAddr::NULL,
            flow_seq_copy: 0,
            refptr: None,
            offload_sid: None,
            action_time: DtnTime::INFINITE,
            expire_time: DtnTime::INFINITE,
            eid_hash: 0,
            dest_node: 0,
            park_key: None,
            on_pending: false,
            dacs: None,
        }
    }

    pub fn has(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }
}

/// Adjust an entry's flags and put it on its flow's pending list for FSM
/// reevaluation. Safe to call from destructors; a dead entry is a no-op.
pub(crate) fn make_pending_inner(inner: &mut PoolInner, entry_id: BlockId, set: u32, clear: u32) {
    let parent = {
        let Some(entry) = inner.entry_mut(entry_id) else {
            return;
        };
        entry.flags = (entry.flags | set) & !clear;
        if entry.on_pending {
            None
        } else {
            entry.on_pending = true;
            Some(entry.parent_flow)
        }
    };
    if let Some(flow_id) = parent {
        if let Some(flow) = inner.flow_mut(flow_id) {
            flow.pending_entries.push_back(entry_id);
        }
        inner.mark_job_active(flow_id);
    }
}

// ─── Cache ──────────────────────────────────────────────────────────────────

/// What became of one ingested block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// New entry created and admitted to the FSM.
    Stored,
    /// Already held; acknowledged again where appropriate, not re-stored.
    Duplicate,
    /// Was an inbound custody signal; acknowledgements applied.
    DacsProcessed,
    /// Not storable (malformed, exhausted, uncommitted); dropped and counted.
    Discarded,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("pool exhausted while creating cache state")]
    PoolExhausted,
}

pub struct CacheConfig {
    pub self_addr: IpnAddr,
    /// Depth limit of the storage flow's ingress subq.
    pub ingress_limit: u32,
    /// Custody policy applied to stored bundles.
    pub delivery_policy: DeliveryPolicy,
    /// Retransmit interval while waiting on a custody acknowledgement.
    pub local_retx_interval: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            self_addr: IpnAddr::NULL,
            ingress_limit: 64,
            delivery_policy: DeliveryPolicy::CustodyTracking,
            local_retx_interval: FAST_RETRY_TIME_MS,
        }
    }
}

/// Cache-wide bookkeeping, owned by whichever thread drives the scheduler.
pub struct CacheState {
    pub self_addr: IpnAddr,
    pub flow_id: BlockId,
    pub egress_flow: Option<BlockId>,
    /// Where bundles destined to this node are queued instead of egress.
    pub delivery_flow: Option<BlockId>,
    /// Bundle identity hash → entries, for duplicate and ACK lookup.
    pub bundle_index: OrdIndex,
    /// (flow, previous custodian) hash → open custody-signal entries.
    pub dacs_index: OrdIndex,
    /// Destination node → entries.
    pub dest_eid_index: OrdIndex,
    /// Next-due DTN time → parked entries.
    pub time_index: OrdIndex,
    pub generated_dacs_seq: u64,
    pub fsm_enter_count: [u32; EntryState::COUNT],
    pub fsm_exit_count: [u32; EntryState::COUNT],
    pub discard_count: u32,
    pub delivery_policy: DeliveryPolicy,
    pub local_retx_interval: u64,
    pub offload: Option<Box<dyn OffloadApi>>,
}

/// The storage service: a pool plus the cache state driving it.
pub struct Cache {
    pool: Arc<Pool>,
    state: CacheState,
}

/// Point-in-time view of one entry, for inspection and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntrySnapshot {
    pub state: EntryState,
    pub flags: u32,
    pub action_time: DtnTime,
    pub expire_time: DtnTime,
}

impl Cache {
    pub fn new(pool: Arc<Pool>, config: CacheConfig) -> Result<Cache, CacheError> {
        let flow_id = pool
            .with_lock(|inner| inner.alloc_flow(config.ingress_limit, 0))
            .ok_or(CacheError::PoolExhausted)?;
        Ok(Cache {
            pool,
            state: CacheState {
                self_addr: config.self_addr,
                flow_id,
                egress_flow: None,
                delivery_flow: None,
                bundle_index: OrdIndex::new(),
                dacs_index: OrdIndex::new(),
                dest_eid_index: OrdIndex::new(),
                time_index: OrdIndex::new(),
                generated_dacs_seq: 0,
                fsm_enter_count: [0; EntryState::COUNT],
                fsm_exit_count: [0; EntryState::COUNT],
                discard_count: 0,
                delivery_policy: config.delivery_policy,
                local_retx_interval: config.local_retx_interval,
                offload: None,
            },
        })
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    pub fn self_addr(&self) -> IpnAddr {
        self.state.self_addr
    }

    /// The storage flow; ingress traffic lands on its ingress subq.
    pub fn flow_id(&self) -> BlockId {
        self.state.flow_id
    }

    /// Register the flow whose egress subq outbound bundles are queued on.
    pub fn set_egress_flow(&mut self, flow: BlockId) {
        self.state.egress_flow = Some(flow);
    }

    /// Register the flow receiving bundles addressed to this node.
    pub fn set_delivery_flow(&mut self, flow: BlockId) {
        self.state.delivery_flow = Some(flow);
    }

    pub fn set_offload(&mut self, offload: Box<dyn OffloadApi>) {
        self.state.offload = Some(offload);
    }

    pub fn discard_count(&self) -> u32 {
        self.state.discard_count
    }

    pub fn fsm_enter_count(&self, state: EntryState) -> u32 {
        self.state.fsm_enter_count[state.index()]
    }

    pub fn bundle_index_len(&self) -> usize {
        self.state.bundle_index.len()
    }

    pub fn dacs_index_len(&self) -> usize {
        self.state.dacs_index.len()
    }

    pub fn dest_index_len(&self) -> usize {
        self.state.dest_eid_index.len()
    }

    /// Ingest one bundle block immediately (the subq-less path, also used
    /// by tests). The block is consumed either way.
    pub fn ingest(&mut self, block: BlockId) -> Disposition {
        let now = self.pool.now();
        let mut inner = self.pool.lock();
        let disposition = custody::ingest_block(&mut inner, &mut self.state, block, now);
        inner.collect();
        drop(inner);
        self.pool.notify();
        disposition
    }

    /// One scheduler pass: drain ingress, run pended FSMs, sweep timers.
    /// Returns how many work items were handled.
    pub fn process_pending(&mut self) -> usize {
        let now = self.pool.now();
        let mut inner = self.pool.lock();
        let mut handled = 0;

        loop {
            let block = inner
                .flow_mut(self.state.flow_id)
                .and_then(|flow| flow.ingress.base.pull_single());
            let Some(block) = block else {
                break;
            };
            custody::ingest_block(&mut inner, &mut self.state, block, now);
            handled += 1;
        }

        loop {
            let next = inner
                .flow_mut(self.state.flow_id)
                .and_then(|flow| flow.pending_entries.pop_front());
            let Some(entry_id) = next else {
                break;
            };
            match inner.entry_mut(entry_id) {
                Some(entry) => entry.on_pending = false,
                None => continue,
            }
            fsm::execute(&mut inner, &mut self.state, entry_id, now);
            handled += 1;
        }

        while let Some((key, entry_id)) = self.state.time_index.first_at_most(now.ms()) {
            self.state.time_index.extract(key, entry_id);
            match inner.entry_mut(entry_id) {
                Some(entry) => entry.park_key = None,
                None => continue,
            }
            fsm::execute(&mut inner, &mut self.state, entry_id, now);
            handled += 1;
        }

        inner.collect();
        drop(inner);
        self.pool.notify();
        handled
    }

    /// React to a state change of some flow.
    ///
    /// An egress coming up re-arms every held entry that still wants a
    /// forward attempt; down needs nothing here, since dropping the flow's
    /// queues re-pends affected entries through the ref destructors.
    pub fn handle_flow_event(&mut self, flow: BlockId, event: FlowEvent) {
        match event {
            FlowEvent::Up if Some(flow) == self.state.egress_flow => {
                debug!(flow = flow.raw(), "egress up, re-arming held bundles");
                let now = self.pool.now();
                let mut inner = self.pool.lock();
                let parked: Vec<BlockId> =
                    self.state.time_index.iter().map(|(_, id)| id).collect();
                for entry_id in parked {
                    let wants_forward = inner.entry(entry_id).is_some_and(|e| {
                        e.has(FLAG_LOCAL_CUSTODY) && e.has(FLAG_PENDING_FORWARD)
                    });
                    if wants_forward {
                        if let Some(entry) = inner.entry_mut(entry_id) {
                            entry.action_time = now;
                        }
                        make_pending_inner(&mut inner, entry_id, FLAG_ACTIVITY, 0);
                    }
                }
                drop(inner);
                self.pool.notify();
            }
            FlowEvent::Poll => {
                self.process_pending();
            }
            _ => {}
        }
    }

    /// Look up one stored bundle's entry by identity.
    pub fn find_entry(&self, source: IpnAddr, sequence: u64) -> Option<EntrySnapshot> {
        let inner = self.pool.lock();
        let hash = custody::bundle_hash(&source, sequence);
        let entry_id = self.state.bundle_index.search(hash, |slot| {
            inner
                .entry(slot)
                .is_some_and(|e| e.flow_seq_copy == sequence && e.flow_id_copy == source)
        })?;
        let entry = inner.entry(entry_id)?;
        Some(EntrySnapshot {
            state: entry.state,
            flags: entry.flags,
            action_time: entry.action_time,
            expire_time: entry.expire_time,
        })
    }

    /// Sequence numbers aggregated in the open custody signal for
    /// `(flow source, previous custodian)`, if one is open.
    pub fn open_dacs_seqs(&self, flow: IpnAddr, custodian: IpnAddr) -> Option<Vec<u64>> {
        let inner = self.pool.lock();
        let hash = custody::dacs_hash(&flow, &custodian);
        let entry_id = self.state.dacs_index.search(hash, |slot| {
            custody::dacs_entry_matches(&inner, slot, &flow, &custodian)
        })?;
        let payload_block = inner.entry(entry_id)?.dacs?.payload_block;
        custody::dacs_payload(&inner, payload_block).map(|p| p.sequence_nums.clone())
    }
}


