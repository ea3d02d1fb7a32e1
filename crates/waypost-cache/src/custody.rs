//! # Custody engine
//!
//! Ingress decisions for received bundles (store, acknowledge, or absorb as
//! a custody signal), custodian bookkeeping on the bundle's tracking block,
//! and DACS aggregation: opening a custody-signal bundle toward a previous
//! custodian, appending sequence numbers during its open window, finalizing
//! it into an ordinary outbound bundle, and applying inbound signals back
//! onto held entries.
//!
//! Duplicate detection keys on a CRC-32C of the bundle identity with a salt;
//! DACS aggregation keys on flow + previous custodian with a different salt
//! so the two namespaces cannot collide for identical EIDs.

use crc::{Crc, CRC_32_ISCSI};
use tracing::{debug, warn};
use waypost_common::block::{bundle_flags, CanonicalData};
use waypost_common::{
    AdminRecord, BlockType, CanonicalHeader, CreationTimestamp, CrcType, CustodyAcceptPayload,
    DtnTime, IpnAddr, PrimaryFields,
};

use crate::bblock::{
    canonical_drop_encode, export_bundle, primary_append, primary_locate_canonical, DeliveryPolicy,
};
use crate::cache::{
    make_pending_inner, CacheState, DacsPending, Disposition, EntryBlock, DACS_LIFETIME_MS,
    DACS_OPEN_TIME_MS, FAST_RETRY_TIME_MS, FLAG_ACTION_TIME_WAIT, FLAG_ACTIVITY,
    FLAG_LOCAL_CUSTODY, FLAG_PENDING_FORWARD,
};
use crate::fsm::{self, EntryState};
use crate::pool::{BlockId, PoolInner};

/// Sequence numbers one custody signal payload can aggregate.
pub const MAX_SEQ_PER_PAYLOAD: usize = 16;

const HASH_SALT_DACS: u32 = 0x3126_c0cf;
const HASH_SALT_BUNDLE: u32 = 0x7739_ae76;

const HASH_ALGORITHM: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Identity hash for duplicate detection and ACK lookup: flow + sequence.
pub fn bundle_hash(flow_id: &IpnAddr, sequence: u64) -> u64 {
    let mut digest = HASH_ALGORITHM.digest();
    digest.update(&flow_id.hash_bytes());
    digest.update(&sequence.to_le_bytes());
    digest.update(&HASH_SALT_BUNDLE.to_le_bytes());
    digest.finalize() as u64
}

/// Aggregation hash for open custody signals: flow + previous custodian,
/// no sequence (one signal aggregates many).
pub fn dacs_hash(flow_id: &IpnAddr, custodian: &IpnAddr) -> u64 {
    let mut digest = HASH_ALGORITHM.digest();
    digest.update(&flow_id.hash_bytes());
    digest.update(&custodian.hash_bytes());
    digest.update(&HASH_SALT_DACS.to_le_bytes());
    digest.finalize() as u64
}

/// Per-operation working record for one custody decision.
#[derive(Debug, Default, Clone, Copy)]
pub struct CustodianInfo {
    pub flow_id: IpnAddr,
    pub custodian_id: IpnAddr,
    /// Tracking block inserted by this node, if any.
    pub this_cblk: Option<BlockId>,
    /// Tracking block found on the inbound bundle, if any.
    pub prev_cblk: Option<BlockId>,
    pub eid_hash: u64,
    pub sequence_num: u64,
    pub final_dest_node: u64,
    pub store_entry: Option<BlockId>,
}

/// Pull identity and custody facts off an inbound primary block. A custody
/// tracking block found on the bundle is re-typed to previous-custodian;
/// its custodian EID is who we will acknowledge.
fn init_info_from_primary(inner: &mut PoolInner, pri_id: BlockId) -> CustodianInfo {
    let mut info = CustodianInfo::default();
    if let Some(pri) = inner.primary(pri_id) {
        info.flow_id = pri.fields.source;
        info.sequence_num = pri.fields.timestamp.sequence;
        info.final_dest_node = pri.fields.destination.node;
    }

    info.prev_cblk = primary_locate_canonical(inner, pri_id, BlockType::CustodyTracking);
    if let Some(cblk_id) = info.prev_cblk {
        let custodian = match inner.canonical(cblk_id) {
            Some(cblk) => match &cblk.data {
                CanonicalData::CustodyTracking { current_custodian } => Some(*current_custodian),
                _ => None,
            },
            None => None,
        };
        if let Some(custodian) = custodian {
            info.custodian_id = custodian;
            if let Some(cblk) = inner.canonical_mut(cblk_id) {
                cblk.header.block_type = BlockType::PreviousCustodian;
                cblk.data = CanonicalData::PreviousCustodian {
                    current_custodian: custodian,
                };
            }
            // The block changed logically, so its cached encoding is stale.
            canonical_drop_encode(inner, cblk_id);
        }
    }
    info
}

/// Duplicate lookup by identity hash. A hit marks the entry active.
fn find_existing_bundle(inner: &mut PoolInner, state: &mut CacheState, info: &mut CustodianInfo) -> bool {
    info.eid_hash = bundle_hash(&info.flow_id, info.sequence_num);
    let found = state.bundle_index.search(info.eid_hash, |slot| {
        inner.entry(slot).is_some_and(|entry| {
            entry.flow_seq_copy == info.sequence_num && entry.flow_id_copy == info.flow_id
        })
    });
    if let Some(entry_id) = found {
        info.store_entry = Some(entry_id);
        if let Some(entry) = inner.entry_mut(entry_id) {
            entry.flags |= FLAG_ACTIVITY;
        }
    }
    found.is_some()
}

pub(crate) fn dacs_entry_matches(
    inner: &PoolInner,
    slot: BlockId,
    flow_id: &IpnAddr,
    custodian: &IpnAddr,
) -> bool {
    let Some(entry) = inner.entry(slot) else {
        return false;
    };
    debug_assert_eq!(entry.state, EntryState::GenerateDacs);
    let Some(dacs) = entry.dacs else {
        return false;
    };
    if dacs.prev_custodian_id != *custodian {
        return false;
    }
    dacs_payload(inner, dacs.payload_block)
        .map(|payload| payload.flow_source_eid == *flow_id)
        .unwrap_or(false)
}

/// The custody-accept payload carried by a canonical block, if that is what
/// the block holds.
pub(crate) fn dacs_payload<'a>(
    inner: &'a PoolInner,
    cblk_id: BlockId,
) -> Option<&'a CustodyAcceptPayload> {
    match &inner.canonical(cblk_id)?.data {
        CanonicalData::Admin(AdminRecord::CustodyAccept(payload)) => Some(payload),
        _ => None,
    }
}

/// Find an open custody signal to aggregate into.
fn find_pending_dacs(inner: &PoolInner, state: &CacheState, info: &mut CustodianInfo) -> bool {
    info.eid_hash = dacs_hash(&info.flow_id, &info.custodian_id);
    let found = state.dacs_index.search(info.eid_hash, |slot| {
        dacs_entry_matches(inner, slot, &info.flow_id, &info.custodian_id)
    });
    info.store_entry = found;
    found.is_some()
}

/// Build an empty custody-signal bundle: admin record, must-not-fragment,
/// CRC-16, sourced and reported by this node. Returns the primary and the
/// payload canonical block.
fn create_dacs(
    inner: &mut PoolInner,
    state: &mut CacheState,
    now: DtnTime,
) -> Option<(BlockId, BlockId)> {
    let pblk = inner.alloc_primary(crate::pool::AllocPriority::Med)?;
    {
        let pri = inner.primary_mut(pblk)?;
        pri.fields = PrimaryFields {
            flags: bundle_flags::IS_ADMIN_RECORD | bundle_flags::MUST_NOT_FRAGMENT,
            crc_type: CrcType::Crc16,
            destination: IpnAddr::NULL,
            source: state.self_addr,
            report_to: state.self_addr,
            timestamp: CreationTimestamp {
                time: now.ms(),
                sequence: state.generated_dacs_seq,
            },
            lifetime: DACS_LIFETIME_MS,
        };
        pri.delivery.delivery_policy = DeliveryPolicy::LocalAck;
        pri.delivery.local_retx_interval = FAST_RETRY_TIME_MS;
        pri.delivery.ingress_time = now;
    }
    state.generated_dacs_seq += 1;

    let Some(cblk) = inner.alloc_canonical() else {
        warn!("out of blocks for custody signal payload");
        inner.recycle_block(pblk);
        return None;
    };
    {
        let canonical = inner.canonical_mut(cblk)?;
        canonical.header = CanonicalHeader {
            block_type: BlockType::CustodyAcceptPayload,
            block_num: 1,
            flags: 0,
            crc_type: CrcType::Crc16,
        };
        canonical.data = CanonicalData::Admin(AdminRecord::CustodyAccept(
            CustodyAcceptPayload::default(),
        ));
    }
    primary_append(inner, pblk, cblk);
    Some((pblk, cblk))
}

/// Open a new custody-signal aggregation toward `info.custodian_id` and
/// index it for future appends.
fn open_dacs(inner: &mut PoolInner, state: &mut CacheState, info: &mut CustodianInfo, now: DtnTime) {
    let Some(entry_id) = inner.alloc_entry(EntryBlock::new(state.flow_id)) else {
        warn!("out of blocks for custody signal entry");
        return;
    };
    let Some((pblk, payload_cblk)) = create_dacs(inner, state, now) else {
        inner.recycle_block(entry_id);
        return;
    };

    let sequence = {
        let pri = match inner.primary_mut(pblk) {
            Some(pri) => pri,
            None => return,
        };
        pri.fields.destination = info.custodian_id;
        pri.delivery.committed_storage_id = Some(u64::from(entry_id.raw()) + 1);
        pri.fields.timestamp.sequence
    };
    if let Some(CanonicalData::Admin(AdminRecord::CustodyAccept(payload))) =
        inner.canonical_mut(payload_cblk).map(|c| &mut c.data)
    {
        payload.flow_source_eid = info.flow_id;
    }

    let refptr = inner.ref_adopt(pblk);
    {
        let Some(entry) = inner.entry_mut(entry_id) else {
            return;
        };
        entry.state = EntryState::GenerateDacs;
        entry.flow_id_copy = state.self_addr;
        entry.flow_seq_copy = sequence;
        entry.refptr = Some(refptr);
        entry.action_time = now.offset(DACS_OPEN_TIME_MS);
        entry.expire_time = now.offset(DACS_LIFETIME_MS);
        entry.eid_hash = info.eid_hash;
        entry.dest_node = info.custodian_id.node;
        entry.dacs = Some(DacsPending {
            prev_custodian_id: info.custodian_id,
            payload_block: payload_cblk,
        });
    }
    state.fsm_enter_count[EntryState::GenerateDacs.index()] += 1;
    state.dacs_index.insert(info.eid_hash, entry_id);
    state.dest_eid_index.insert(info.custodian_id.node, entry_id);
    make_pending_inner(
        inner,
        entry_id,
        FLAG_ACTIVITY | FLAG_LOCAL_CUSTODY | FLAG_ACTION_TIME_WAIT,
        0,
    );
    info.store_entry = Some(entry_id);
    debug!(
        custodian = %info.custodian_id,
        flow = %info.flow_id,
        "opened custody signal aggregation"
    );
}

/// Append one sequence number to an open custody signal; duplicates are
/// ignored, and a full payload finalizes immediately.
fn append_dacs(inner: &mut PoolInner, state: &mut CacheState, info: &CustodianInfo) {
    let Some(entry_id) = info.store_entry else {
        return;
    };
    let Some(payload_block) = inner.entry(entry_id).and_then(|e| e.dacs).map(|d| d.payload_block)
    else {
        return;
    };

    let mut appended = false;
    let mut full = false;
    if let Some(CanonicalData::Admin(AdminRecord::CustodyAccept(payload))) =
        inner.canonical_mut(payload_block).map(|c| &mut c.data)
    {
        // A retransmitted duplicate can arrive while its ACK is still open.
        if !payload.contains(info.sequence_num) && payload.num_entries() < MAX_SEQ_PER_PAYLOAD {
            payload.sequence_nums.push(info.sequence_num);
            appended = true;
        }
        full = payload.num_entries() == MAX_SEQ_PER_PAYLOAD;
    }
    if appended {
        canonical_drop_encode(inner, payload_block);
    }
    if full {
        finalize_dacs(state, inner, entry_id);
        make_pending_inner(inner, entry_id, 0, FLAG_ACTION_TIME_WAIT);
    }
}

/// Close an open custody signal to further appends. The entry then behaves
/// like any outbound bundle.
pub(crate) fn finalize_dacs(state: &mut CacheState, inner: &mut PoolInner, entry_id: BlockId) {
    let Some(entry) = inner.entry(entry_id) else {
        return;
    };
    let hash = entry.eid_hash;
    if state.dacs_index.is_member(hash, entry_id) {
        state.dacs_index.extract(hash, entry_id);
    }
}

/// Acknowledge the previous custodian recorded on the bundle: locate or
/// open the matching custody-signal aggregation and add this sequence
/// number.
fn ack_tracking_block(inner: &mut PoolInner, state: &mut CacheState, info: &CustodianInfo, now: DtnTime) {
    let Some(prev_cblk) = info.prev_cblk else {
        return;
    };
    // Re-read the custodian from the tracking block itself: once custody
    // processing has stamped the new tracking block, info.custodian_id
    // already names this node.
    let custodian = match inner.canonical(prev_cblk).map(|cblk| &cblk.data) {
        Some(CanonicalData::PreviousCustodian { current_custodian })
        | Some(CanonicalData::CustodyTracking { current_custodian }) => *current_custodian,
        _ => return,
    };
    let mut dacs_info = CustodianInfo {
        flow_id: info.flow_id,
        custodian_id: custodian,
        sequence_num: info.sequence_num,
        final_dest_node: info.final_dest_node,
        ..CustodianInfo::default()
    };
    if !find_pending_dacs(inner, state, &mut dacs_info) {
        open_dacs(inner, state, &mut dacs_info, now);
    }
    append_dacs(inner, state, &dacs_info);
}

/// Append a fresh custody tracking block to a bundle this node is taking
/// custody of.
fn insert_tracking_block(inner: &mut PoolInner, pri_id: BlockId, info: &mut CustodianInfo) {
    let crc_type = match inner.primary(pri_id) {
        Some(pri) => pri.fields.crc_type,
        None => return,
    };
    let Some(cblk) = inner.alloc_canonical() else {
        warn!("out of blocks for custody tracking block");
        return;
    };
    {
        let Some(canonical) = inner.canonical_mut(cblk) else {
            return;
        };
        canonical.header = CanonicalHeader {
            block_type: BlockType::CustodyTracking,
            block_num: BlockType::CUSTODY_TRACKING_CODE,
            flags: 0,
            crc_type,
        };
        canonical.data = CanonicalData::CustodyTracking {
            current_custodian: IpnAddr::NULL,
        };
    }
    primary_append(inner, pri_id, cblk);
    info.this_cblk = Some(cblk);
}

/// Stamp this node as the current custodian on the freshly inserted
/// tracking block.
fn update_tracking_block(inner: &mut PoolInner, state: &CacheState, info: &mut CustodianInfo) {
    let Some(cblk_id) = info.this_cblk else {
        return;
    };
    if let Some(canonical) = inner.canonical_mut(cblk_id) {
        canonical.data = CanonicalData::CustodyTracking {
            current_custodian: state.self_addr,
        };
    }
    canonical_drop_encode(inner, cblk_id);
    info.custodian_id = state.self_addr;
}

/// Custody handling for a bundle being stored under full tracking: local
/// deliveries need no ack bundle, relayed traffic gets this node stamped as
/// custodian via a fresh tracking block.
fn process_custody(
    inner: &mut PoolInner,
    state: &CacheState,
    pri_id: BlockId,
    info: &mut CustodianInfo,
) {
    let is_local = info.final_dest_node == state.self_addr.node;
    if is_local {
        if let Some(pri) = inner.primary_mut(pri_id) {
            pri.delivery.delivery_policy = DeliveryPolicy::LocalAck;
        }
    } else {
        insert_tracking_block(inner, pri_id, info);
    }
    if info.this_cblk.is_some() {
        update_tracking_block(inner, state, info);
    }
}

/// Apply an inbound custody signal: every acknowledged sequence clears
/// local custody on its matching entry and re-pends it toward deletion.
fn process_remote_dacs(
    inner: &mut PoolInner,
    state: &mut CacheState,
    payload: &CustodyAcceptPayload,
) {
    for &sequence in &payload.sequence_nums {
        let mut info = CustodianInfo {
            flow_id: payload.flow_source_eid,
            sequence_num: sequence,
            ..CustodianInfo::default()
        };
        if find_existing_bundle(inner, state, &mut info) {
            debug!(sequence, flow = %info.flow_id, "custody acknowledged");
            if let Some(entry_id) = info.store_entry {
                make_pending_inner(
                    inner,
                    entry_id,
                    0,
                    FLAG_LOCAL_CUSTODY | FLAG_ACTION_TIME_WAIT | FLAG_PENDING_FORWARD,
                );
            }
        }
    }
}

/// If `qblk` is an administrative bundle carrying a custody-accept payload,
/// absorb it and report true.
fn check_dacs(inner: &mut PoolInner, state: &mut CacheState, qblk: BlockId) -> bool {
    let is_admin = inner
        .primary(qblk)
        .map(|pri| pri.fields.is_admin_record())
        .unwrap_or(false);
    if !is_admin {
        return false;
    }
    let Some(cblk) = primary_locate_canonical(inner, qblk, BlockType::CustodyAcceptPayload) else {
        return false;
    };
    let Some(payload) = dacs_payload(inner, cblk).cloned() else {
        return false;
    };
    process_remote_dacs(inner, state, &payload);
    true
}

/// Full ingress decision for one block pulled off the storage flow.
///
/// The block is consumed: stored under a new entry, or recycled after being
/// recognized as a duplicate, an inbound custody signal, or garbage.
pub(crate) fn ingest_block(
    inner: &mut PoolInner,
    state: &mut CacheState,
    qblk: BlockId,
    now: DtnTime,
) -> Disposition {
    if inner.primary(qblk).is_none() {
        // Only primary blocks are storable.
        state.discard_count += 1;
        inner.recycle_block(qblk);
        return Disposition::Discarded;
    }

    let mut info = init_info_from_primary(inner, qblk);

    if find_existing_bundle(inner, state, &mut info) {
        // Retransmits and lost ACKs make duplicates normal, not errors.
        debug!(sequence = info.sequence_num, flow = %info.flow_id, "duplicate bundle");
        ack_tracking_block(inner, state, &info, now);
        inner.recycle_block(qblk);
        return Disposition::Duplicate;
    }

    if check_dacs(inner, state, qblk) {
        inner.recycle_block(qblk);
        return Disposition::DacsProcessed;
    }

    store_bundle(inner, state, qblk, &mut info, now)
}

fn store_bundle(
    inner: &mut PoolInner,
    state: &mut CacheState,
    qblk: BlockId,
    info: &mut CustodianInfo,
    now: DtnTime,
) -> Disposition {
    let Some(entry_id) = inner.alloc_entry(EntryBlock::new(state.flow_id)) else {
        warn!("out of blocks for storage entry, discarding bundle");
        state.discard_count += 1;
        inner.recycle_block(qblk);
        return Disposition::Discarded;
    };

    let expire_time = inner
        .primary(qblk)
        .map(|pri| pri.fields.expire_time())
        .unwrap_or(DtnTime::INFINITE);
    let refptr = inner.ref_adopt(qblk);
    let storage_intf = inner.handle_of(state.flow_id);
    {
        let Some(entry) = inner.entry_mut(entry_id) else {
            return Disposition::Discarded;
        };
        entry.refptr = Some(refptr);
        entry.flags = FLAG_LOCAL_CUSTODY | FLAG_ACTIVITY | FLAG_PENDING_FORWARD;
        entry.flow_id_copy = info.flow_id;
        entry.flow_seq_copy = info.sequence_num;
        entry.eid_hash = info.eid_hash;
        entry.dest_node = info.final_dest_node;
        entry.expire_time = expire_time;
        entry.action_time = now;
    }
    state.dest_eid_index.insert(info.final_dest_node, entry_id);
    state.bundle_index.insert(info.eid_hash, entry_id);

    {
        let Some(pri) = inner.primary_mut(qblk) else {
            return Disposition::Discarded;
        };
        pri.delivery.delivery_policy = state.delivery_policy;
        pri.delivery.local_retx_interval = state.local_retx_interval;
        pri.delivery.ingress_time = now;
        pri.delivery.storage_intf = Some(storage_intf);
    }

    if state.delivery_policy == DeliveryPolicy::CustodyTracking {
        process_custody(inner, state, qblk, info);
    }

    let committed = match state.offload.as_mut() {
        None => Some(u64::from(entry_id.raw()) + 1),
        Some(api) => match export_bundle(inner, qblk) {
            Some(bytes) => match api.offload(&bytes) {
                Ok(sid) => {
                    if let Some(entry) = inner.entry_mut(entry_id) {
                        entry.offload_sid = Some(sid);
                    }
                    Some(sid.0)
                }
                Err(err) => {
                    warn!(%err, "offload failed, entry will be discarded");
                    None
                }
            },
            None => None,
        },
    };

    if let Some(sid) = committed {
        if let Some(pri) = inner.primary_mut(qblk) {
            pri.delivery.committed_storage_id = Some(sid);
        }
        if let Some(entry) = inner.entry_mut(entry_id) {
            entry.state = EntryState::Idle;
        }
    }
    let entry_state = inner.entry(entry_id).map(|e| e.state).unwrap_or(EntryState::Undefined);
    state.fsm_enter_count[entry_state.index()] += 1;

    // Acknowledge the previous custodian regardless of how storage was
    // committed; the duplicate path above handles re-acknowledgement.
    ack_tracking_block(inner, state, info, now);

    fsm::execute(inner, state, entry_id, now);
    Disposition::Stored
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashes_use_distinct_salts() {
        let a = IpnAddr::new(20, 2);
        let b = IpnAddr::new(5, 1);
        // Same key material, different purpose, different hash.
        assert_ne!(bundle_hash(&a, 7), dacs_hash(&a, &IpnAddr::new(0, 7)));
        assert_ne!(dacs_hash(&a, &b), bundle_hash(&a, b.node));
    }

    #[test]
    fn bundle_hash_depends_on_both_fields() {
        let flow = IpnAddr::new(20, 2);
        assert_ne!(bundle_hash(&flow, 1), bundle_hash(&flow, 2));
        assert_ne!(
            bundle_hash(&IpnAddr::new(20, 2), 1),
            bundle_hash(&IpnAddr::new(20, 3), 1)
        );
    }
}


