//! # Bundle blocks
//!
//! Pool-resident bundle representation: a primary block owning a list of
//! canonical blocks and a list of encoded CBOR chunks of itself; each
//! canonical block owning its own chunk list plus a non-owning back-pointer
//! to its primary.
//!
//! Encoded chunks are a cache: dropped whenever logical data changes, and
//! regenerated from the logical fields on the next emission.

use std::collections::VecDeque;

use bytes::BytesMut;
use waypost_cbor::bundle::DecodedBundle;
use waypost_cbor::primitives::{BREAK, INDEFINITE_ARRAY};
use waypost_cbor::{encode_canonical, encode_primary};
use waypost_common::block::CanonicalData;
use waypost_common::{BlockType, CanonicalHeader, CrcType, DtnTime, PrimaryFields};

use crate::pool::{AllocPriority, BlockId, Handle, PoolInner, CHUNK_CAPACITY};

/// How a stored bundle's custody is settled.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPolicy {
    /// No custody bookkeeping at all.
    #[default]
    None,
    /// Considered acknowledged once transmitted locally.
    LocalAck,
    /// Full custody tracking; held until a custody signal acknowledges it.
    CustodyTracking,
}

/// Delivery-state bookkeeping carried alongside the logical primary block.
#[derive(Debug, Default, Clone)]
pub struct DeliveryTracking {
    pub delivery_policy: DeliveryPolicy,
    pub ingress_intf: Option<Handle>,
    pub ingress_time: DtnTime,
    pub egress_intf: Option<Handle>,
    pub egress_time: DtnTime,
    pub storage_intf: Option<Handle>,
    /// Nonzero only once safely stored; gates FSM admission.
    pub committed_storage_id: Option<u64>,
    /// Retransmit interval while waiting for a custody acknowledgement.
    pub local_retx_interval: u64,
}

/// Pool-resident primary block.
pub struct PrimaryBlock {
    pub fields: PrimaryFields,
    pub delivery: DeliveryTracking,
    pub cblock_list: VecDeque<BlockId>,
    pub chunk_list: VecDeque<BlockId>,
    /// Cached encoded size of the primary block itself; 0 when invalid.
    pub block_encode_size: usize,
    /// Cached encoded size of the whole bundle; 0 when invalid.
    pub bundle_encode_size: usize,
}

impl PrimaryBlock {
    pub fn new() -> Self {
        PrimaryBlock {
            fields: PrimaryFields::default(),
            delivery: DeliveryTracking::default(),
            cblock_list: VecDeque::new(),
            chunk_list: VecDeque::new(),
            block_encode_size: 0,
            bundle_encode_size: 0,
        }
    }
}

impl Default for PrimaryBlock {
    fn default() -> Self {
        Self::new()
    }
}

/// Pool-resident canonical block.
pub struct CanonicalBlock {
    pub header: CanonicalHeader,
    pub data: CanonicalData,
    pub chunk_list: VecDeque<BlockId>,
    /// Non-owning back-pointer, valid only while on the owner's list.
    pub bundle_ref: Option<BlockId>,
    pub block_encode_size: usize,
    /// Position of the content bytes within the encoded block.
    pub content_offset: usize,
    pub content_len: usize,
}

impl CanonicalBlock {
    pub fn new() -> Self {
        CanonicalBlock {
            header: CanonicalHeader {
                block_type: BlockType::Payload,
                block_num: 0,
                flags: 0,
                crc_type: CrcType::Crc16,
            },
            data: CanonicalData::Payload(bytes::Bytes::new()),
            chunk_list: VecDeque::new(),
            bundle_ref: None,
            block_encode_size: 0,
            content_offset: 0,
            content_len: 0,
        }
    }
}

impl Default for CanonicalBlock {
    fn default() -> Self {
        Self::new()
    }
}

// ─── List operations ────────────────────────────────────────────────────────

/// Place a canonical block into a primary's block list.
///
/// The payload (blockNum 1) goes last per BPv7; anything else goes first.
/// Sets the canonical's back-pointer and invalidates the bundle size cache.
pub fn primary_append(inner: &mut PoolInner, pri_id: BlockId, cblk_id: BlockId) {
    let pri_id = inner.resolve(pri_id);
    let block_num = {
        let Some(cblk) = inner.canonical_mut(cblk_id) else {
            debug_assert!(false, "primary_append on a non-canonical block");
            return;
        };
        debug_assert!(cblk.bundle_ref.is_none(), "canonical already owned");
        cblk.bundle_ref = Some(pri_id);
        cblk.header.block_num
    };
    let Some(pri) = inner.primary_mut(pri_id) else {
        debug_assert!(false, "primary_append on a non-primary block");
        return;
    };
    if block_num == 1 {
        pri.cblock_list.push_back(cblk_id);
    } else {
        pri.cblock_list.push_front(cblk_id);
    }
    pri.bundle_encode_size = 0;
}

/// Find a canonical block by type, scanning in reverse since the payload
/// (the most frequent target) sits at the tail.
pub fn primary_locate_canonical(
    inner: &PoolInner,
    pri_id: BlockId,
    block_type: BlockType,
) -> Option<BlockId> {
    let pri = inner.primary(pri_id)?;
    pri.cblock_list
        .iter()
        .rev()
        .copied()
        .find(|&cblk| {
            inner
                .canonical(cblk)
                .is_some_and(|c| c.header.block_type == block_type)
        })
}

/// Drop any cached encoding of the primary block and the bundle.
pub fn primary_drop_encode(inner: &mut PoolInner, pri_id: BlockId) {
    let pri_id = inner.resolve(pri_id);
    let chunks: Vec<BlockId> = match inner.primary_mut(pri_id) {
        Some(pri) => {
            pri.block_encode_size = 0;
            pri.bundle_encode_size = 0;
            pri.chunk_list.drain(..).collect()
        }
        None => return,
    };
    for chunk in chunks {
        inner.recycle_block(chunk);
    }
}

/// Drop a canonical block's cached encoding; this also invalidates the
/// owning bundle's encoded size, if it is on one.
pub fn canonical_drop_encode(inner: &mut PoolInner, cblk_id: BlockId) {
    let (chunks, owner) = match inner.canonical_mut(cblk_id) {
        Some(cblk) => {
            cblk.block_encode_size = 0;
            cblk.content_offset = 0;
            cblk.content_len = 0;
            let chunks: Vec<BlockId> = cblk.chunk_list.drain(..).collect();
            (chunks, cblk.bundle_ref)
        }
        None => return,
    };
    for chunk in chunks {
        inner.recycle_block(chunk);
    }
    if let Some(pri_id) = owner {
        if let Some(pri) = inner.primary_mut(pri_id) {
            pri.bundle_encode_size = 0;
        }
    }
}

// ─── Chunk operations ───────────────────────────────────────────────────────

/// Split `bytes` into freshly allocated chunk blocks. On shortage the
/// partial list is recycled and `None` returned.
pub fn chunk_list_store(inner: &mut PoolInner, bytes: &[u8]) -> Option<VecDeque<BlockId>> {
    let mut list = VecDeque::new();
    for piece in bytes.chunks(CHUNK_CAPACITY) {
        match inner.alloc_chunk() {
            Some(id) => {
                inner.chunk_fill(id, piece);
                list.push_back(id);
            }
            None => {
                for id in list {
                    inner.recycle_block(id);
                }
                return None;
            }
        }
    }
    Some(list)
}

/// Stream bytes out of a chunk list, skipping `seek_start` bytes and copying
/// at most `max_count`, bounded by the output capacity.
pub fn chunk_list_export(
    inner: &PoolInner,
    list: &VecDeque<BlockId>,
    out: &mut [u8],
    seek_start: usize,
    max_count: usize,
) -> usize {
    let mut written = 0;
    let mut seek_left = seek_start;
    let mut data_left = max_count;
    for &blk in list {
        if data_left == 0 {
            break;
        }
        let Some(src) = inner.chunk_bytes(blk) else {
            break;
        };
        if seek_left >= src.len() {
            seek_left -= src.len();
            continue;
        }
        let src = &src[seek_left..];
        seek_left = 0;
        let take = src.len().min(data_left);
        if out.len() - written < take {
            // Will not fit.
            break;
        }
        out[written..written + take].copy_from_slice(&src[..take]);
        written += take;
        data_left -= take;
    }
    written
}

fn chunk_list_len(inner: &PoolInner, list: &VecDeque<BlockId>) -> usize {
    list.iter()
        .filter_map(|&blk| inner.chunk_bytes(blk))
        .map(|b| b.len())
        .sum()
}

fn append_chunks(inner: &PoolInner, list: &VecDeque<BlockId>, out: &mut Vec<u8>) {
    for &blk in list {
        if let Some(bytes) = inner.chunk_bytes(blk) {
            out.extend_from_slice(bytes);
        }
    }
}

// ─── Import / export ────────────────────────────────────────────────────────

/// Build the pool representation of a decoded bundle, retaining each block's
/// wire bytes as its chunk cache. Returns the primary block on success; on
/// allocation shortage everything partial is recycled.
pub fn import_bundle(inner: &mut PoolInner, decoded: &DecodedBundle) -> Option<BlockId> {
    let pri_id = inner.alloc_primary(AllocPriority::Low)?;

    let fail = |inner: &mut PoolInner, pri_id| {
        inner.recycle_block(pri_id);
        None
    };

    match chunk_list_store(inner, &decoded.primary_raw) {
        Some(chunks) => {
            let pri = inner.primary_mut(pri_id)?;
            pri.fields = decoded.primary.clone();
            pri.chunk_list = chunks;
            pri.block_encode_size = decoded.primary_raw.len();
        }
        None => return fail(inner, pri_id),
    }

    for blk in &decoded.blocks {
        let Some(cblk_id) = inner.alloc_canonical() else {
            return fail(inner, pri_id);
        };
        let Some(chunks) = chunk_list_store(inner, &blk.raw) else {
            inner.recycle_block(cblk_id);
            return fail(inner, pri_id);
        };
        {
            let cblk = inner.canonical_mut(cblk_id)?;
            cblk.header = blk.header;
            cblk.data = blk.data.clone();
            cblk.chunk_list = chunks;
            cblk.block_encode_size = blk.raw.len();
            cblk.content_offset = blk.content_offset;
            cblk.content_len = blk.content_len;
        }
        primary_append(inner, pri_id, cblk_id);
    }

    Some(pri_id)
}

fn ensure_primary_encoded(inner: &mut PoolInner, pri_id: BlockId) -> Option<()> {
    if !inner.primary(pri_id)?.chunk_list.is_empty() {
        return Some(());
    }
    let fields = inner.primary(pri_id)?.fields.clone();
    let mut buf = BytesMut::new();
    encode_primary(&fields, &mut buf);
    let chunks = chunk_list_store(inner, &buf)?;
    let pri = inner.primary_mut(pri_id)?;
    pri.chunk_list = chunks;
    pri.block_encode_size = buf.len();
    Some(())
}

fn ensure_canonical_encoded(inner: &mut PoolInner, cblk_id: BlockId) -> Option<()> {
    if !inner.canonical(cblk_id)?.chunk_list.is_empty() {
        return Some(());
    }
    let (header, data) = {
        let cblk = inner.canonical(cblk_id)?;
        (cblk.header, cblk.data.clone())
    };
    let mut buf = BytesMut::new();
    encode_canonical(&header, &data, &mut buf);
    let chunks = chunk_list_store(inner, &buf)?;
    let cblk = inner.canonical_mut(cblk_id)?;
    cblk.chunk_list = chunks;
    cblk.block_encode_size = buf.len();
    Some(())
}

/// Emit the full wire form of a stored bundle, re-encoding any block whose
/// chunk cache was dropped. The canonical list order already keeps the
/// payload last.
pub fn export_bundle(inner: &mut PoolInner, block: BlockId) -> Option<Vec<u8>> {
    let pri_id = inner.resolve(block);
    ensure_primary_encoded(inner, pri_id)?;
    let cblks: Vec<BlockId> = inner.primary(pri_id)?.cblock_list.iter().copied().collect();
    for &cblk in &cblks {
        ensure_canonical_encoded(inner, cblk)?;
    }

    let mut size = 2 + chunk_list_len(inner, &inner.primary(pri_id)?.chunk_list);
    for &cblk in &cblks {
        size += chunk_list_len(inner, &inner.canonical(cblk)?.chunk_list);
    }

    let mut out = Vec::with_capacity(size);
    out.push(INDEFINITE_ARRAY);
    append_chunks(inner, &inner.primary(pri_id)?.chunk_list, &mut out);
    for &cblk in &cblks {
        append_chunks(inner, &inner.canonical(cblk)?.chunk_list, &mut out);
    }
    out.push(BREAK);

    inner.primary_mut(pri_id)?.bundle_encode_size = out.len();
    Some(out)
}
