//! # Block pool
//!
//! Fixed-capacity arena of equal-sized typed cells. A block is addressed by
//! its [`BlockId`] slot; the free cells form an implicit linked list threaded
//! through the cells themselves (Kenwright's fixed-size allocator), with a
//! lazy init high-water mark so pool creation is O(1).
//!
//! Blocks move free → in-use → recycled → free. Recycling is a cheap push;
//! the collector later runs the per-type destructor (which may recycle
//! owned sub-blocks) and returns the cell to the free list.
//!
//! Concurrency follows the original design: one pool-wide mutex, one
//! condition variable, broadcast on every release. All blocking entry points
//! take absolute DTN-time deadlines.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use waypost_common::{Clock, DtnTime};

use crate::bblock::{CanonicalBlock, PrimaryBlock};
use crate::cache;
use crate::flow::{FlowBlock, FlowEvent};
use crate::refs::RefBlock;

/// User bytes carried by one CBOR chunk block.
pub const CHUNK_CAPACITY: usize = 480;
/// User bytes available to registered generic blob types.
pub const GENERIC_CAPACITY: usize = 480;

/// Content signature of CBOR chunk data.
pub const CBOR_CHUNK_SIGNATURE: u32 = 0x6b24_3e33;
/// Content signature of untyped byte blocks (pre-registered type 0).
pub const BASIC_SIGNATURE: u32 = 0;

/// Free-list terminator: one past the last valid cell index.
const FREE_SENTINEL: u32 = u32::MAX;

/// Maximum single condvar wait slice, so a hand-advanced clock still gets
/// re-read while waiting toward an absolute deadline.
const WAIT_SLICE_MS: u64 = 50;

// ─── Identity ───────────────────────────────────────────────────────────────

/// Slot index of a block within its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u32);

impl BlockId {
    pub fn from_raw(raw: u32) -> Self {
        BlockId(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Short-lived external identifier: slot plus liveness serial. Round-trips
/// back to a [`BlockId`] only while that block is still live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    serial: u32,
}

// ─── Cells ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Free,
    InUse,
    Recycled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AllocPriority {
    Low,
    Med,
    High,
}

#[derive(Debug)]
pub struct BlockHeader {
    pub state: BlockState,
    /// Content-type signature (magic number) for safe casting.
    pub signature: u32,
    /// Length of valid user content, for chunk and generic blocks.
    pub user_len: u16,
    pub refcount: u16,
    /// Bumped on every allocation; stale handles fail to resolve.
    pub serial: u32,
}

impl BlockHeader {
    fn vacant() -> Self {
        BlockHeader {
            state: BlockState::Free,
            signature: 0,
            user_len: 0,
            refcount: 0,
            serial: 0,
        }
    }
}

/// Registered blob block: raw bytes whose schema is identified by the
/// content signature in the header. CBOR chunks are generic blobs under the
/// pre-registered chunk signature.
pub struct GenericBlock {
    pub data: [u8; GENERIC_CAPACITY],
}

impl GenericBlock {
    fn new() -> Self {
        GenericBlock {
            data: [0; GENERIC_CAPACITY],
        }
    }
}

/// The closed set of block payload variants.
pub enum BlockData {
    Free { next_free: u32 },
    Primary(PrimaryBlock),
    Canonical(CanonicalBlock),
    Generic(GenericBlock),
    Flow(FlowBlock),
    Ref(RefBlock),
    Entry(cache::EntryBlock),
}

pub struct Cell {
    pub header: BlockHeader,
    pub data: BlockData,
}

impl Cell {
    fn vacant() -> Self {
        Cell {
            header: BlockHeader::vacant(),
            data: BlockData::Free {
                next_free: FREE_SENTINEL,
            },
        }
    }
}

// ─── Block-type registry ────────────────────────────────────────────────────

/// Descriptor for a registered generic blob type.
#[derive(Clone, Copy)]
pub struct BlockApi {
    pub user_content_size: usize,
    pub construct: Option<fn(&mut GenericBlock) -> bool>,
    pub destruct: Option<fn(&mut GenericBlock)>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("block type {0:#010x} already registered with a different size")]
    ConflictingType(u32),
    #[error("content size exceeds generic block capacity")]
    ContentTooLarge,
}

// ─── Stats ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub total: u32,
    pub free: u32,
    pub in_use: u32,
    pub recycled: u32,
    pub max_alloc_watermark: u32,
}

// ─── Pool interior ──────────────────────────────────────────────────────────

pub struct PoolInner {
    cells: Vec<Cell>,
    free_head: u32,
    num_init: u32,
    num_free: u32,
    recycle: VecDeque<BlockId>,
    active_jobs: VecDeque<BlockId>,
    registry: BTreeMap<u32, BlockApi>,
    /// Used-block count beyond which new bundle (low-priority) allocs fail.
    bblock_threshold: u32,
    /// Used-block count beyond which internal (med-priority) allocs fail.
    internal_threshold: u32,
    max_alloc_watermark: u32,
    serial_counter: u32,
}

impl PoolInner {
    fn new(num_blocks: u32) -> Self {
        let mut registry = BTreeMap::new();
        registry.insert(
            BASIC_SIGNATURE,
            BlockApi {
                user_content_size: GENERIC_CAPACITY,
                construct: None,
                destruct: None,
            },
        );
        registry.insert(
            CBOR_CHUNK_SIGNATURE,
            BlockApi {
                user_content_size: CHUNK_CAPACITY,
                construct: None,
                destruct: None,
            },
        );
        PoolInner {
            cells: (0..num_blocks).map(|_| Cell::vacant()).collect(),
            free_head: FREE_SENTINEL,
            num_init: 0,
            num_free: num_blocks,
            recycle: VecDeque::new(),
            active_jobs: VecDeque::new(),
            registry,
            bblock_threshold: num_blocks.saturating_mul(7) / 10,
            internal_threshold: num_blocks.saturating_mul(9) / 10,
            max_alloc_watermark: 0,
            serial_counter: 0,
        }
    }

    pub fn num_blocks(&self) -> u32 {
        self.cells.len() as u32
    }

    pub fn stats(&self) -> PoolStats {
        let total = self.num_blocks();
        let free = self.num_free;
        let recycled = self.recycle.len() as u32;
        PoolStats {
            total,
            free,
            in_use: total - free - recycled,
            recycled,
            max_alloc_watermark: self.max_alloc_watermark,
        }
    }

    // ── Free-list mechanics ────────────────────────────────────────────────

    fn pop_free(&mut self) -> Option<u32> {
        if self.num_free == 0 {
            return None;
        }
        let slot = if self.free_head != FREE_SENTINEL {
            let slot = self.free_head;
            self.free_head = match self.cells[slot as usize].data {
                BlockData::Free { next_free } => next_free,
                _ => unreachable!("free-list head is not a free cell"),
            };
            slot
        } else {
            // Lazy init: cells past the high-water mark have never been
            // linked; hand them out in order.
            let slot = self.num_init;
            self.num_init += 1;
            slot
        };
        self.num_free -= 1;
        Some(slot)
    }

    fn push_free(&mut self, id: BlockId) {
        self.cells[id.index()].data = BlockData::Free {
            next_free: self.free_head,
        };
        self.free_head = id.raw();
        self.num_free += 1;
    }

    fn band_allows(&self, priority: AllocPriority) -> bool {
        let used = self.num_blocks() - self.num_free;
        match priority {
            AllocPriority::Low => used < self.bblock_threshold,
            AllocPriority::Med => used < self.internal_threshold,
            AllocPriority::High => self.num_free > 0,
        }
    }

    /// Single allocation attempt; never blocks.
    pub(crate) fn try_alloc(
        &mut self,
        priority: AllocPriority,
        signature: u32,
        data: BlockData,
    ) -> Option<BlockId> {
        if self.num_free == 0 && !self.recycle.is_empty() {
            self.collect();
        }
        if !self.band_allows(priority) {
            return None;
        }
        let slot = self.pop_free()?;
        self.serial_counter = self.serial_counter.wrapping_add(1).max(1);
        let cell = &mut self.cells[slot as usize];
        cell.header = BlockHeader {
            state: BlockState::InUse,
            signature,
            user_len: 0,
            refcount: 1,
            serial: self.serial_counter,
        };
        cell.data = data;
        let used = self.num_blocks() - self.num_free;
        self.max_alloc_watermark = self.max_alloc_watermark.max(used);
        Some(BlockId(slot))
    }

    // ── Typed allocators ───────────────────────────────────────────────────

    pub fn alloc_primary(&mut self, priority: AllocPriority) -> Option<BlockId> {
        self.try_alloc(priority, 0, BlockData::Primary(PrimaryBlock::new()))
    }

    pub fn alloc_canonical(&mut self) -> Option<BlockId> {
        self.try_alloc(
            AllocPriority::Med,
            0,
            BlockData::Canonical(CanonicalBlock::new()),
        )
    }

    /// Allocate a CBOR chunk: a generic blob under the chunk signature.
    pub fn alloc_chunk(&mut self) -> Option<BlockId> {
        self.alloc_generic(CBOR_CHUNK_SIGNATURE, AllocPriority::Med)
    }

    /// Allocate a registered blob block, running its constructor if one was
    /// registered. Fails for unregistered signatures.
    pub fn alloc_generic(&mut self, signature: u32, priority: AllocPriority) -> Option<BlockId> {
        let api = *self.registry.get(&signature)?;
        let id = self.try_alloc(priority, signature, BlockData::Generic(GenericBlock::new()))?;
        if let Some(construct) = api.construct {
            let ok = match &mut self.cells[id.index()].data {
                BlockData::Generic(g) => construct(g),
                _ => false,
            };
            if !ok {
                self.recycle_block(id);
                return None;
            }
        }
        self.cells[id.index()].header.user_len = api.user_content_size as u16;
        Some(id)
    }

    pub fn alloc_flow(&mut self, ingress_limit: u32, egress_limit: u32) -> Option<BlockId> {
        self.try_alloc(
            AllocPriority::High,
            0,
            BlockData::Flow(FlowBlock::new(ingress_limit, egress_limit)),
        )
    }

    pub fn alloc_entry(&mut self, entry: cache::EntryBlock) -> Option<BlockId> {
        self.try_alloc(AllocPriority::High, 0, BlockData::Entry(entry))
    }

    pub(crate) fn alloc_ref_cell(&mut self, rblock: RefBlock) -> Option<BlockId> {
        self.try_alloc(AllocPriority::High, 0, BlockData::Ref(rblock))
    }

    // ── Recycle / collect ──────────────────────────────────────────────────

    /// Push a live block onto the recycle queue. Double frees are asserted
    /// in debug builds and ignored in release builds.
    pub fn recycle_block(&mut self, id: BlockId) {
        let header = &mut self.cells[id.index()].header;
        debug_assert_eq!(header.state, BlockState::InUse, "double free of {id:?}");
        if header.state != BlockState::InUse {
            return;
        }
        header.state = BlockState::Recycled;
        self.recycle.push_back(id);
    }

    /// Garbage-collect the recycle queue back onto the free list, running
    /// per-type destructors (which may recycle further blocks).
    pub fn collect(&mut self) -> usize {
        let mut collected = 0;
        while let Some(id) = self.recycle.pop_front() {
            self.run_destructor(id);
            let cell = &mut self.cells[id.index()];
            cell.header = BlockHeader::vacant();
            self.push_free(id);
            collected += 1;
        }
        collected
    }

    fn run_destructor(&mut self, id: BlockId) {
        let signature = self.cells[id.index()].header.signature;
        let data = std::mem::replace(
            &mut self.cells[id.index()].data,
            BlockData::Free {
                next_free: FREE_SENTINEL,
            },
        );
        match data {
            BlockData::Primary(primary) => {
                for cblk in primary.cblock_list {
                    self.recycle_block(cblk);
                }
                for chunk in primary.chunk_list {
                    self.recycle_block(chunk);
                }
            }
            BlockData::Canonical(canonical) => {
                for chunk in canonical.chunk_list {
                    self.recycle_block(chunk);
                }
            }
            BlockData::Flow(mut flow) => {
                for blk in flow.ingress.base.drop_all() {
                    self.recycle_block(blk);
                }
                for blk in flow.egress.base.drop_all() {
                    self.recycle_block(blk);
                }
                // Pending entries are owned by the cache indices, not the
                // flow; dropping the list is enough.
            }
            BlockData::Ref(rblock) => {
                crate::refs::ref_block_destruct(self, rblock);
            }
            BlockData::Entry(entry) => {
                if let Some(refptr) = entry.refptr {
                    self.ref_release(refptr);
                }
            }
            BlockData::Generic(mut generic) => {
                if let Some(api) = self.registry.get(&signature) {
                    if let Some(destruct) = api.destruct {
                        destruct(&mut generic);
                    }
                }
            }
            BlockData::Free { .. } => {
                debug_assert!(false, "destructor on a free cell");
            }
        }
    }

    // ── Refcounts ──────────────────────────────────────────────────────────

    pub(crate) fn refcount_inc(&mut self, id: BlockId) {
        let header = &mut self.cells[id.index()].header;
        debug_assert_eq!(header.state, BlockState::InUse);
        header.refcount = header.refcount.saturating_add(1);
    }

    /// Decrement, recycling the block when the count reaches zero.
    pub(crate) fn refcount_dec(&mut self, id: BlockId) -> u16 {
        let header = &mut self.cells[id.index()].header;
        debug_assert!(header.refcount > 0, "refcount underflow on {id:?}");
        header.refcount = header.refcount.saturating_sub(1);
        let remaining = header.refcount;
        if remaining == 0 {
            self.recycle_block(id);
        }
        remaining
    }

    pub fn refcount(&self, id: BlockId) -> u16 {
        self.cells[id.index()].header.refcount
    }

    // ── Handles ────────────────────────────────────────────────────────────

    pub fn handle_of(&self, id: BlockId) -> Handle {
        Handle {
            index: id.raw(),
            serial: self.cells[id.index()].header.serial,
        }
    }

    pub fn handle_to_id(&self, handle: Handle) -> Option<BlockId> {
        let cell = self.cells.get(handle.index as usize)?;
        if cell.header.state == BlockState::InUse && cell.header.serial == handle.serial {
            Some(BlockId(handle.index))
        } else {
            None
        }
    }

    // ── Registry ───────────────────────────────────────────────────────────

    /// Register a generic blob type. Re-registering with the same content
    /// size is an idempotent success; a conflicting size fails.
    pub fn register_blocktype(&mut self, signature: u32, api: BlockApi) -> Result<(), PoolError> {
        if api.user_content_size > GENERIC_CAPACITY {
            return Err(PoolError::ContentTooLarge);
        }
        if let Some(existing) = self.registry.get(&signature) {
            if existing.user_content_size == api.user_content_size {
                return Ok(());
            }
            return Err(PoolError::ConflictingType(signature));
        }
        self.registry.insert(signature, api);
        Ok(())
    }

    // ── Typed access ───────────────────────────────────────────────────────

    pub fn state_of(&self, id: BlockId) -> BlockState {
        self.cells[id.index()].header.state
    }

    fn live_cell(&self, id: BlockId) -> Option<&Cell> {
        let cell = self.cells.get(id.index())?;
        (cell.header.state == BlockState::InUse).then_some(cell)
    }

    fn live_cell_mut(&mut self, id: BlockId) -> Option<&mut Cell> {
        let cell = self.cells.get_mut(id.index())?;
        (cell.header.state == BlockState::InUse).then_some(cell)
    }

    /// One-hop dereference: a ref block stands in for its target.
    pub fn resolve(&self, id: BlockId) -> BlockId {
        match self.live_cell(id).map(|c| &c.data) {
            Some(BlockData::Ref(r)) => r.target,
            _ => id,
        }
    }

    pub fn primary(&self, id: BlockId) -> Option<&PrimaryBlock> {
        match &self.live_cell(self.resolve(id))?.data {
            BlockData::Primary(p) => Some(p),
            _ => None,
        }
    }

    pub fn primary_mut(&mut self, id: BlockId) -> Option<&mut PrimaryBlock> {
        let id = self.resolve(id);
        match &mut self.live_cell_mut(id)?.data {
            BlockData::Primary(p) => Some(p),
            _ => None,
        }
    }

    pub fn canonical(&self, id: BlockId) -> Option<&CanonicalBlock> {
        match &self.live_cell(self.resolve(id))?.data {
            BlockData::Canonical(c) => Some(c),
            _ => None,
        }
    }

    pub fn canonical_mut(&mut self, id: BlockId) -> Option<&mut CanonicalBlock> {
        let id = self.resolve(id);
        match &mut self.live_cell_mut(id)?.data {
            BlockData::Canonical(c) => Some(c),
            _ => None,
        }
    }

    pub fn flow(&self, id: BlockId) -> Option<&FlowBlock> {
        match &self.live_cell(id)?.data {
            BlockData::Flow(f) => Some(f),
            _ => None,
        }
    }

    pub fn flow_mut(&mut self, id: BlockId) -> Option<&mut FlowBlock> {
        match &mut self.live_cell_mut(id)?.data {
            BlockData::Flow(f) => Some(f),
            _ => None,
        }
    }

    pub fn entry(&self, id: BlockId) -> Option<&cache::EntryBlock> {
        match &self.live_cell(id)?.data {
            BlockData::Entry(e) => Some(e),
            _ => None,
        }
    }

    pub fn entry_mut(&mut self, id: BlockId) -> Option<&mut cache::EntryBlock> {
        match &mut self.live_cell_mut(id)?.data {
            BlockData::Entry(e) => Some(e),
            _ => None,
        }
    }

    /// Chunk contents, limited to the valid user length.
    pub fn chunk_bytes(&self, id: BlockId) -> Option<&[u8]> {
        self.generic_bytes(id, CBOR_CHUNK_SIGNATURE)
    }

    /// Fill a chunk block's contents and set its user length.
    pub fn chunk_fill(&mut self, id: BlockId, bytes: &[u8]) -> bool {
        debug_assert!(bytes.len() <= CHUNK_CAPACITY);
        let Some(cell) = self.live_cell_mut(id) else {
            return false;
        };
        if cell.header.signature != CBOR_CHUNK_SIGNATURE {
            return false;
        }
        match &mut cell.data {
            BlockData::Generic(g) => {
                g.data[..bytes.len()].copy_from_slice(bytes);
                cell.header.user_len = bytes.len() as u16;
                true
            }
            _ => false,
        }
    }

    pub fn generic_bytes(&self, id: BlockId, signature: u32) -> Option<&[u8]> {
        let cell = self.live_cell(id)?;
        if cell.header.signature != signature {
            return None;
        }
        match &cell.data {
            BlockData::Generic(g) => Some(&g.data[..cell.header.user_len as usize]),
            _ => None,
        }
    }

    // ── Jobs ───────────────────────────────────────────────────────────────

    /// Mark a flow's job active, queueing it for the scheduler once.
    pub fn mark_job_active(&mut self, flow_id: BlockId) {
        let newly_active = match self.flow_mut(flow_id) {
            Some(flow) if !flow.job_active => {
                flow.job_active = true;
                true
            }
            _ => false,
        };
        if newly_active {
            self.active_jobs.push_back(flow_id);
        }
    }

    pub(crate) fn take_active_jobs_inner(&mut self) -> Vec<BlockId> {
        let jobs: Vec<BlockId> = self.active_jobs.drain(..).collect();
        for &id in &jobs {
            if let Some(flow) = self.flow_mut(id) {
                flow.job_active = false;
            }
        }
        jobs
    }

    pub(crate) fn has_active_jobs(&self) -> bool {
        !self.active_jobs.is_empty()
    }
}

// ─── Pool (lock + condvar owner) ────────────────────────────────────────────

/// Which direction of a flow an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowDir {
    Ingress,
    Egress,
}

pub struct Pool {
    inner: Mutex<PoolInner>,
    cond: Condvar,
    clock: Arc<dyn Clock>,
}

impl Pool {
    /// Create a pool backed by `pool_bytes` of cell storage.
    pub fn new(pool_bytes: usize, clock: Arc<dyn Clock>) -> Self {
        let cell_size = std::mem::size_of::<Cell>();
        let num_blocks = (pool_bytes / cell_size).max(1) as u32;
        Pool {
            inner: Mutex::new(PoolInner::new(num_blocks)),
            cond: Condvar::new(),
            clock,
        }
    }

    /// Create a pool with an exact cell count (mainly for tests).
    pub fn with_blocks(num_blocks: u32, clock: Arc<dyn Clock>) -> Self {
        Pool {
            inner: Mutex::new(PoolInner::new(num_blocks)),
            cond: Condvar::new(),
            clock,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn now(&self) -> DtnTime {
        self.clock.now()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Broadcast-signal every waiter; called after any release or push.
    pub(crate) fn notify(&self) {
        self.cond.notify_all();
    }

    /// Run a closure under the pool lock, then wake waiters.
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut PoolInner) -> R) -> R {
        let mut guard = self.lock();
        let out = f(&mut guard);
        drop(guard);
        self.notify();
        out
    }

    fn wait<'a>(
        &self,
        guard: MutexGuard<'a, PoolInner>,
        deadline: DtnTime,
    ) -> MutexGuard<'a, PoolInner> {
        if deadline == DtnTime::INFINITE {
            return self
                .cond
                .wait(guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        let remaining = self.clock.now().until(deadline).clamp(1, WAIT_SLICE_MS);
        self.cond
            .wait_timeout(guard, Duration::from_millis(remaining))
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .0
    }

    /// Allocate a primary block, waiting until `deadline` on shortage.
    pub fn alloc_primary_timeout(
        &self,
        priority: AllocPriority,
        deadline: DtnTime,
    ) -> Option<BlockId> {
        let mut guard = self.lock();
        loop {
            if let Some(id) = guard.alloc_primary(priority) {
                return Some(id);
            }
            if deadline != DtnTime::INFINITE && self.clock.now() >= deadline {
                return None;
            }
            guard = self.wait(guard, deadline);
        }
    }

    /// Collect recycled blocks; wakes allocation waiters if any freed.
    pub fn maintain(&self) -> usize {
        self.with_lock(|inner| inner.collect())
    }

    pub fn stats(&self) -> PoolStats {
        self.lock().stats()
    }

    // ── Flow operations ────────────────────────────────────────────────────

    pub fn flow_modify_flags(&self, flow_id: BlockId, set: u32, clear: u32) {
        self.with_lock(|inner| {
            if let Some(flow) = inner.flow_mut(flow_id) {
                flow.modify_flags(set, clear);
            }
            inner.mark_job_active(flow_id);
        });
    }

    /// Fold pending flow flags into current state, returning derived events.
    pub fn flow_fold_state(&self, flow_id: BlockId) -> Vec<FlowEvent> {
        self.with_lock(|inner| {
            inner
                .flow_mut(flow_id)
                .map(|flow| flow.fold_state())
                .unwrap_or_default()
        })
    }

    pub fn flow_set_depth_limit(&self, flow_id: BlockId, dir: FlowDir, limit: u32) {
        self.with_lock(|inner| {
            if let Some(flow) = inner.flow_mut(flow_id) {
                match dir {
                    FlowDir::Ingress => flow.ingress.depth_limit = limit,
                    FlowDir::Egress => flow.egress.depth_limit = limit,
                }
            }
        });
    }

    /// Disable a flow: zero both depth limits, drain both subqs, and wake
    /// all waiters so they observe the unmeetable limit and give up.
    pub fn flow_disable(&self, flow_id: BlockId) {
        self.with_lock(|inner| {
            let Some(flow) = inner.flow_mut(flow_id) else {
                return;
            };
            flow.ingress.depth_limit = 0;
            flow.egress.depth_limit = 0;
            let dropped: Vec<BlockId> = flow
                .ingress
                .base
                .drop_all()
                .into_iter()
                .chain(flow.egress.base.drop_all())
                .collect();
            for blk in dropped {
                inner.recycle_block(blk);
            }
            inner.collect();
        });
    }

    /// Push one block, waiting for space until the absolute `deadline`.
    /// A deadline at or before now never blocks.
    pub fn flow_try_push(
        &self,
        flow_id: BlockId,
        dir: FlowDir,
        block: BlockId,
        deadline: DtnTime,
    ) -> bool {
        let mut guard = self.lock();
        loop {
            let Some(flow) = guard.flow_mut(flow_id) else {
                return false;
            };
            let subq = match dir {
                FlowDir::Ingress => &mut flow.ingress,
                FlowDir::Egress => &mut flow.egress,
            };
            if subq.has_space(1) {
                subq.base.push_single(block);
                if dir == FlowDir::Ingress {
                    guard.mark_job_active(flow_id);
                }
                drop(guard);
                self.notify();
                return true;
            }
            if deadline == DtnTime::INFINITE || self.clock.now() < deadline {
                guard = self.wait(guard, deadline);
            } else {
                return false;
            }
        }
    }

    /// Pull one block, waiting for fill until the absolute `deadline`.
    pub fn flow_try_pull(
        &self,
        flow_id: BlockId,
        dir: FlowDir,
        deadline: DtnTime,
    ) -> Option<BlockId> {
        let mut guard = self.lock();
        loop {
            let flow = guard.flow_mut(flow_id)?;
            let subq = match dir {
                FlowDir::Ingress => &mut flow.ingress,
                FlowDir::Egress => &mut flow.egress,
            };
            if let Some(block) = subq.base.pull_single() {
                drop(guard);
                self.notify();
                return Some(block);
            }
            if deadline == DtnTime::INFINITE || self.clock.now() < deadline {
                guard = self.wait(guard, deadline);
            } else {
                return None;
            }
        }
    }

    // ── Scheduler interface ────────────────────────────────────────────────

    /// Drain the active-jobs list for dispatch.
    pub fn take_active_jobs(&self) -> Vec<BlockId> {
        self.lock().take_active_jobs_inner()
    }

    /// Park until some job is active or `deadline` passes. Returns whether
    /// work is available.
    pub fn wait_for_work(&self, deadline: DtnTime) -> bool {
        let mut guard = self.lock();
        loop {
            if guard.has_active_jobs() {
                return true;
            }
            if deadline != DtnTime::INFINITE && self.clock.now() >= deadline {
                return false;
            }
            guard = self.wait(guard, deadline);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use waypost_common::SimClock;

    fn test_pool(blocks: u32) -> Pool {
        Pool::with_blocks(blocks, Arc::new(SimClock::new(DtnTime::from_ms(0))))
    }

    #[test]
    fn conservation_of_blocks() {
        let pool = test_pool(8);
        let ids: Vec<BlockId> = {
            let mut inner = pool.lock();
            (0..3).map(|_| inner.alloc_chunk().unwrap()).collect()
        };
        let s = pool.stats();
        assert_eq!(s.total, 8);
        assert_eq!(s.in_use, 3);
        assert_eq!(s.free + s.in_use + s.recycled, s.total);

        pool.with_lock(|inner| inner.recycle_block(ids[0]));
        let s = pool.stats();
        assert_eq!(s.recycled, 1);
        assert_eq!(s.free + s.in_use + s.recycled, s.total);

        pool.maintain();
        let s = pool.stats();
        assert_eq!(s.recycled, 0);
        assert_eq!(s.in_use, 2);
        assert_eq!(s.free + s.in_use + s.recycled, s.total);
    }

    #[test]
    fn exhaustion_returns_none_and_free_recovers() {
        // High priority runs the pool all the way to empty.
        let pool = test_pool(2);
        let mut inner = pool.lock();
        let a = inner.alloc_flow(0, 0).unwrap();
        let _b = inner.alloc_flow(0, 0).unwrap();
        assert!(inner.alloc_flow(0, 0).is_none());

        inner.recycle_block(a);
        // Allocation collects the recycle queue under pressure.
        assert!(inner.alloc_flow(0, 0).is_some());
    }

    #[test]
    fn priority_bands_reserve_headroom() {
        // 10 cells: low refused at 7 used, med at 9 used, high runs to zero.
        let pool = test_pool(10);
        let mut inner = pool.lock();
        for _ in 0..7 {
            assert!(inner.alloc_primary(AllocPriority::Low).is_some());
        }
        assert!(inner.alloc_primary(AllocPriority::Low).is_none());
        for _ in 0..2 {
            assert!(inner.alloc_primary(AllocPriority::Med).is_some());
        }
        assert!(inner.alloc_primary(AllocPriority::Med).is_none());
        assert!(inner.alloc_primary(AllocPriority::High).is_some());
        assert!(inner.alloc_primary(AllocPriority::High).is_none());
    }

    #[test]
    fn alloc_timeout_with_past_deadline_fails_immediately() {
        let pool = test_pool(1);
        let first = pool.alloc_primary_timeout(AllocPriority::High, DtnTime::from_ms(0));
        assert!(first.is_some());
        let second = pool.alloc_primary_timeout(AllocPriority::High, DtnTime::from_ms(0));
        assert!(second.is_none());
    }

    #[test]
    fn handles_go_stale_after_recycle() {
        let pool = test_pool(4);
        let mut inner = pool.lock();
        let id = inner.alloc_chunk().unwrap();
        let handle = inner.handle_of(id);
        assert_eq!(inner.handle_to_id(handle), Some(id));

        inner.recycle_block(id);
        inner.collect();
        assert_eq!(inner.handle_to_id(handle), None);

        // The slot may be reused; the old handle still must not resolve.
        let id2 = inner.alloc_chunk().unwrap();
        assert_eq!(inner.handle_to_id(handle), None);
        assert_eq!(inner.handle_to_id(inner.handle_of(id2)), Some(id2));
    }

    #[test]
    fn registry_is_idempotent_and_rejects_conflicts() {
        let pool = test_pool(4);
        let mut inner = pool.lock();
        let api = BlockApi {
            user_content_size: 64,
            construct: None,
            destruct: None,
        };
        assert_eq!(inner.register_blocktype(0x1234, api), Ok(()));
        assert_eq!(inner.register_blocktype(0x1234, api), Ok(()));
        let conflicting = BlockApi {
            user_content_size: 128,
            construct: None,
            destruct: None,
        };
        assert_eq!(
            inner.register_blocktype(0x1234, conflicting),
            Err(PoolError::ConflictingType(0x1234))
        );
        let oversized = BlockApi {
            user_content_size: GENERIC_CAPACITY + 1,
            construct: None,
            destruct: None,
        };
        assert_eq!(
            inner.register_blocktype(0x5678, oversized),
            Err(PoolError::ContentTooLarge)
        );
    }

    #[test]
    fn generic_alloc_requires_registration() {
        let pool = test_pool(4);
        let mut inner = pool.lock();
        assert!(inner
            .alloc_generic(0xdead_beef, AllocPriority::High)
            .is_none());
        assert!(inner
            .alloc_generic(CBOR_CHUNK_SIGNATURE, AllocPriority::Med)
            .is_some());
    }

    #[test]
    fn chunk_fill_and_read_back() {
        let pool = test_pool(4);
        let mut inner = pool.lock();
        let id = inner.alloc_chunk().unwrap();
        assert!(inner.chunk_fill(id, b"hello"));
        assert_eq!(inner.chunk_bytes(id), Some(&b"hello"[..]));
    }

    #[test]
    #[should_panic(expected = "double free")]
    #[cfg(debug_assertions)]
    fn double_free_asserts_in_debug() {
        let pool = test_pool(2);
        let mut inner = pool.lock();
        let id = inner.alloc_chunk().unwrap();
        inner.recycle_block(id);
        inner.recycle_block(id);
    }
}


