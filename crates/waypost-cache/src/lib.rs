//! # waypost-cache
//!
//! The storage-and-custody core of a BPv7 node: an in-memory bundle cache
//! that accepts bundles off ingress queues, holds them while offering them
//! to egress interfaces, tracks custody transfer (including acknowledgement
//! aggregation and retransmission scheduling), and releases bundles when
//! custody is relinquished or lifetimes expire.
//!
//! ## Crate structure
//!
//! - [`pool`] — fixed-capacity typed block arena, recycling, priority bands
//! - [`refs`] — refcounted sharing of primary blocks, reified ref blocks
//! - [`bblock`] — pool-resident bundle representation and chunk caches
//! - [`subq`] — FIFO queues with push/pull accounting and depth limits
//! - [`flow`] — interface abstraction: ingress/egress subqs + state flags
//! - [`index`] — ordered multimap indices with duplicate-key chains
//! - [`cache`] — per-bundle entries, cache state, the scheduler pass
//! - [`custody`] — ingress decisions, DACS aggregation, ACK application
//! - [`fsm`] — per-entry state machine and timer reparking
//! - [`offload`] — pluggable persistent storage interface

pub mod bblock;
pub mod cache;
pub mod custody;
pub mod flow;
pub mod fsm;
pub mod index;
pub mod offload;
pub mod pool;
pub mod refs;
pub mod subq;

pub use bblock::{export_bundle, import_bundle, DeliveryPolicy};
pub use cache::{Cache, CacheConfig, CacheError, Disposition, EntrySnapshot};
pub use flow::{FlowEvent, FLOW_FLAG_ADMIN_UP, FLOW_FLAG_OPER_UP, FLOW_FLAG_POLL};
pub use fsm::EntryState;
pub use offload::{MemoryOffload, OffloadApi, OffloadError, StorageId};
pub use pool::{AllocPriority, BlockId, FlowDir, Handle, Pool, PoolError, PoolStats};
pub use refs::Ref;


