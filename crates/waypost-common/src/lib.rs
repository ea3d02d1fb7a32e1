//! # waypost-common
//!
//! Shared BPv7 vocabulary for the waypost node.
//!
//! ## Crate structure
//!
//! - [`eid`] — `ipn`-scheme endpoint identifiers
//! - [`time`] — DTN wall-clock time and the pluggable [`time::Clock`]
//! - [`block`] — the logical (decoded) bundle block model

pub mod block;
pub mod eid;
pub mod time;

pub use block::{
    AdminRecord, BlockType, CanonicalHeader, CrcType, CreationTimestamp, CustodyAcceptPayload,
    PrimaryFields, ADMIN_RECORD_CUSTODY_ACCEPT,
};
pub use eid::IpnAddr;
pub use time::{Clock, DtnTime, SimClock, SystemClock};


