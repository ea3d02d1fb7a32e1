//! # waypost-cbor
//!
//! BPv7 (RFC 9171) bundle codec. Pure logic — no I/O, no allocation beyond
//! the output buffers handed back to the caller.
//!
//! ## Crate structure
//!
//! - [`primitives`] — minimal CBOR reader/writer (preferred encodings only)
//! - [`crc`] — per-block CRC-16/X.25 and CRC-32C compute/patch/validate
//! - [`primary`] — primary block encode/decode
//! - [`canonical`] — canonical block encode/decode, typed content parsing
//! - [`bundle`] — whole-bundle encode/decode
//!
//! A bundle on the wire is an indefinite-length CBOR array holding the
//! primary block, any extension blocks, and finally the payload block. Every
//! block carries a CRC (only CRC-16/X.25 and CRC-32C are accepted), computed
//! with the CRC field zero-filled and stored network-byte-order in a byte
//! string.

pub mod bundle;
pub mod canonical;
pub mod crc;
pub mod primary;
pub mod primitives;

pub use bundle::{decode_bundle, encode_bundle, DecodedBlock, DecodedBundle, MAX_BUNDLE_SIZE};
pub use canonical::{decode_canonical, encode_canonical};
pub use primary::{decode_primary, encode_primary};

/// Decode/encode failure taxonomy.
///
/// Validation failures surface to the immediate caller; the offending bundle
/// is discarded by the cache and counted, never reflected back on the wire.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("input truncated")]
    Truncated,
    #[error("input exceeds maximum bundle size")]
    TooLong,
    #[error("trailing bytes after bundle")]
    TrailingBytes,
    #[error("expected {0}")]
    UnexpectedType(&'static str),
    #[error("unsupported bundle protocol version {0}")]
    WrongVersion(u64),
    #[error("admin record requests status reports")]
    BadProcFlags,
    #[error("unsupported CRC type code {0}")]
    UnsupportedCrcType(u64),
    #[error("CRC byte string has wrong length")]
    BadCrcLength,
    #[error("CRC mismatch in {0} block")]
    CrcMismatch(&'static str),
    #[error("unsupported EID scheme {0}")]
    BadEidScheme(u64),
    #[error("bundle has no payload block")]
    NoPayload,
    #[error("too many canonical blocks")]
    TooManyBlocks,
    #[error("malformed administrative record")]
    BadAdminRecord,
    #[error("malformed {0} field")]
    Field(&'static str),
}


