//! Logical (decoded) BPv7 block model.
//!
//! These are the in-memory shapes shared by the codec and the cache: the
//! primary block fields, canonical block headers, and the typed content of
//! the extension blocks waypost understands. Anything it does not understand
//! is carried opaquely and re-emitted byte-for-byte.

use bytes::Bytes;

use crate::eid::IpnAddr;
use crate::time::DtnTime;

/// Bundle protocol version accepted on ingress.
pub const BP_VERSION: u64 = 7;

/// Upper bound on canonical blocks in a single bundle.
pub const MAX_CANONICAL_BLOCKS: usize = 8;

/// Bundle processing control flags (RFC 9171 §4.2.3).
pub mod bundle_flags {
    pub const IS_FRAGMENT: u64 = 0x0000_0001;
    pub const IS_ADMIN_RECORD: u64 = 0x0000_0002;
    pub const MUST_NOT_FRAGMENT: u64 = 0x0000_0004;
    pub const APP_ACK_REQUESTED: u64 = 0x0000_0020;
    pub const STATUS_TIME_REQUESTED: u64 = 0x0000_0040;
    pub const REPORT_RECEPTION: u64 = 0x0000_4000;
    pub const REPORT_FORWARDING: u64 = 0x0001_0000;
    pub const REPORT_DELIVERY: u64 = 0x0002_0000;
    pub const REPORT_DELETION: u64 = 0x0004_0000;

    /// All status-report request bits. An admin record must not set any.
    pub const STATUS_MASK: u64 =
        REPORT_RECEPTION | REPORT_FORWARDING | REPORT_DELIVERY | REPORT_DELETION;
}

/// Canonical block processing control flags (RFC 9171 §4.2.4).
pub mod block_flags {
    pub const MUST_REPLICATE: u64 = 0x01;
    pub const REPORT_IF_UNPROCESSABLE: u64 = 0x02;
    pub const DELETE_BUNDLE_IF_UNPROCESSABLE: u64 = 0x04;
    pub const DISCARD_IF_UNPROCESSABLE: u64 = 0x10;
}

/// CRC type codes carried in primary and canonical blocks.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CrcType {
    None = 0,
    #[default]
    Crc16 = 1,
    Crc32c = 2,
}

impl CrcType {
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(CrcType::None),
            1 => Some(CrcType::Crc16),
            2 => Some(CrcType::Crc32c),
            _ => None,
        }
    }

    pub const fn code(self) -> u64 {
        self as u64
    }

    /// Width of the encoded CRC byte string.
    pub const fn width(self) -> usize {
        match self {
            CrcType::None => 0,
            CrcType::Crc16 => 2,
            CrcType::Crc32c => 4,
        }
    }
}

/// Block type discriminator.
///
/// `CustodyTracking`/`PreviousCustodian` use the private-use code range.
/// `CustodyAcceptPayload` is an internal retag of the payload block of an
/// administrative record carrying a custody-accept signal; on the wire it is
/// an ordinary payload block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    Payload,
    PreviousNode,
    BundleAge,
    HopCount,
    CustodyTracking,
    PreviousCustodian,
    CustodyAcceptPayload,
    Other(u64),
}

impl BlockType {
    pub const PAYLOAD_CODE: u64 = 1;
    pub const PREVIOUS_NODE_CODE: u64 = 6;
    pub const BUNDLE_AGE_CODE: u64 = 7;
    pub const HOP_COUNT_CODE: u64 = 10;
    pub const CUSTODY_TRACKING_CODE: u64 = 193;
    pub const PREVIOUS_CUSTODIAN_CODE: u64 = 194;

    pub fn from_code(code: u64) -> Self {
        match code {
            Self::PAYLOAD_CODE => BlockType::Payload,
            Self::PREVIOUS_NODE_CODE => BlockType::PreviousNode,
            Self::BUNDLE_AGE_CODE => BlockType::BundleAge,
            Self::HOP_COUNT_CODE => BlockType::HopCount,
            Self::CUSTODY_TRACKING_CODE => BlockType::CustodyTracking,
            Self::PREVIOUS_CUSTODIAN_CODE => BlockType::PreviousCustodian,
            other => BlockType::Other(other),
        }
    }

    /// Code emitted on the wire.
    pub fn wire_code(self) -> u64 {
        match self {
            BlockType::Payload => Self::PAYLOAD_CODE,
            BlockType::PreviousNode => Self::PREVIOUS_NODE_CODE,
            BlockType::BundleAge => Self::BUNDLE_AGE_CODE,
            BlockType::HopCount => Self::HOP_COUNT_CODE,
            BlockType::CustodyTracking => Self::CUSTODY_TRACKING_CODE,
            BlockType::PreviousCustodian => Self::PREVIOUS_CUSTODIAN_CODE,
            // On the wire a custody-accept signal rides in the payload block.
            BlockType::CustodyAcceptPayload => Self::PAYLOAD_CODE,
            BlockType::Other(code) => code,
        }
    }
}

/// Creation timestamp: DTN time of creation plus a source-scoped sequence
/// number (RFC 9171 §4.2.7).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CreationTimestamp {
    pub time: u64,
    pub sequence: u64,
}

/// Decoded primary block.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PrimaryFields {
    pub flags: u64,
    pub crc_type: CrcType,
    pub destination: IpnAddr,
    pub source: IpnAddr,
    pub report_to: IpnAddr,
    pub timestamp: CreationTimestamp,
    pub lifetime: u64,
}

impl PrimaryFields {
    pub fn is_admin_record(&self) -> bool {
        self.flags & bundle_flags::IS_ADMIN_RECORD != 0
    }

    pub fn must_not_fragment(&self) -> bool {
        self.flags & bundle_flags::MUST_NOT_FRAGMENT != 0
    }

    /// Absolute time at which this bundle's lifetime ends.
    pub fn expire_time(&self) -> DtnTime {
        DtnTime::from_ms(self.timestamp.time).offset(self.lifetime)
    }
}

/// Decoded canonical block header (content is carried separately).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanonicalHeader {
    pub block_type: BlockType,
    pub block_num: u64,
    pub flags: u64,
    pub crc_type: CrcType,
}

/// Typed content of a canonical block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CanonicalData {
    Payload(Bytes),
    PreviousNode(IpnAddr),
    BundleAge(u64),
    HopCount { limit: u64, count: u64 },
    CustodyTracking { current_custodian: IpnAddr },
    PreviousCustodian { current_custodian: IpnAddr },
    Admin(AdminRecord),
    /// Content of a block type waypost does not interpret.
    Opaque(Bytes),
}

/// Administrative record type code for a custody-accept signal.
pub const ADMIN_RECORD_CUSTODY_ACCEPT: u64 = 4;

/// Decoded administrative record (payload of an admin-record bundle).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminRecord {
    CustodyAccept(CustodyAcceptPayload),
}

/// Custody-accept signal: acknowledges custody of a set of bundles from one
/// source flow back to their previous custodian.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CustodyAcceptPayload {
    pub flow_source_eid: IpnAddr,
    pub sequence_nums: Vec<u64>,
}

impl CustodyAcceptPayload {
    pub fn num_entries(&self) -> usize {
        self.sequence_nums.len()
    }

    pub fn contains(&self, seq: u64) -> bool {
        self.sequence_nums.contains(&seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_type_codes_roundtrip() {
        for ct in [CrcType::None, CrcType::Crc16, CrcType::Crc32c] {
            assert_eq!(CrcType::from_code(ct.code()), Some(ct));
        }
        assert_eq!(CrcType::from_code(3), None);
    }

    #[test]
    fn block_type_codes_roundtrip() {
        for code in [1, 6, 7, 10, 193, 194, 42] {
            assert_eq!(BlockType::from_code(code).wire_code(), code);
        }
    }

    #[test]
    fn custody_accept_rides_in_payload_block() {
        assert_eq!(
            BlockType::CustodyAcceptPayload.wire_code(),
            BlockType::PAYLOAD_CODE
        );
    }

    #[test]
    fn expire_time_adds_lifetime() {
        let pri = PrimaryFields {
            timestamp: CreationTimestamp {
                time: 1000,
                sequence: 7,
            },
            lifetime: 60_000,
            ..Default::default()
        };
        assert_eq!(pri.expire_time(), DtnTime::from_ms(61_000));
    }
}


