//! # Canonical block codec
//!
//! A canonical block is a 6-element definite array:
//! `[blockType, blockNum, flags, crcType, bstr(content), crc]`.
//!
//! The block-type-specific content always rides inside the byte string; for
//! the payload block the byte string *is* the ADU. The payload block of an
//! administrative-record bundle is parsed further and retagged internally as
//! a custody-accept payload when it carries one.

use bytes::{Bytes, BytesMut};
use waypost_common::{
    AdminRecord, BlockType, CanonicalHeader, CustodyAcceptPayload, ADMIN_RECORD_CUSTODY_ACCEPT,
};
use waypost_common::block::CanonicalData;

use crate::primary::{
    finish_block_crc, read_and_check_crc, read_crc_type, read_eid, write_eid,
};
use crate::primitives::{write_array_head, write_bstr, write_uint, CborReader};
use crate::CodecError;

/// Upper bound on sequence numbers in one custody-accept record.
const MAX_ACK_SEQS: usize = 64;

/// Byte positions of a decoded canonical block within its bundle buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanonicalSpan {
    pub block_start: usize,
    pub block_end: usize,
    pub content_offset: usize,
    pub content_len: usize,
}

fn encode_content(data: &CanonicalData, out: &mut BytesMut) {
    match data {
        CanonicalData::Payload(bytes) | CanonicalData::Opaque(bytes) => {
            out.extend_from_slice(bytes);
        }
        CanonicalData::PreviousNode(addr) => write_eid(out, addr),
        CanonicalData::BundleAge(age) => write_uint(out, *age),
        CanonicalData::HopCount { limit, count } => {
            write_array_head(out, 2);
            write_uint(out, *limit);
            write_uint(out, *count);
        }
        CanonicalData::CustodyTracking { current_custodian }
        | CanonicalData::PreviousCustodian { current_custodian } => {
            write_eid(out, current_custodian);
        }
        CanonicalData::Admin(AdminRecord::CustodyAccept(payload)) => {
            write_array_head(out, 2);
            write_uint(out, ADMIN_RECORD_CUSTODY_ACCEPT);
            write_array_head(out, 2);
            write_eid(out, &payload.flow_source_eid);
            write_array_head(out, payload.sequence_nums.len() as u64);
            for &seq in &payload.sequence_nums {
                write_uint(out, seq);
            }
        }
    }
}

/// Encode a canonical block, CRC included, appending to `out`.
pub fn encode_canonical(header: &CanonicalHeader, data: &CanonicalData, out: &mut BytesMut) {
    let block_start = out.len();
    let fields = if header.crc_type == waypost_common::CrcType::None {
        5
    } else {
        6
    };
    write_array_head(out, fields);
    write_uint(out, header.block_type.wire_code());
    write_uint(out, header.block_num);
    write_uint(out, header.flags);
    write_uint(out, header.crc_type.code());

    let mut content = BytesMut::new();
    encode_content(data, &mut content);
    write_bstr(out, &content);

    if header.crc_type != waypost_common::CrcType::None {
        finish_block_crc(out, header.crc_type, block_start);
    }
}

fn parse_admin_record(content: &[u8]) -> Result<Option<AdminRecord>, CodecError> {
    let mut rd = CborReader::new(content);
    if rd.read_array_head().map_err(|_| CodecError::BadAdminRecord)? != 2 {
        return Err(CodecError::BadAdminRecord);
    }
    let record_type = rd.read_uint().map_err(|_| CodecError::BadAdminRecord)?;
    if record_type != ADMIN_RECORD_CUSTODY_ACCEPT {
        // Unknown record kinds are carried opaquely, not rejected.
        return Ok(None);
    }
    if rd.read_array_head().map_err(|_| CodecError::BadAdminRecord)? != 2 {
        return Err(CodecError::BadAdminRecord);
    }
    let flow_source_eid = read_eid(&mut rd).map_err(|_| CodecError::BadAdminRecord)?;
    let count = rd.read_array_head().map_err(|_| CodecError::BadAdminRecord)?;
    if count > MAX_ACK_SEQS {
        return Err(CodecError::BadAdminRecord);
    }
    let mut sequence_nums = Vec::with_capacity(count);
    for _ in 0..count {
        sequence_nums.push(rd.read_uint().map_err(|_| CodecError::BadAdminRecord)?);
    }
    Ok(Some(AdminRecord::CustodyAccept(CustodyAcceptPayload {
        flow_source_eid,
        sequence_nums,
    })))
}

fn parse_content(
    block_type: BlockType,
    content: &[u8],
    is_admin_record: bool,
) -> Result<(BlockType, CanonicalData), CodecError> {
    let data = match block_type {
        BlockType::Payload if is_admin_record => match parse_admin_record(content)? {
            Some(record) => {
                return Ok((BlockType::CustodyAcceptPayload, CanonicalData::Admin(record)))
            }
            None => CanonicalData::Payload(Bytes::copy_from_slice(content)),
        },
        BlockType::Payload => CanonicalData::Payload(Bytes::copy_from_slice(content)),
        BlockType::PreviousNode => {
            let mut rd = CborReader::new(content);
            CanonicalData::PreviousNode(read_eid(&mut rd).map_err(|_| CodecError::Field("previous node"))?)
        }
        BlockType::BundleAge => {
            let mut rd = CborReader::new(content);
            CanonicalData::BundleAge(rd.read_uint().map_err(|_| CodecError::Field("bundle age"))?)
        }
        BlockType::HopCount => {
            let mut rd = CborReader::new(content);
            if rd.read_array_head().map_err(|_| CodecError::Field("hop count"))? != 2 {
                return Err(CodecError::Field("hop count"));
            }
            CanonicalData::HopCount {
                limit: rd.read_uint().map_err(|_| CodecError::Field("hop count"))?,
                count: rd.read_uint().map_err(|_| CodecError::Field("hop count"))?,
            }
        }
        BlockType::CustodyTracking => {
            let mut rd = CborReader::new(content);
            CanonicalData::CustodyTracking {
                current_custodian: read_eid(&mut rd)
                    .map_err(|_| CodecError::Field("custody tracking"))?,
            }
        }
        BlockType::PreviousCustodian => {
            let mut rd = CborReader::new(content);
            CanonicalData::PreviousCustodian {
                current_custodian: read_eid(&mut rd)
                    .map_err(|_| CodecError::Field("previous custodian"))?,
            }
        }
        BlockType::CustodyAcceptPayload | BlockType::Other(_) => {
            CanonicalData::Opaque(Bytes::copy_from_slice(content))
        }
    };
    Ok((block_type, data))
}

/// Decode one canonical block at the reader's position.
///
/// `is_admin_record` comes from the already-decoded primary block and selects
/// administrative-record parsing for the payload content.
pub fn decode_canonical(
    rd: &mut CborReader<'_>,
    is_admin_record: bool,
) -> Result<(CanonicalHeader, CanonicalData, CanonicalSpan), CodecError> {
    let block_start = rd.tell();
    if rd.read_array_head()? != 6 {
        return Err(CodecError::Field("canonical block"));
    }

    let block_type = BlockType::from_code(rd.read_uint()?);
    let block_num = rd.read_uint()?;
    let flags = rd.read_uint()?;
    let crc_type = read_crc_type(rd)?;

    let content = rd.read_bstr()?;
    let content_offset = rd.tell() - content.len();
    let (block_type, data) = parse_content(block_type, content, is_admin_record)?;

    read_and_check_crc(rd, crc_type, block_start, "canonical")?;

    let header = CanonicalHeader {
        block_type,
        block_num,
        flags,
        crc_type,
    };
    let span = CanonicalSpan {
        block_start,
        block_end: rd.tell(),
        content_offset,
        content_len: content.len(),
    };
    Ok((header, data, span))
}

#[cfg(test)]
mod tests {
    use super::*;
    use waypost_common::{CrcType, IpnAddr};

    fn roundtrip(header: CanonicalHeader, data: CanonicalData) -> (CanonicalHeader, CanonicalData) {
        let mut buf = BytesMut::new();
        encode_canonical(&header, &data, &mut buf);
        let mut rd = CborReader::new(&buf);
        let is_admin = matches!(data, CanonicalData::Admin(_));
        let (h, d, span) = decode_canonical(&mut rd, is_admin).unwrap();
        assert_eq!(span.block_start, 0);
        assert_eq!(span.block_end, buf.len());
        assert_eq!(rd.remaining(), 0);
        (h, d)
    }

    #[test]
    fn payload_roundtrip() {
        let header = CanonicalHeader {
            block_type: BlockType::Payload,
            block_num: 1,
            flags: 0,
            crc_type: CrcType::Crc32c,
        };
        let data = CanonicalData::Payload(Bytes::from_static(b"application data unit"));
        let (h, d) = roundtrip(header, data.clone());
        assert_eq!(h, header);
        assert_eq!(d, data);
    }

    #[test]
    fn custody_tracking_roundtrip() {
        let header = CanonicalHeader {
            block_type: BlockType::CustodyTracking,
            block_num: BlockType::CUSTODY_TRACKING_CODE,
            flags: 0,
            crc_type: CrcType::Crc16,
        };
        let data = CanonicalData::CustodyTracking {
            current_custodian: IpnAddr::new(10, 1),
        };
        let (h, d) = roundtrip(header, data.clone());
        assert_eq!(h, header);
        assert_eq!(d, data);
    }

    #[test]
    fn hop_count_roundtrip() {
        let header = CanonicalHeader {
            block_type: BlockType::HopCount,
            block_num: 2,
            flags: 0,
            crc_type: CrcType::Crc16,
        };
        let data = CanonicalData::HopCount {
            limit: 32,
            count: 3,
        };
        let (_, d) = roundtrip(header, data.clone());
        assert_eq!(d, data);
    }

    #[test]
    fn custody_accept_record_retags_payload() {
        let header = CanonicalHeader {
            block_type: BlockType::CustodyAcceptPayload,
            block_num: 1,
            flags: 0,
            crc_type: CrcType::Crc16,
        };
        let data = CanonicalData::Admin(AdminRecord::CustodyAccept(CustodyAcceptPayload {
            flow_source_eid: IpnAddr::new(20, 2),
            sequence_nums: vec![100, 101, 102],
        }));
        let (h, d) = roundtrip(header, data.clone());
        assert_eq!(h.block_type, BlockType::CustodyAcceptPayload);
        assert_eq!(d, data);
    }

    #[test]
    fn unknown_block_type_is_opaque() {
        let header = CanonicalHeader {
            block_type: BlockType::Other(42),
            block_num: 3,
            flags: 0,
            crc_type: CrcType::Crc16,
        };
        let data = CanonicalData::Opaque(Bytes::from_static(b"\x01\x02\x03"));
        let (h, d) = roundtrip(header, data.clone());
        assert_eq!(h.block_type, BlockType::Other(42));
        assert_eq!(d, data);
    }

    #[test]
    fn corrupted_content_fails_crc() {
        let header = CanonicalHeader {
            block_type: BlockType::Payload,
            block_num: 1,
            flags: 0,
            crc_type: CrcType::Crc16,
        };
        let mut buf = BytesMut::new();
        encode_canonical(
            &header,
            &CanonicalData::Payload(Bytes::from_static(b"data")),
            &mut buf,
        );
        let mid = buf.len() / 2;
        buf[mid] ^= 0x80;
        let mut rd = CborReader::new(&buf);
        assert!(decode_canonical(&mut rd, false).is_err());
    }
}


