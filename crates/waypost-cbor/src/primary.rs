//! # Primary block codec
//!
//! The primary block is a 9-element definite array:
//! `[version, flags, crcType, destEID, sourceEID, reportToEID,
//! [creationTime, seq], lifetime, crc]`.
//!
//! Only CRC-16/X.25 and CRC-32C are accepted; a CRC-less primary block is
//! rejected on ingress (security blocks, which would justify it, are out of
//! scope).

use bytes::BytesMut;
use waypost_common::eid::EID_SCHEME_IPN;
use waypost_common::{block::bundle_flags, block::BP_VERSION, CreationTimestamp, CrcType, IpnAddr,
    PrimaryFields};

use crate::crc::{compute_block_crc, patch_block_crc, unpack_crc_field};
use crate::primitives::{write_array_head, write_head, write_uint, CborReader, MAJOR_BSTR};
use crate::CodecError;

pub(crate) fn write_eid(out: &mut BytesMut, addr: &IpnAddr) {
    write_array_head(out, 2);
    write_uint(out, EID_SCHEME_IPN);
    write_array_head(out, 2);
    write_uint(out, addr.node);
    write_uint(out, addr.service);
}

pub(crate) fn read_eid(rd: &mut CborReader<'_>) -> Result<IpnAddr, CodecError> {
    if rd.read_array_head()? != 2 {
        return Err(CodecError::Field("EID"));
    }
    let scheme = rd.read_uint()?;
    if scheme != EID_SCHEME_IPN {
        return Err(CodecError::BadEidScheme(scheme));
    }
    if rd.read_array_head()? != 2 {
        return Err(CodecError::Field("EID SSP"));
    }
    Ok(IpnAddr {
        node: rd.read_uint()?,
        service: rd.read_uint()?,
    })
}

fn read_timestamp(rd: &mut CborReader<'_>) -> Result<CreationTimestamp, CodecError> {
    if rd.read_array_head()? != 2 {
        return Err(CodecError::Field("creation timestamp"));
    }
    Ok(CreationTimestamp {
        time: rd.read_uint()?,
        sequence: rd.read_uint()?,
    })
}

/// Validate the CRC type code: only CRC-16 and CRC-32C pass.
pub(crate) fn read_crc_type(rd: &mut CborReader<'_>) -> Result<CrcType, CodecError> {
    let code = rd.read_uint()?;
    match CrcType::from_code(code) {
        Some(CrcType::Crc16) => Ok(CrcType::Crc16),
        Some(CrcType::Crc32c) => Ok(CrcType::Crc32c),
        _ => Err(CodecError::UnsupportedCrcType(code)),
    }
}

/// Read the trailing CRC field, then check it over `[block_start, here)`.
pub(crate) fn read_and_check_crc(
    rd: &mut CborReader<'_>,
    crc_type: CrcType,
    block_start: usize,
    which: &'static str,
) -> Result<(), CodecError> {
    let field = rd.read_bstr()?;
    let content_offset = rd.tell() - field.len();
    let stored = unpack_crc_field(crc_type, field)?;
    let block = rd.span(block_start, rd.tell());
    let computed = compute_block_crc(crc_type, block, content_offset - block_start);
    if computed != stored {
        return Err(CodecError::CrcMismatch(which));
    }
    Ok(())
}

/// Append the CRC field (zero-filled), then compute and patch it in place.
/// `block_start` is the offset of the block's array head within `out`.
pub(crate) fn finish_block_crc(out: &mut BytesMut, crc_type: CrcType, block_start: usize) {
    let width = crc_type.width();
    write_head(out, MAJOR_BSTR, width as u64);
    let content_offset = out.len();
    out.resize(content_offset + width, 0);
    let value = compute_block_crc(crc_type, &out[block_start..], content_offset - block_start);
    patch_block_crc(crc_type, &mut out[block_start..], content_offset - block_start, value);
}

/// Encode a primary block, CRC included, appending to `out`.
pub fn encode_primary(pri: &PrimaryFields, out: &mut BytesMut) {
    let block_start = out.len();
    let fields = if pri.crc_type == CrcType::None { 8 } else { 9 };
    write_array_head(out, fields);
    write_uint(out, BP_VERSION);
    write_uint(out, pri.flags);
    write_uint(out, pri.crc_type.code());
    write_eid(out, &pri.destination);
    write_eid(out, &pri.source);
    write_eid(out, &pri.report_to);
    write_array_head(out, 2);
    write_uint(out, pri.timestamp.time);
    write_uint(out, pri.timestamp.sequence);
    write_uint(out, pri.lifetime);
    if pri.crc_type != CrcType::None {
        finish_block_crc(out, pri.crc_type, block_start);
    }
}

/// Decode a primary block at the reader's position, validating version,
/// processing flags, CRC type, and the CRC itself.
pub fn decode_primary(rd: &mut CborReader<'_>) -> Result<PrimaryFields, CodecError> {
    let block_start = rd.tell();
    if rd.read_array_head()? != 9 {
        return Err(CodecError::Field("primary block"));
    }

    let version = rd.read_uint()?;
    if version != BP_VERSION {
        return Err(CodecError::WrongVersion(version));
    }

    let flags = rd.read_uint()?;
    if flags & bundle_flags::IS_ADMIN_RECORD != 0 && flags & bundle_flags::STATUS_MASK != 0 {
        return Err(CodecError::BadProcFlags);
    }

    let crc_type = read_crc_type(rd)?;
    let destination = read_eid(rd).map_err(field_as("destination EID"))?;
    let source = read_eid(rd).map_err(field_as("source EID"))?;
    let report_to = read_eid(rd).map_err(field_as("report-to EID"))?;
    let timestamp = read_timestamp(rd)?;
    let lifetime = rd.read_uint().map_err(field_as("lifetime"))?;

    read_and_check_crc(rd, crc_type, block_start, "primary")?;

    Ok(PrimaryFields {
        flags,
        crc_type,
        destination,
        source,
        report_to,
        timestamp,
        lifetime,
    })
}

/// Keep scheme/CRC errors intact, relabel generic shape errors to the field.
fn field_as(name: &'static str) -> impl Fn(CodecError) -> CodecError {
    move |err| match err {
        CodecError::BadEidScheme(s) => CodecError::BadEidScheme(s),
        CodecError::Truncated => CodecError::Truncated,
        _ => CodecError::Field(name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_primary() -> PrimaryFields {
        PrimaryFields {
            flags: 0,
            crc_type: CrcType::Crc16,
            destination: IpnAddr::new(30, 3),
            source: IpnAddr::new(20, 2),
            report_to: IpnAddr::new(20, 2),
            timestamp: CreationTimestamp {
                time: 1000,
                sequence: 7,
            },
            lifetime: 60_000,
        }
    }

    #[test]
    fn roundtrip_crc16() {
        let mut buf = BytesMut::new();
        encode_primary(&sample_primary(), &mut buf);
        let mut rd = CborReader::new(&buf);
        let decoded = decode_primary(&mut rd).unwrap();
        assert_eq!(decoded, sample_primary());
        assert_eq!(rd.remaining(), 0);
    }

    #[test]
    fn roundtrip_crc32c() {
        let mut pri = sample_primary();
        pri.crc_type = CrcType::Crc32c;
        let mut buf = BytesMut::new();
        encode_primary(&pri, &mut buf);
        let mut rd = CborReader::new(&buf);
        assert_eq!(decode_primary(&mut rd).unwrap(), pri);
    }

    #[test]
    fn corrupted_byte_fails_crc() {
        let mut buf = BytesMut::new();
        encode_primary(&sample_primary(), &mut buf);
        let last_field_byte = buf.len() - 4;
        buf[last_field_byte] ^= 0x01;
        let mut rd = CborReader::new(&buf);
        assert!(matches!(
            decode_primary(&mut rd),
            Err(CodecError::CrcMismatch("primary"))
        ));
    }

    #[test]
    fn wrong_version_rejected() {
        let mut buf = BytesMut::new();
        encode_primary(&sample_primary(), &mut buf);
        // Version is the second byte (array head, then uint 7).
        buf[1] = 6;
        let mut rd = CborReader::new(&buf);
        assert_eq!(decode_primary(&mut rd), Err(CodecError::WrongVersion(6)));
    }

    #[test]
    fn admin_record_with_status_reports_rejected() {
        let mut pri = sample_primary();
        pri.flags = bundle_flags::IS_ADMIN_RECORD | bundle_flags::REPORT_RECEPTION;
        let mut buf = BytesMut::new();
        encode_primary(&pri, &mut buf);
        let mut rd = CborReader::new(&buf);
        assert_eq!(decode_primary(&mut rd), Err(CodecError::BadProcFlags));
    }

    #[test]
    fn crc_none_rejected_on_decode() {
        let mut pri = sample_primary();
        pri.crc_type = CrcType::None;
        let mut buf = BytesMut::new();
        encode_primary(&pri, &mut buf);
        let mut rd = CborReader::new(&buf);
        assert_eq!(
            decode_primary(&mut rd),
            Err(CodecError::Field("primary block"))
        );
    }
}


