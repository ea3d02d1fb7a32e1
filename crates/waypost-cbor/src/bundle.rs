//! # Whole-bundle codec
//!
//! A bundle is an indefinite-length CBOR array: primary block, zero or more
//! extension blocks, and the payload block, then the break byte. Decoding
//! records each block's raw bytes and content position so stored bundles can
//! be re-emitted without re-encoding.

use bytes::{BufMut, Bytes, BytesMut};
use waypost_common::block::{CanonicalData, MAX_CANONICAL_BLOCKS};
use waypost_common::{BlockType, CanonicalHeader, PrimaryFields};

use crate::canonical::{decode_canonical, encode_canonical};
use crate::primary::{decode_primary, encode_primary};
use crate::primitives::{CborReader, BREAK, INDEFINITE_ARRAY};
use crate::CodecError;

/// Upper bound on an encoded bundle accepted on ingress.
pub const MAX_BUNDLE_SIZE: usize = 64 * 1024;

/// Shortest conceivable encoded bundle; anything smaller is garbage.
const MIN_BUNDLE_SIZE: usize = 8;

/// One decoded canonical block plus its wire form.
#[derive(Debug, Clone)]
pub struct DecodedBlock {
    pub header: CanonicalHeader,
    pub data: CanonicalData,
    /// The block's exact encoded bytes.
    pub raw: Bytes,
    /// Offset of the content byte string's content within `raw`.
    pub content_offset: usize,
    pub content_len: usize,
}

/// A decoded bundle with per-block wire forms preserved.
#[derive(Debug, Clone)]
pub struct DecodedBundle {
    pub primary: PrimaryFields,
    /// The primary block's exact encoded bytes.
    pub primary_raw: Bytes,
    pub blocks: Vec<DecodedBlock>,
}

impl DecodedBundle {
    /// Last block matching `block_type`, mirroring the payload-last layout.
    pub fn find_block(&self, block_type: BlockType) -> Option<&DecodedBlock> {
        self.blocks
            .iter()
            .rev()
            .find(|b| b.header.block_type == block_type)
    }
}

/// Decode a complete encoded bundle.
pub fn decode_bundle(input: &[u8]) -> Result<DecodedBundle, CodecError> {
    if input.len() < MIN_BUNDLE_SIZE {
        return Err(CodecError::Truncated);
    }
    if input.len() > MAX_BUNDLE_SIZE {
        return Err(CodecError::TooLong);
    }

    let mut rd = CborReader::new(input);
    rd.enter_indefinite_array()?;

    let primary_start = rd.tell();
    let primary = decode_primary(&mut rd)?;
    let primary_raw = Bytes::copy_from_slice(rd.span(primary_start, rd.tell()));
    let is_admin = primary.is_admin_record();

    let mut blocks = Vec::new();
    loop {
        if rd.at_break()? {
            rd.read_break()?;
            break;
        }
        if blocks.len() == MAX_CANONICAL_BLOCKS {
            return Err(CodecError::TooManyBlocks);
        }
        let (header, data, span) = decode_canonical(&mut rd, is_admin)?;
        blocks.push(DecodedBlock {
            header,
            data,
            raw: Bytes::copy_from_slice(rd.span(span.block_start, span.block_end)),
            content_offset: span.content_offset - span.block_start,
            content_len: span.content_len,
        });
    }

    if rd.remaining() > 0 {
        return Err(CodecError::TrailingBytes);
    }
    if !blocks.iter().any(|b| b.header.block_num == 1) {
        return Err(CodecError::NoPayload);
    }

    Ok(DecodedBundle {
        primary,
        primary_raw,
        blocks,
    })
}

/// Encode a bundle from logical blocks: primary first, extension blocks in
/// the given order, payload (blockNum 1) last, inside an indefinite array.
pub fn encode_bundle(
    primary: &PrimaryFields,
    blocks: &[(CanonicalHeader, CanonicalData)],
) -> BytesMut {
    let mut out = BytesMut::new();
    out.put_u8(INDEFINITE_ARRAY);
    encode_primary(primary, &mut out);
    for (header, data) in blocks.iter().filter(|(h, _)| h.block_num != 1) {
        encode_canonical(header, data, &mut out);
    }
    for (header, data) in blocks.iter().filter(|(h, _)| h.block_num == 1) {
        encode_canonical(header, data, &mut out);
    }
    out.put_u8(BREAK);
    out
}
