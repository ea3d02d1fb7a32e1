//! # CBOR primitives
//!
//! The small CBOR subset BPv7 needs: unsigned integers, byte strings,
//! definite arrays, and the indefinite-array framing of the outer bundle.
//! Integers always use the smallest encoding that holds the value (RFC 8949
//! preferred serialization), which BPv7 requires.

use bytes::{BufMut, BytesMut};

use crate::CodecError;

// ─── Major types ─────────────────────────────────────────────────────────────

pub const MAJOR_UINT: u8 = 0;
pub const MAJOR_BSTR: u8 = 2;
pub const MAJOR_ARRAY: u8 = 4;

/// Initial byte of an indefinite-length array.
pub const INDEFINITE_ARRAY: u8 = 0x9F;
/// "Break" terminator for indefinite-length items.
pub const BREAK: u8 = 0xFF;

// ─── Writer ─────────────────────────────────────────────────────────────────

/// Emit a CBOR head: major type + smallest-width argument.
pub fn write_head(out: &mut BytesMut, major: u8, value: u64) {
    let tag = major << 5;
    if value < 24 {
        out.put_u8(tag | value as u8);
    } else if value <= u8::MAX as u64 {
        out.put_u8(tag | 24);
        out.put_u8(value as u8);
    } else if value <= u16::MAX as u64 {
        out.put_u8(tag | 25);
        out.put_u16(value as u16);
    } else if value <= u32::MAX as u64 {
        out.put_u8(tag | 26);
        out.put_u32(value as u32);
    } else {
        out.put_u8(tag | 27);
        out.put_u64(value);
    }
}

pub fn write_uint(out: &mut BytesMut, value: u64) {
    write_head(out, MAJOR_UINT, value);
}

pub fn write_array_head(out: &mut BytesMut, len: u64) {
    write_head(out, MAJOR_ARRAY, len);
}

pub fn write_bstr(out: &mut BytesMut, data: &[u8]) {
    write_head(out, MAJOR_BSTR, data.len() as u64);
    out.put_slice(data);
}

/// Number of bytes `write_head` will emit for `value`.
pub fn head_len(value: u64) -> usize {
    if value < 24 {
        1
    } else if value <= u8::MAX as u64 {
        2
    } else if value <= u16::MAX as u64 {
        3
    } else if value <= u32::MAX as u64 {
        5
    } else {
        9
    }
}

// ─── Reader ─────────────────────────────────────────────────────────────────

/// Cursor over an encoded buffer that tracks its byte offset, so callers can
/// record block boundaries for CRC validation and re-emission.
pub struct CborReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> CborReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        CborReader { buf, pos: 0 }
    }

    /// Current byte offset from the start of the buffer.
    pub fn tell(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::Truncated);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn peek_byte(&self) -> Result<u8, CodecError> {
        self.buf.get(self.pos).copied().ok_or(CodecError::Truncated)
    }

    /// Read a head, returning `(major, argument)`. Rejects indefinite heads.
    fn read_head(&mut self) -> Result<(u8, u64), CodecError> {
        let initial = self.take(1)?[0];
        let major = initial >> 5;
        let info = initial & 0x1F;
        let arg = match info {
            0..=23 => info as u64,
            24 => self.take(1)?[0] as u64,
            25 => u16::from_be_bytes(self.take(2)?.try_into().unwrap()) as u64,
            26 => u32::from_be_bytes(self.take(4)?.try_into().unwrap()) as u64,
            27 => u64::from_be_bytes(self.take(8)?.try_into().unwrap()),
            _ => return Err(CodecError::UnexpectedType("definite-length item")),
        };
        Ok((major, arg))
    }

    pub fn read_uint(&mut self) -> Result<u64, CodecError> {
        let (major, arg) = self.read_head()?;
        if major != MAJOR_UINT {
            return Err(CodecError::UnexpectedType("unsigned integer"));
        }
        Ok(arg)
    }

    /// Read a definite-length array head, returning the element count.
    pub fn read_array_head(&mut self) -> Result<usize, CodecError> {
        let (major, arg) = self.read_head()?;
        if major != MAJOR_ARRAY {
            return Err(CodecError::UnexpectedType("array"));
        }
        Ok(arg as usize)
    }

    pub fn read_bstr(&mut self) -> Result<&'a [u8], CodecError> {
        let (major, arg) = self.read_head()?;
        if major != MAJOR_BSTR {
            return Err(CodecError::UnexpectedType("byte string"));
        }
        self.take(arg as usize)
    }

    /// True when the next byte opens an indefinite-length array.
    pub fn at_indefinite_array(&self) -> Result<bool, CodecError> {
        Ok(self.peek_byte()? == INDEFINITE_ARRAY)
    }

    /// Consume the indefinite-array initial byte.
    pub fn enter_indefinite_array(&mut self) -> Result<(), CodecError> {
        if self.take(1)?[0] != INDEFINITE_ARRAY {
            return Err(CodecError::UnexpectedType("indefinite array"));
        }
        Ok(())
    }

    /// True when the next byte is the break terminator (does not consume).
    pub fn at_break(&self) -> Result<bool, CodecError> {
        Ok(self.peek_byte()? == BREAK)
    }

    pub fn read_break(&mut self) -> Result<(), CodecError> {
        if self.take(1)?[0] != BREAK {
            return Err(CodecError::UnexpectedType("break"));
        }
        Ok(())
    }

    /// Borrow an already-visited byte range, for CRC checks over block spans.
    pub fn span(&self, start: usize, end: usize) -> &'a [u8] {
        &self.buf[start..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uint_boundaries_use_smallest_encoding() {
        let cases: &[(u64, usize)] = &[
            (0, 1),
            (23, 1),
            (24, 2),
            (255, 2),
            (256, 3),
            (65_535, 3),
            (65_536, 5),
            (u32::MAX as u64, 5),
            (u32::MAX as u64 + 1, 9),
            (u64::MAX, 9),
        ];
        for &(value, expected) in cases {
            let mut buf = BytesMut::new();
            write_uint(&mut buf, value);
            assert_eq!(buf.len(), expected, "encoded width for {value}");
            assert_eq!(head_len(value), expected);
            let mut rd = CborReader::new(&buf);
            assert_eq!(rd.read_uint().unwrap(), value);
            assert_eq!(rd.remaining(), 0);
        }
    }

    #[test]
    fn bstr_roundtrip() {
        let mut buf = BytesMut::new();
        write_bstr(&mut buf, b"abcd");
        let mut rd = CborReader::new(&buf);
        assert_eq!(rd.read_bstr().unwrap(), b"abcd");
    }

    #[test]
    fn array_head_roundtrip() {
        let mut buf = BytesMut::new();
        write_array_head(&mut buf, 9);
        let mut rd = CborReader::new(&buf);
        assert_eq!(rd.read_array_head().unwrap(), 9);
    }

    #[test]
    fn indefinite_array_framing() {
        let mut buf = BytesMut::new();
        buf.put_u8(INDEFINITE_ARRAY);
        write_uint(&mut buf, 1);
        buf.put_u8(BREAK);

        let mut rd = CborReader::new(&buf);
        assert!(rd.at_indefinite_array().unwrap());
        rd.enter_indefinite_array().unwrap();
        assert!(!rd.at_break().unwrap());
        assert_eq!(rd.read_uint().unwrap(), 1);
        assert!(rd.at_break().unwrap());
        rd.read_break().unwrap();
        assert_eq!(rd.remaining(), 0);
    }

    #[test]
    fn truncated_input_is_detected() {
        let mut buf = BytesMut::new();
        write_uint(&mut buf, 300);
        let mut rd = CborReader::new(&buf[..1]);
        assert_eq!(rd.read_uint(), Err(CodecError::Truncated));
    }

    #[test]
    fn wrong_major_type_is_detected() {
        let mut buf = BytesMut::new();
        write_bstr(&mut buf, b"x");
        let mut rd = CborReader::new(&buf);
        assert!(matches!(
            rd.read_uint(),
            Err(CodecError::UnexpectedType(_))
        ));
    }
}


