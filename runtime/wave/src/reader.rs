//! # Binary Reader
//!
//! Cursor over a byte slice. Every read advances the cursor and fails with
//! [`WaveError::Truncated`] instead of reading past the end.
//!
//! LEB128 reads take the declared width of the target integer. A byte
//! sequence whose continuation or unused high bits imply a value wider than
//! that fails with [`WaveError::MalformedVarint`].

use crate::error::{Result, WaveError};

/// Streaming decoder over one byte slice.
#[derive(Debug, Clone)]
pub struct BinaryReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BinaryReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// The unread tail, without consuming it.
    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.read_bytes(len).map(|_| ())
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(WaveError::Truncated);
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let byte = *self.data.get(self.pos).ok_or(WaveError::Truncated)?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_u32_le(&mut self) -> Result<u32> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_u64_le(&mut self) -> Result<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.read_bytes(8)?);
        Ok(u64::from_le_bytes(raw))
    }

    /// Unsigned LEB128 of at most `bits` significant bits (1..=64).
    pub fn read_var_uint(&mut self, bits: u32) -> Result<u64> {
        debug_assert!((1..=64).contains(&bits));
        let mut result = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            let payload = u64::from(byte & 0x7f);
            if shift + 7 > bits {
                let room = bits - shift;
                if byte & 0x80 != 0 || payload >> room != 0 {
                    return Err(WaveError::MalformedVarint);
                }
            }
            result |= payload << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
    }

    /// Signed LEB128 of at most `bits` significant bits (1..=64), sign
    /// extended to 64 bits.
    pub fn read_var_int(&mut self, bits: u32) -> Result<i64> {
        debug_assert!((1..=64).contains(&bits));
        let mut result = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            let payload = u64::from(byte & 0x7f);
            if shift + 7 >= bits {
                // Last byte allowed: bits above the sign bit must copy it.
                let room = bits - shift;
                let unused = 0x7f & !((1u64 << room) - 1);
                let sign = (payload >> (room - 1)) & 1;
                let expected = if sign == 1 { unused } else { 0 };
                if byte & 0x80 != 0 || payload & unused != expected {
                    return Err(WaveError::MalformedVarint);
                }
            }
            result |= payload << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                if shift < 64 && byte & 0x40 != 0 {
                    result |= !0u64 << shift;
                }
                return Ok(result as i64);
            }
        }
    }

    pub fn read_var_u1(&mut self) -> Result<bool> {
        Ok(self.read_var_uint(1)? != 0)
    }

    pub fn read_var_u7(&mut self) -> Result<u8> {
        Ok(self.read_var_uint(7)? as u8)
    }

    pub fn read_var_u32(&mut self) -> Result<u32> {
        Ok(self.read_var_uint(32)? as u32)
    }

    pub fn read_var_u64(&mut self) -> Result<u64> {
        self.read_var_uint(64)
    }

    pub fn read_var_i32(&mut self) -> Result<i32> {
        Ok(self.read_var_int(32)? as i32)
    }

    pub fn read_var_i64(&mut self) -> Result<i64> {
        self.read_var_int(64)
    }

    /// Length-prefixed UTF-8 string.
    pub fn read_name(&mut self) -> Result<String> {
        let len = self.read_var_u32()? as usize;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| WaveError::MalformedSection("name is not valid UTF-8".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasm_encoder::Encode;

    /// LEB128 encoding of `value`, as the module encoder writes it.
    fn leb(value: impl Encode) -> Vec<u8> {
        let mut bytes = Vec::new();
        value.encode(&mut bytes);
        bytes
    }

    #[test]
    fn test_varuint_values() {
        for value in [0u64, 1, 127, 128, 624485, u32::MAX as u64] {
            let bytes = leb(value);
            let mut reader = BinaryReader::new(&bytes);
            assert_eq!(reader.read_var_u32().unwrap() as u64, value);
            assert!(reader.is_empty());
        }
        let bytes = leb(u64::MAX);
        assert_eq!(BinaryReader::new(&bytes).read_var_u64().unwrap(), u64::MAX);
    }

    #[test]
    fn test_varint_values() {
        for value in [0i64, -1, 63, -64, 64, -65, -123456, i32::MIN as i64, i32::MAX as i64] {
            let bytes = leb(value);
            let mut reader = BinaryReader::new(&bytes);
            assert_eq!(reader.read_var_i32().unwrap() as i64, value);
            assert!(reader.is_empty());
        }
        for value in [i64::MIN, i64::MAX] {
            let bytes = leb(value);
            assert_eq!(BinaryReader::new(&bytes).read_var_i64().unwrap(), value);
        }
    }

    #[test]
    fn test_overlong_padding_within_width() {
        // 0 padded to the full five bytes still fits 32 bits.
        let mut reader = BinaryReader::new(&[0x80, 0x80, 0x80, 0x80, 0x00]);
        assert_eq!(reader.read_var_u32().unwrap(), 0);
        // -1 padded to five bytes.
        let mut reader = BinaryReader::new(&[0xff, 0xff, 0xff, 0xff, 0x7f]);
        assert_eq!(reader.read_var_i32().unwrap(), -1);
    }

    #[test]
    fn test_varuint_overflow() {
        // 2^32 does not fit 32 bits.
        let mut reader = BinaryReader::new(&[0x80, 0x80, 0x80, 0x80, 0x10]);
        assert_eq!(reader.read_var_u32(), Err(WaveError::MalformedVarint));
        // Sixth byte for a 32-bit integer.
        let mut reader = BinaryReader::new(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x00]);
        assert_eq!(reader.read_var_u32(), Err(WaveError::MalformedVarint));
        // varuint1 only admits 0 and 1.
        assert_eq!(BinaryReader::new(&[0x02]).read_var_u1(), Err(WaveError::MalformedVarint));
        // Eleventh byte for a 64-bit integer.
        let mut bytes = vec![0x80u8; 10];
        bytes.push(0x00);
        assert_eq!(BinaryReader::new(&bytes).read_var_u64(), Err(WaveError::MalformedVarint));
    }

    #[test]
    fn test_varint_overflow() {
        // Unused bits of the fifth byte must repeat the sign bit.
        let mut reader = BinaryReader::new(&[0xff, 0xff, 0xff, 0xff, 0x4f]);
        assert_eq!(reader.read_var_i32(), Err(WaveError::MalformedVarint));
        let mut reader = BinaryReader::new(&[0x80, 0x80, 0x80, 0x80, 0x70]);
        assert_eq!(reader.read_var_i32(), Err(WaveError::MalformedVarint));
    }

    #[test]
    fn test_truncation() {
        let mut reader = BinaryReader::new(&[0x80, 0x80]);
        assert_eq!(reader.read_var_u32(), Err(WaveError::Truncated));
        let mut reader = BinaryReader::new(&[0x01, 0x02, 0x03]);
        assert_eq!(reader.read_u32_le(), Err(WaveError::Truncated));
        let mut reader = BinaryReader::new(&[0x05, b'a', b'b']);
        assert_eq!(reader.read_name(), Err(WaveError::Truncated));
    }

    #[test]
    fn test_name_and_fixed_reads() {
        let bytes = [0x04, b'm', b'a', b'i', b'n', 0x00, 0x61, 0x73, 0x6d];
        let mut reader = BinaryReader::new(&bytes);
        assert_eq!(reader.read_name().unwrap(), "main");
        assert_eq!(reader.read_u32_le().unwrap(), 0x6d73_6100);
        assert_eq!(reader.position(), bytes.len());
    }
}
