//! Streaming, position-based ATN decoder.
//!
//! A single [`Deserializer`] owns a byte slice and a cursor. Every read
//! either advances the cursor and returns a value, or fails without
//! mutating the cursor.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected end of data")]
    UnexpectedEndOfData,
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),
    #[error("unknown enum tag {0}")]
    InvalidEnumTag(u8),
    #[error("trailing data: {0} unread bytes")]
    TrailingData(usize),
}

pub struct Deserializer<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Deserializer<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn expect_exhausted(&self) -> Result<(), DecodeError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(DecodeError::TrailingData(self.remaining()))
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::UnexpectedEndOfData);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn get_bool(&mut self) -> Result<bool, DecodeError> {
        match self.take(1)?[0] {
            0x00 => Ok(false),
            0x01 => Ok(true),
            other => Err(DecodeError::InvalidData(format!("bad bool byte {other:#04x}"))),
        }
    }

    pub fn get_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_i8(&mut self) -> Result<i8, DecodeError> {
        Ok(self.take(1)?[0] as i8)
    }

    pub fn get_u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn get_i16(&mut self) -> Result<i16, DecodeError> {
        Ok(i16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn get_u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn get_i32(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn get_u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn get_i64(&mut self) -> Result<i64, DecodeError> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn get_u128(&mut self) -> Result<u128, DecodeError> {
        Ok(u128::from_le_bytes(self.take(16)?.try_into().unwrap()))
    }

    pub fn get_i128(&mut self) -> Result<i128, DecodeError> {
        Ok(i128::from_le_bytes(self.take(16)?.try_into().unwrap()))
    }

    /// 32-byte little-endian-limb unsigned 256-bit integer as four `u64`
    /// limbs, least-significant limb first.
    pub fn get_u256(&mut self) -> Result<[u64; 4], DecodeError> {
        let mut limbs = [0u64; 4];
        for limb in &mut limbs {
            *limb = self.get_u64()?;
        }
        Ok(limbs)
    }

    pub fn get_f32(&mut self) -> Result<f32, DecodeError> {
        Ok(f32::from_bits(self.get_u32()?))
    }

    pub fn get_f64(&mut self) -> Result<f64, DecodeError> {
        Ok(f64::from_bits(self.get_u64()?))
    }

    pub fn get_len(&mut self) -> Result<usize, DecodeError> {
        Ok(self.get_u32()? as usize)
    }

    pub fn get_string(&mut self) -> Result<String, DecodeError> {
        let bytes = self.get_bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|e| DecodeError::InvalidEncoding(e.to_string()))
    }

    pub fn get_bytes(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.get_len()?;
        self.take(len)
    }

    /// Read exactly `n` raw bytes with no length prefix (e.g. a fixed-width
    /// product field).
    pub fn get_raw(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        self.take(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_enum_tag_error_constructs() {
        let err = DecodeError::InvalidEnumTag(9);
        assert_eq!(err.to_string(), "unknown enum tag 9");
    }

    #[test]
    fn take_fails_without_advancing_on_short_input() {
        let mut de = Deserializer::new(&[1, 2]);
        assert!(de.get_u32().is_err());
        assert_eq!(de.position(), 0);
    }

    #[test]
    fn trailing_data_detected() {
        let de = Deserializer::new(&[1, 2, 3]);
        assert_eq!(de.expect_exhausted().unwrap_err(), DecodeError::TrailingData(3));
    }
}
