//! Streaming, position-based ATN encoder.
//!
//! A single [`Serializer`] owns a growable byte buffer. All multi-byte
//! integers are written little-endian; floats are written as their
//! little-endian IEEE-754 bit pattern.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    /// A `u32`-length-prefixed container (string/bytes/sequence) whose
    /// length does not fit in a `u32`.
    #[error("container length {0} exceeds u32::MAX")]
    Overflow(usize),
}

#[derive(Debug, Default)]
pub struct Serializer {
    buf: Vec<u8>,
}

impl Serializer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self { buf: Vec::with_capacity(cap) }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn put_bool(&mut self, v: bool) {
        self.buf.push(if v { 0x01 } else { 0x00 });
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_i8(&mut self, v: i8) {
        self.buf.push(v as u8);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_i16(&mut self, v: i16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u128(&mut self, v: u128) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_i128(&mut self, v: i128) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// 32-byte little-endian-limb unsigned 256-bit integer, stored as four
    /// `u64` limbs, least-significant limb first.
    pub fn put_u256(&mut self, limbs: [u64; 4]) {
        for limb in limbs {
            self.put_u64(limb);
        }
    }

    pub fn put_f32(&mut self, v: f32) {
        self.buf.extend_from_slice(&v.to_bits().to_le_bytes());
    }

    pub fn put_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_bits().to_le_bytes());
    }

    pub fn put_len(&mut self, len: usize) -> Result<(), EncodeError> {
        let len_u32: u32 = len.try_into().map_err(|_| EncodeError::Overflow(len))?;
        self.put_u32(len_u32);
        Ok(())
    }

    pub fn put_string(&mut self, s: &str) -> Result<(), EncodeError> {
        self.put_bytes(s.as_bytes())
    }

    pub fn put_bytes(&mut self, b: &[u8]) -> Result<(), EncodeError> {
        self.put_len(b.len())?;
        self.buf.extend_from_slice(b);
        Ok(())
    }

    /// Write raw bytes with no length prefix (e.g. a product's fields, which
    /// have no framing of their own).
    pub fn put_raw(&mut self, b: &[u8]) {
        self.buf.extend_from_slice(b);
    }
}
