//! Tagged decompression of inbound frames (§4.C).
//!
//! Every inbound frame begins with a single compression tag byte. The
//! remainder is the (possibly compressed) ATN-encoded server message.
//! Outbound frames are never compressed by this layer.

use std::io::{self, Cursor, Read};
use thiserror::Error;

/// The compression tag prefixing every inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionTag {
    None = 0,
    Brotli = 1,
    Zlib = 2,
}

impl CompressionTag {
    fn from_u8(tag: u8) -> Result<Self, CompressionError> {
        match tag {
            0 => Ok(CompressionTag::None),
            1 => Ok(CompressionTag::Brotli),
            2 => Ok(CompressionTag::Zlib),
            other => Err(CompressionError::UnknownCompressionTag(other)),
        }
    }
}

#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("frame had no compression tag byte")]
    InsufficientData,
    #[error("unknown compression tag {0}")]
    UnknownCompressionTag(u8),
    #[error("{algorithm} decompression failed: {cause}")]
    DecompressionFailed { algorithm: &'static str, cause: String },
}

/// Decode the `[u8 tag][payload]` framing and return the decompressed
/// ATN-encoded server message bytes.
pub fn decompress_frame(frame: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let (&tag, payload) = frame.split_first().ok_or(CompressionError::InsufficientData)?;
    match CompressionTag::from_u8(tag)? {
        CompressionTag::None => Ok(payload.to_vec()),
        CompressionTag::Brotli => decompress_brotli(payload),
        CompressionTag::Zlib => decompress_zlib(payload),
    }
}

pub fn decompress_brotli(payload: &[u8]) -> Result<Vec<u8>, CompressionError> {
    decompress_with(payload, "brotli", |input| {
        brotli::Decompressor::new(Cursor::new(input), 4096)
    })
}

pub fn decompress_zlib(payload: &[u8]) -> Result<Vec<u8>, CompressionError> {
    decompress_with(payload, "zlib", |input| {
        flate2::read::ZlibDecoder::new(Cursor::new(input))
    })
}

/// The per-query-delta compression variants use gzip framing rather than
/// raw zlib, matching `CompressableQueryUpdate`'s wire tags (§4.B/§9).
pub fn decompress_gzip(payload: &[u8]) -> Result<Vec<u8>, CompressionError> {
    decompress_with(payload, "gzip", |input| flate2::read::GzDecoder::new(Cursor::new(input)))
}

/// Grow an output buffer heuristically to 4x the compressed length; if the
/// decoder returns 0 bytes or fills the buffer exactly, retry once with 64x
/// the compressed length; if that also fails, report failure with the
/// algorithm name.
fn decompress_with<R: Read>(
    payload: &[u8],
    algorithm: &'static str,
    make_reader: impl Fn(&[u8]) -> R,
) -> Result<Vec<u8>, CompressionError> {
    if payload.is_empty() {
        // An empty compressed payload still has to go through the decoder
        // in case the algorithm defines a non-empty encoding of "nothing";
        // in practice all three algorithms here round-trip empty to empty.
        return Ok(Vec::new());
    }
    let mut cap = (payload.len() * 4).max(64);
    let mut last_err: Option<io::Error> = None;
    for _ in 0..2 {
        match read_into_capped_buffer(make_reader(payload), cap) {
            Ok(Some(out)) => return Ok(out),
            Ok(None) => {}
            Err(e) => last_err = Some(e),
        }
        cap *= 16; // 4x -> 64x across the two attempts
    }
    Err(CompressionError::DecompressionFailed {
        algorithm,
        cause: last_err.map(|e| e.to_string()).unwrap_or_else(|| "output did not fit".to_string()),
    })
}

/// Read from `reader` into a buffer of exactly `cap` bytes. Returns
/// `Ok(Some(data))` on a strict, non-degenerate result; `Ok(None)` if the
/// read produced 0 bytes or exactly filled the buffer (either of which
/// signals "try again with more room" per the retry algorithm).
fn read_into_capped_buffer<R: Read>(mut reader: R, cap: usize) -> io::Result<Option<Vec<u8>>> {
    let mut buf = vec![0u8; cap];
    let mut total = 0usize;
    while total < buf.len() {
        match reader.read(&mut buf[total..])? {
            0 => break,
            n => total += n,
        }
    }
    if total == 0 || total == buf.len() {
        Ok(None)
    } else {
        buf.truncate(total);
        Ok(Some(buf))
    }
}
