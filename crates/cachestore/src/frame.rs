//! Record framing for stored values
//!
//! Every stored record starts with a 4-byte magic naming its form, so the
//! payload itself may hold any bytes:
//! ```text
//! plain:       TCP1 ...payload...
//! compressed:  TCZ1
//!              [4 bytes: uncompressed length u32 little-endian]
//!              ...deflate stream...
//! ```
//! Anything else is not a record written by this crate and reads as corrupt.

use std::borrow::Cow;
use std::io::{Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use nom::{bytes::complete::tag, number::complete::le_u32, IResult};

use crate::error::{Error, Result};

/// Magic header for compressed records
pub const FRAME_MAGIC: &[u8] = b"TCZ1";

/// Magic header for uncompressed records
pub const PLAIN_MAGIC: &[u8] = b"TCP1";

/// Size of the compressed-record header in bytes
pub const FRAME_HEADER_LEN: usize = FRAME_MAGIC.len() + 4;

/// Compressed-record header
#[derive(Debug, Clone, PartialEq)]
pub struct FrameHeader {
    /// Length of the payload once inflated
    pub raw_len: u32,
}

/// Parse the compressed-record header, returning the deflate body
pub fn parse_header(input: &[u8]) -> IResult<&[u8], FrameHeader> {
    let (rest, _) = tag(FRAME_MAGIC)(input)?;
    let (rest, raw_len) = le_u32(rest)?;
    Ok((rest, FrameHeader { raw_len }))
}

/// Create a compressed-record header
pub fn create_header(raw_len: u32) -> Vec<u8> {
    let mut header = Vec::with_capacity(FRAME_HEADER_LEN);
    header.extend_from_slice(FRAME_MAGIC);
    header.extend_from_slice(&raw_len.to_le_bytes());
    header
}

/// Whether a stored record uses the compressed form
pub fn is_compressed(record: &[u8]) -> bool {
    record.starts_with(FRAME_MAGIC)
}

/// Frame a payload as a plain (uncompressed) record
pub fn wrap_plain(plain: &[u8]) -> Vec<u8> {
    let mut record = Vec::with_capacity(PLAIN_MAGIC.len() + plain.len());
    record.extend_from_slice(PLAIN_MAGIC);
    record.extend_from_slice(plain);
    record
}

fn parse_plain(input: &[u8]) -> IResult<&[u8], &[u8]> {
    tag(PLAIN_MAGIC)(input)
}

/// Deflate a plain record into the compressed form
pub fn compress(plain: &[u8]) -> Result<Vec<u8>> {
    let raw_len = u32::try_from(plain.len()).map_err(|_| Error::ValueTooLarge {
        size: plain.len(),
        max: u32::MAX as usize,
    })?;

    let mut encoder = DeflateEncoder::new(create_header(raw_len), Compression::default());
    encoder.write_all(plain)?;
    Ok(encoder.finish()?)
}

/// Return the payload of a stored record, inflating if needed
pub fn unframe(record: &[u8]) -> Result<Cow<'_, [u8]>> {
    if let Ok((payload, _)) = parse_plain(record) {
        return Ok(Cow::Borrowed(payload));
    }
    if !is_compressed(record) {
        return Err(Error::Corrupt("unknown record header".into()));
    }

    let (body, header) = parse_header(record)?;
    let expected = header.raw_len as usize;

    let mut plain = Vec::new();
    DeflateDecoder::new(body)
        .take(expected as u64 + 1)
        .read_to_end(&mut plain)
        .map_err(|e| Error::Corrupt(format!("inflate failed: {}", e)))?;

    if plain.len() != expected {
        return Err(Error::Corrupt(format!(
            "length mismatch: header says {} bytes, got {}",
            expected,
            plain.len()
        )));
    }

    Ok(Cow::Owned(plain))
}
