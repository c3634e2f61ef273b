//! EBML primitives: variable-length integers, element ids and headers.

use crate::WebmError;

pub const EBML_HEADER: u32 = 0x1A45_DFA3;
pub const DOC_TYPE: u32 = 0x4282;
pub const SEGMENT: u32 = 0x1853_8067;
pub const TRACKS: u32 = 0x1654_AE6B;
pub const TRACK_ENTRY: u32 = 0xAE;
pub const TRACK_NUMBER: u32 = 0xD7;
pub const CODEC_ID: u32 = 0x86;
pub const CODEC_PRIVATE: u32 = 0x63A2;
pub const CLUSTER: u32 = 0x1F43_B675;
pub const TIMECODE: u32 = 0xE7;
pub const BLOCK_GROUP: u32 = 0xA0;
pub const BLOCK: u32 = 0xA1;
pub const SIMPLE_BLOCK: u32 = 0xA3;

/// Longest encoding of an element size.
pub const MAX_SIZE_LEN: usize = 8;
/// Longest encoding of an element id.
pub const MAX_ID_LEN: usize = 4;

/// Header of one EBML element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementHeader {
    pub id: u32,
    /// Body size in bytes, `None` for the reserved "unknown size" value.
    pub size: Option<u64>,
    /// Number of bytes taken by the id and size fields.
    pub header_len: usize,
}

/// Length in bytes of a vint whose first byte is `first`.
fn vint_len(first: u8, max: usize) -> Result<usize, WebmError> {
    let len = first.leading_zeros() as usize + 1;
    if len > max {
        return Err(WebmError::InvalidVint(first));
    }
    Ok(len)
}

/// Read an element id (marker bit kept). Returns `None` if `buf` is too short.
pub fn read_id(buf: &[u8]) -> Result<Option<(u32, usize)>, WebmError> {
    let Some(&first) = buf.first() else {
        return Ok(None);
    };
    let len = vint_len(first, MAX_ID_LEN)?;
    if buf.len() < len {
        return Ok(None);
    }
    let id = buf[..len]
        .iter()
        .fold(0u32, |acc, &b| (acc << 8) | u32::from(b));
    Ok(Some((id, len)))
}

/// Read a data-size vint (marker bit stripped).
///
/// The all-ones value is reported as `Some((None, len))`.
pub fn read_size(buf: &[u8]) -> Result<Option<(Option<u64>, usize)>, WebmError> {
    let Some(&first) = buf.first() else {
        return Ok(None);
    };
    let len = vint_len(first, MAX_SIZE_LEN)?;
    if buf.len() < len {
        return Ok(None);
    }
    let value = read_vint_value(&buf[..len]);
    let unknown = (1u64 << (7 * len)) - 1;
    Ok(Some(((value != unknown).then_some(value), len)))
}

/// Decode a complete vint slice, stripping the length marker.
pub fn read_vint_value(bytes: &[u8]) -> u64 {
    let len = bytes.len();
    let mask = if len >= 8 { 0 } else { 0xFFu8 >> len };
    bytes[1..]
        .iter()
        .fold(u64::from(bytes[0] & mask), |acc, &b| (acc << 8) | u64::from(b))
}

/// Parse an element header from the start of `buf`.
pub fn read_element_header(buf: &[u8]) -> Result<Option<ElementHeader>, WebmError> {
    let Some((id, id_len)) = read_id(buf)? else {
        return Ok(None);
    };
    let Some((size, size_len)) = read_size(&buf[id_len..])? else {
        return Ok(None);
    };
    Ok(Some(ElementHeader {
        id,
        size,
        header_len: id_len + size_len,
    }))
}

/// Read a big-endian unsigned integer element body.
pub fn read_uint(body: &[u8]) -> u64 {
    body.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}

/// Whether the demuxer descends into this element instead of skipping it.
pub fn is_container(id: u32) -> bool {
    matches!(id, SEGMENT | TRACKS | TRACK_ENTRY | CLUSTER | BLOCK_GROUP)
}
