//! Minimal EBML element encoding.
//!
//! Enough of a writer to build well-formed WebM audio streams, used for
//! fixtures and by callers that need to rewrap Opus packets.

use bytes::{BufMut, Bytes, BytesMut};

use crate::ebml;

const UNKNOWN_SIZE: [u8; 8] = [0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF];

pub fn write_id(out: &mut BytesMut, id: u32) {
    let bytes = id.to_be_bytes();
    let skip = match id {
        0..=0xFF => 3,
        0x100..=0xFFFF => 2,
        0x1_0000..=0xFF_FFFF => 1,
        _ => 0,
    };
    out.put_slice(&bytes[skip..]);
}

/// Write `size` using the shortest vint that does not collide with the
/// reserved unknown-size value.
pub fn write_size(out: &mut BytesMut, size: u64) {
    let len = (1..=ebml::MAX_SIZE_LEN)
        .find(|&len| size < (1u64 << (7 * len)) - 1)
        .unwrap_or(ebml::MAX_SIZE_LEN);
    let marked = size | (1u64 << (7 * len));
    out.put_slice(&marked.to_be_bytes()[8 - len..]);
}

pub fn write_unknown_size(out: &mut BytesMut) {
    out.put_slice(&UNKNOWN_SIZE);
}

/// Encode a complete element with a known size.
pub fn element(id: u32, body: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(body.len() + 12);
    write_id(&mut out, id);
    write_size(&mut out, body.len() as u64);
    out.put_slice(body);
    out.freeze()
}

pub fn uint_element(id: u32, value: u64) -> Bytes {
    let bytes = value.to_be_bytes();
    let skip = (value.leading_zeros() / 8).min(7) as usize;
    element(id, &bytes[skip..])
}

pub fn ebml_header(doc_type: &str) -> Bytes {
    element(ebml::EBML_HEADER, &element(ebml::DOC_TYPE, doc_type.as_bytes()))
}

/// Start of a live-style segment whose size is not known up front.
pub fn segment_start() -> Bytes {
    let mut out = BytesMut::with_capacity(12);
    write_id(&mut out, ebml::SEGMENT);
    write_unknown_size(&mut out);
    out.freeze()
}

pub fn track_entry(number: u64, codec_id: &str, codec_private: Option<&[u8]>) -> Bytes {
    let mut body = BytesMut::new();
    body.put(uint_element(ebml::TRACK_NUMBER, number));
    body.put(element(ebml::CODEC_ID, codec_id.as_bytes()));
    if let Some(private) = codec_private {
        body.put(element(ebml::CODEC_PRIVATE, private));
    }
    element(ebml::TRACK_ENTRY, &body)
}

pub fn tracks(entries: &[Bytes]) -> Bytes {
    element(ebml::TRACKS, &entries.concat())
}

fn block_body(track: u64, timecode: i16, flags: u8, payload: &[u8]) -> BytesMut {
    let mut body = BytesMut::with_capacity(payload.len() + 4);
    write_size(&mut body, track);
    body.put_i16(timecode);
    body.put_u8(flags);
    body.put_slice(payload);
    body
}

pub fn simple_block(track: u64, timecode: i16, payload: &[u8]) -> Bytes {
    element(ebml::SIMPLE_BLOCK, &block_body(track, timecode, 0x80, payload))
}

pub fn block_group(track: u64, timecode: i16, payload: &[u8]) -> Bytes {
    let block = element(ebml::BLOCK, &block_body(track, timecode, 0x00, payload));
    element(ebml::BLOCK_GROUP, &block)
}

pub fn cluster(timecode: u64, blocks: &[Bytes]) -> Bytes {
    let mut body = BytesMut::new();
    body.put(uint_element(ebml::TIMECODE, timecode));
    for block in blocks {
        body.put_slice(block);
    }
    element(ebml::CLUSTER, &body)
}

/// Build an `OpusHead` identification header (mapping family 0).
pub fn opus_head_bytes(channels: u8, pre_skip: u16, input_sample_rate: u32) -> Bytes {
    let mut out = BytesMut::with_capacity(19);
    out.put_slice(b"OpusHead");
    out.put_u8(1);
    out.put_u8(channels);
    out.put_u16_le(pre_skip);
    out.put_u32_le(input_sample_rate);
    out.put_i16_le(0);
    out.put_u8(0);
    out.freeze()
}

/// Convenience: a complete single-track Opus WebM stream carrying `packets`
/// in one cluster.
pub fn opus_stream(packets: &[&[u8]]) -> Bytes {
    let head = opus_head_bytes(2, 312, 48000);
    let blocks: Vec<Bytes> = packets
        .iter()
        .enumerate()
        .map(|(i, p)| simple_block(1, (i as i16) * 20, p))
        .collect();

    let mut out = BytesMut::new();
    out.put(ebml_header("webm"));
    out.put(segment_start());
    out.put(tracks(&[track_entry(1, "A_OPUS", Some(&head))]));
    out.put(cluster(0, &blocks));
    out.freeze()
}
