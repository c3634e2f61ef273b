//! Incremental WebM demuxer yielding Opus packets.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;
use tracing::{debug, trace};

use crate::ebml::{self, ElementHeader};
use crate::{OpusHead, WebmError};

/// Default upper bound for a single buffered element body.
pub const DEFAULT_MAX_ELEMENT_SIZE: usize = 8 * 1024 * 1024;

const OPUS_CODEC_ID: &str = "A_OPUS";
const LACING_MASK: u8 = 0x06;

#[derive(Debug, Default)]
struct PendingTrack {
    number: Option<u64>,
    codec: Option<String>,
    private: Option<Bytes>,
}

/// Demuxes a WebM byte stream into the payloads of the first Opus track.
///
/// Container elements (Segment, Tracks, TrackEntry, Cluster, BlockGroup) are
/// descended into; elements the demuxer does not care about are skipped
/// without being buffered. Block payloads from other tracks are discarded.
#[derive(Debug)]
pub struct WebmDemuxer {
    header_seen: bool,
    skip: u64,
    max_element_size: usize,
    pending: PendingTrack,
    track: Option<u64>,
    head: Option<OpusHead>,
    frames: u64,
}

impl Default for WebmDemuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl WebmDemuxer {
    pub fn new() -> Self {
        Self::with_max_element_size(DEFAULT_MAX_ELEMENT_SIZE)
    }

    pub fn with_max_element_size(max_element_size: usize) -> Self {
        Self {
            header_seen: false,
            skip: 0,
            max_element_size,
            pending: PendingTrack::default(),
            track: None,
            head: None,
            frames: 0,
        }
    }

    /// The Opus identification header, once the track has been found.
    pub fn opus_head(&self) -> Option<&OpusHead> {
        self.head.as_ref()
    }

    /// Track number of the selected Opus track.
    pub fn track_number(&self) -> Option<u64> {
        self.track
    }

    /// Number of packets produced so far.
    pub fn frames_emitted(&self) -> u64 {
        self.frames
    }

    fn finish_track_entry(&mut self) -> Result<(), WebmError> {
        let pending = std::mem::take(&mut self.pending);
        if self.track.is_some() {
            return Ok(());
        }
        let (Some(number), Some(codec)) = (pending.number, pending.codec) else {
            return Ok(());
        };
        if codec != OPUS_CODEC_ID {
            trace!(track = number, codec = %codec, "ignoring non-Opus track");
            return Ok(());
        }

        if let Some(private) = pending.private {
            let head = OpusHead::parse(private)?;
            debug!(
                track = number,
                channels = head.channels,
                pre_skip = head.pre_skip,
                "selected Opus track"
            );
            self.head = Some(head);
        } else {
            debug!(track = number, "selected Opus track without OpusHead");
        }
        self.track = Some(number);
        Ok(())
    }

    fn check_doc_type(&self, mut body: &[u8]) -> Result<(), WebmError> {
        while let Some(header) = ebml::read_element_header(body)? {
            let Some(size) = header.size else {
                return Err(WebmError::UnknownSize { id: header.id });
            };
            let end = header.header_len + size as usize;
            if body.len() < end {
                break;
            }
            if header.id == ebml::DOC_TYPE {
                let doc_type = String::from_utf8_lossy(&body[header.header_len..end]);
                let doc_type = doc_type.trim_end_matches('\0');
                if doc_type != "webm" && doc_type != "matroska" {
                    return Err(WebmError::UnsupportedDocType(doc_type.to_string()));
                }
            }
            body = &body[end..];
        }
        Ok(())
    }

    fn read_block(&mut self, body: Bytes) -> Result<Option<Bytes>, WebmError> {
        let Some((Some(track), len)) = ebml::read_size(&body)? else {
            return Err(WebmError::MalformedBlock("missing track number"));
        };
        if Some(track) != self.track {
            return Ok(None);
        }
        // track number, 16-bit relative timecode, flags
        if body.len() < len + 3 {
            return Err(WebmError::MalformedBlock("block header truncated"));
        }
        if body[len + 2] & LACING_MASK != 0 {
            return Err(WebmError::UnsupportedLacing);
        }

        let payload = body.slice(len + 3..);
        if payload.is_empty() {
            return Ok(None);
        }
        self.frames += 1;
        Ok(Some(payload))
    }

    fn enter_container(&mut self, header: &ElementHeader) -> Result<(), WebmError> {
        match header.id {
            ebml::TRACK_ENTRY => self.finish_track_entry()?,
            ebml::CLUSTER => {
                self.finish_track_entry()?;
                if self.track.is_none() {
                    return Err(WebmError::NoOpusTrack);
                }
            }
            _ => {}
        }
        Ok(())
    }
}

fn needs_body(id: u32) -> bool {
    matches!(
        id,
        ebml::EBML_HEADER
            | ebml::TRACK_NUMBER
            | ebml::CODEC_ID
            | ebml::CODEC_PRIVATE
            | ebml::SIMPLE_BLOCK
            | ebml::BLOCK
    )
}

impl Decoder for WebmDemuxer {
    type Item = Bytes;
    type Error = WebmError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if self.skip > 0 {
                let n = self.skip.min(src.len() as u64) as usize;
                src.advance(n);
                self.skip -= n as u64;
                if self.skip > 0 {
                    return Ok(None);
                }
            }

            let Some(header) = ebml::read_element_header(src)? else {
                return Ok(None);
            };

            if !self.header_seen && header.id != ebml::EBML_HEADER {
                return Err(WebmError::InvalidHeader { found: header.id });
            }

            if ebml::is_container(header.id) {
                self.enter_container(&header)?;
                src.advance(header.header_len);
                continue;
            }

            let Some(size) = header.size else {
                return Err(WebmError::UnknownSize { id: header.id });
            };

            if !needs_body(header.id) {
                src.advance(header.header_len);
                self.skip = size;
                continue;
            }

            if size > self.max_element_size as u64 {
                return Err(WebmError::ElementTooLarge {
                    id: header.id,
                    size,
                    limit: self.max_element_size,
                });
            }

            let total = header.header_len + size as usize;
            if src.len() < total {
                src.reserve(total - src.len());
                return Ok(None);
            }

            src.advance(header.header_len);
            let body = src.split_to(size as usize).freeze();

            match header.id {
                ebml::EBML_HEADER => {
                    self.check_doc_type(&body)?;
                    self.header_seen = true;
                }
                ebml::TRACK_NUMBER => self.pending.number = Some(ebml::read_uint(&body)),
                ebml::CODEC_ID => {
                    let codec = String::from_utf8_lossy(&body);
                    self.pending.codec = Some(codec.trim_end_matches('\0').to_string());
                }
                ebml::CODEC_PRIVATE => self.pending.private = Some(body),
                _ => {
                    if let Some(frame) = self.read_block(body)? {
                        return Ok(Some(frame));
                    }
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if !src.is_empty() {
            return Err(WebmError::Truncated {
                remaining: src.len(),
            });
        }
        if self.skip > 0 {
            debug!(skipped = self.skip, "stream ended inside a skipped element");
            self.skip = 0;
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode;
    use bytes::BufMut;
    use futures::StreamExt;
    use tokio_util::codec::FramedRead;

    fn drain(demuxer: &mut WebmDemuxer, data: &[u8], chunk: usize) -> Result<Vec<Bytes>, WebmError> {
        let mut buf = BytesMut::new();
        let mut frames = Vec::new();
        for piece in data.chunks(chunk) {
            buf.extend_from_slice(piece);
            while let Some(frame) = demuxer.decode(&mut buf)? {
                frames.push(frame);
            }
        }
        while let Some(frame) = demuxer.decode_eof(&mut buf)? {
            frames.push(frame);
        }
        Ok(frames)
    }

    #[test]
    fn test_extracts_frames_in_order() {
        let stream = encode::opus_stream(&[b"one", b"two", b"three"]);
        let mut demuxer = WebmDemuxer::new();
        let frames = drain(&mut demuxer, &stream, stream.len()).unwrap();

        assert_eq!(frames, vec![
            Bytes::from_static(b"one"),
            Bytes::from_static(b"two"),
            Bytes::from_static(b"three"),
        ]);
        assert_eq!(demuxer.track_number(), Some(1));
        assert_eq!(demuxer.frames_emitted(), 3);
        assert_eq!(demuxer.opus_head().map(|h| h.channels), Some(2));
    }

    #[test]
    fn test_survives_arbitrary_chunk_boundaries() {
        let stream = encode::opus_stream(&[b"alpha", b"beta", b"gamma", b"delta"]);
        for chunk in [1, 2, 3, 7, 13] {
            let mut demuxer = WebmDemuxer::new();
            let frames = drain(&mut demuxer, &stream, chunk).unwrap();
            assert_eq!(frames.len(), 4, "chunk size {chunk}");
            assert_eq!(&frames[3][..], b"delta");
        }
    }

    #[test]
    fn test_ignores_other_tracks_and_reads_block_groups() {
        let head = encode::opus_head_bytes(2, 0, 48000);
        let mut data = BytesMut::new();
        data.put(encode::ebml_header("webm"));
        data.put(encode::segment_start());
        data.put(encode::tracks(&[
            encode::track_entry(1, "V_VP9", None),
            encode::track_entry(2, "A_OPUS", Some(&head)),
        ]));
        data.put(encode::element(0xEC, &[0u8; 16])); // Void
        data.put(encode::cluster(
            0,
            &[
                encode::simple_block(1, 0, b"video"),
                encode::simple_block(2, 0, b"audio-1"),
                encode::block_group(2, 20, b"audio-2"),
            ],
        ));

        let mut demuxer = WebmDemuxer::new();
        let frames = drain(&mut demuxer, &data, 5).unwrap();
        assert_eq!(frames, vec![
            Bytes::from_static(b"audio-1"),
            Bytes::from_static(b"audio-2"),
        ]);
        assert_eq!(demuxer.track_number(), Some(2));
    }

    #[test]
    fn test_rejects_non_ebml_input() {
        let mut demuxer = WebmDemuxer::new();
        let err = drain(&mut demuxer, &encode::element(0xA3, b"xx"), 64).unwrap_err();
        assert!(matches!(err, WebmError::InvalidHeader { found: 0xA3 }));
    }

    #[test]
    fn test_rejects_unsupported_doc_type() {
        let mut demuxer = WebmDemuxer::new();
        let err = drain(&mut demuxer, &encode::ebml_header("mp4"), 64).unwrap_err();
        assert!(matches!(err, WebmError::UnsupportedDocType(ref t) if t == "mp4"));
    }

    #[test]
    fn test_cluster_without_opus_track_fails() {
        let mut data = BytesMut::new();
        data.put(encode::ebml_header("webm"));
        data.put(encode::segment_start());
        data.put(encode::tracks(&[encode::track_entry(1, "A_VORBIS", None)]));
        data.put(encode::cluster(0, &[encode::simple_block(1, 0, b"x")]));

        let mut demuxer = WebmDemuxer::new();
        let err = drain(&mut demuxer, &data, 64).unwrap_err();
        assert!(matches!(err, WebmError::NoOpusTrack));
    }

    #[test]
    fn test_rejects_laced_blocks() {
        let mut data = BytesMut::new();
        data.put(encode::ebml_header("webm"));
        data.put(encode::segment_start());
        data.put(encode::tracks(&[encode::track_entry(1, "A_OPUS", None)]));
        // track 1, timecode 0, flags: keyframe + Xiph lacing
        data.put(encode::cluster(
            0,
            &[encode::element(ebml::SIMPLE_BLOCK, &[0x81, 0, 0, 0x82, 1, 2])],
        ));

        let mut demuxer = WebmDemuxer::new();
        let err = drain(&mut demuxer, &data, 64).unwrap_err();
        assert!(matches!(err, WebmError::UnsupportedLacing));
    }

    #[test]
    fn test_rejects_oversized_elements() {
        let stream = encode::opus_stream(&[&[7u8; 64]]);
        let mut demuxer = WebmDemuxer::with_max_element_size(32);
        let err = drain(&mut demuxer, &stream, 16).unwrap_err();
        assert!(matches!(err, WebmError::ElementTooLarge { .. }));
    }

    #[test]
    fn test_truncated_block_is_an_error() {
        let stream = encode::opus_stream(&[b"complete", b"cut-short"]);
        let cut = &stream[..stream.len() - 3];
        let mut demuxer = WebmDemuxer::new();
        let err = drain(&mut demuxer, cut, 8).unwrap_err();
        assert!(matches!(err, WebmError::Truncated { .. }));
    }

    #[tokio::test]
    async fn test_framed_read_over_async_reader() {
        let stream = encode::opus_stream(&[b"a", b"b"]);
        let reader: &[u8] = &stream;
        let frames: Vec<Bytes> = FramedRead::new(reader, WebmDemuxer::new())
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(frames.len(), 2);
    }
}
