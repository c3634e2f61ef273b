use bytes::Bytes;

use crate::WebmError;

const MAGIC: &[u8; 8] = b"OpusHead";
const MIN_LEN: usize = 19;

/// Opus identification header carried in the track's CodecPrivate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpusHead {
    pub version: u8,
    pub channels: u8,
    pub pre_skip: u16,
    pub input_sample_rate: u32,
    pub output_gain: i16,
    pub mapping_family: u8,
    /// The raw header, as found in the container.
    pub raw: Bytes,
}

impl OpusHead {
    pub fn parse(raw: Bytes) -> Result<Self, WebmError> {
        if raw.len() < MIN_LEN {
            return Err(WebmError::InvalidOpusHead("header too short"));
        }
        if &raw[..8] != MAGIC {
            return Err(WebmError::InvalidOpusHead("missing OpusHead magic"));
        }
        let channels = raw[9];
        if channels == 0 {
            return Err(WebmError::InvalidOpusHead("zero channels"));
        }

        Ok(Self {
            version: raw[8],
            channels,
            pre_skip: u16::from_le_bytes([raw[10], raw[11]]),
            input_sample_rate: u32::from_le_bytes([raw[12], raw[13], raw[14], raw[15]]),
            output_gain: i16::from_le_bytes([raw[16], raw[17]]),
            mapping_family: raw[18],
            raw,
        })
    }
}
