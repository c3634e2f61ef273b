use thiserror::Error;

#[derive(Debug, Error)]
pub enum WebmError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stream does not start with an EBML header (found element 0x{found:X})")]
    InvalidHeader { found: u32 },

    #[error("unsupported document type `{0}`")]
    UnsupportedDocType(String),

    #[error("invalid variable-length integer at leading byte 0x{0:02X}")]
    InvalidVint(u8),

    #[error("element 0x{id:X} has unknown size but is not a container")]
    UnknownSize { id: u32 },

    #[error("element 0x{id:X} of {size} bytes exceeds the {limit} byte limit")]
    ElementTooLarge { id: u32, size: u64, limit: usize },

    #[error("no Opus track found before the first cluster")]
    NoOpusTrack,

    #[error("invalid OpusHead in codec private data: {0}")]
    InvalidOpusHead(&'static str),

    #[error("malformed block: {0}")]
    MalformedBlock(&'static str),

    #[error("laced blocks are not supported")]
    UnsupportedLacing,

    #[error("stream ended inside an element ({remaining} bytes unparsed)")]
    Truncated { remaining: usize },
}
