//! Streaming WebM demuxer.
//!
//! This crate extracts raw Opus packets from a WebM (Matroska subset) byte
//! stream without buffering whole clusters. The [`WebmDemuxer`] implements
//! [`tokio_util::codec::Decoder`], so it can sit behind a `FramedRead` on any
//! `AsyncRead` (an HTTP body, a child process stdout, a file).
//!
//! Only the elements needed to locate the Opus track and its blocks are
//! parsed; everything else is skipped in place.

pub mod demuxer;
pub mod ebml;
pub mod encode;
pub mod error;
pub mod opus_head;

pub use demuxer::WebmDemuxer;
pub use error::WebmError;
pub use opus_head::OpusHead;

/// Result type for WebM parsing operations
pub type Result<T> = std::result::Result<T, WebmError>;
