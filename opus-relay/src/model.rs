//! Content metadata as produced by a [`Resolver`](crate::resolver::Resolver).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::ResolveError;

/// One encoding of a piece of content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateFormat {
    /// Resolver-specific format identifier (itag, yt-dlp format id, ...).
    #[serde(default)]
    pub format_id: String,
    /// Audio codec, e.g. "opus", "mp4a.40.2".
    pub codec: String,
    /// Container, e.g. "webm", "m4a".
    pub container: String,
    /// Audio sample rate in Hz.
    #[serde(default)]
    pub audio_sample_rate: Option<u32>,
    /// Audio bitrate in kbps. Formats without one carry no usable audio.
    #[serde(default)]
    pub audio_bitrate: Option<u32>,
    /// Overall bitrate in kbps.
    #[serde(default)]
    pub bitrate: Option<u32>,
    /// Whether the format carries audio only (no muxed video).
    #[serde(default)]
    pub audio_only: bool,
    /// Delivered over a segmented (HLS) transport.
    #[serde(default)]
    pub is_hls: bool,
    /// Locator of the encoded bytes.
    pub url: String,
    /// Headers the origin expects when fetching `url`.
    #[serde(default)]
    pub http_headers: BTreeMap<String, String>,
}

impl CandidateFormat {
    pub fn has_audio(&self) -> bool {
        self.audio_bitrate.is_some()
    }
}

impl fmt::Display for CandidateFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}/{}", self.format_id, self.codec, self.container)?;
        if let Some(rate) = self.audio_sample_rate {
            write!(f, " {rate}Hz")?;
        }
        if let Some(abr) = self.audio_bitrate {
            write!(f, " {abr}kbps")?;
        }
        if !self.audio_only {
            write!(f, " +video")?;
        }
        write!(f, "]")
    }
}

/// Metadata and available formats for one piece of content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentDescriptor {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    /// Length in seconds; zero for live or indeterminate-length content.
    #[serde(default)]
    pub duration_secs: u64,
    #[serde(default)]
    pub is_live: bool,
    #[serde(default)]
    pub formats: Vec<CandidateFormat>,
}

impl ContentDescriptor {
    /// Zero duration marks live or indeterminate-length content.
    pub fn has_known_length(&self) -> bool {
        self.duration_secs != 0
    }

    /// Reject descriptors the relays could not act on.
    pub fn validate(&self) -> Result<(), ResolveError> {
        if let Some(format) = self.formats.iter().find(|f| f.url.trim().is_empty()) {
            return Err(ResolveError::InvalidDescriptor(format!(
                "format `{}` has no URL",
                format.format_id
            )));
        }
        Ok(())
    }
}
