//! Format selection: direct WebM/Opus remux when possible, otherwise the
//! best audio candidate for transcoding.

use tracing::debug;

use crate::error::RelayError;
use crate::model::{CandidateFormat, ContentDescriptor};
use crate::relay::RelayPath;

/// Sample rate a remux candidate must already have.
pub const REMUX_SAMPLE_RATE: u32 = 48_000;

/// Outcome of format selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// The format already carries Opus in WebM and can be demuxed as-is.
    DirectRemux(CandidateFormat),
    /// The format has to be decoded and re-encoded.
    Transcode(CandidateFormat),
}

impl Selection {
    pub fn format(&self) -> &CandidateFormat {
        match self {
            Self::DirectRemux(f) | Self::Transcode(f) => f,
        }
    }

    pub fn into_format(self) -> CandidateFormat {
        match self {
            Self::DirectRemux(f) | Self::Transcode(f) => f,
        }
    }

    pub fn path(&self) -> RelayPath {
        match self {
            Self::DirectRemux(_) => RelayPath::Remux,
            Self::Transcode(_) => RelayPath::Transcode,
        }
    }
}

/// Whether a format is Opus in WebM at 48 kHz.
///
/// Content length is checked separately by [`select`].
pub fn is_opus_webm(format: &CandidateFormat) -> bool {
    format.codec.eq_ignore_ascii_case("opus")
        && format.container.eq_ignore_ascii_case("webm")
        && format.audio_sample_rate == Some(REMUX_SAMPLE_RATE)
}

/// First remux-eligible format, if the content has a known length.
pub fn find_remux_format(descriptor: &ContentDescriptor) -> Option<&CandidateFormat> {
    if !descriptor.has_known_length() {
        return None;
    }
    descriptor.formats.iter().find(|f| is_opus_webm(f))
}

/// Highest audio bitrate format, preferring audio-only ones.
///
/// Formats without an audio bitrate are ignored. For live content only
/// segmented (HLS) formats qualify. The sort is stable, so formats with equal
/// audio bitrate keep their listed order.
pub fn next_best_format(formats: &[CandidateFormat], is_live: bool) -> Option<&CandidateFormat> {
    let mut candidates: Vec<&CandidateFormat> = formats
        .iter()
        .filter(|f| f.has_audio())
        .filter(|f| !is_live || f.is_hls)
        .collect();

    candidates.sort_by(|a, b| b.audio_bitrate.cmp(&a.audio_bitrate));

    candidates
        .iter()
        .find(|f| f.audio_only)
        .or_else(|| candidates.first())
        .copied()
}

/// Choose the relay path and format for a descriptor.
pub fn select(descriptor: &ContentDescriptor) -> Result<Selection, RelayError> {
    if let Some(format) = find_remux_format(descriptor) {
        debug!(format = %format, "selected direct remux");
        return Ok(Selection::DirectRemux(format.clone()));
    }

    match next_best_format(&descriptor.formats, descriptor.is_live) {
        Some(format) => {
            debug!(format = %format, is_live = descriptor.is_live, "selected transcode");
            Ok(Selection::Transcode(format.clone()))
        }
        None => Err(RelayError::NoSuitableFormat),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn format(
        id: &str,
        codec: &str,
        container: &str,
        rate: Option<u32>,
        abr: Option<u32>,
    ) -> CandidateFormat {
        CandidateFormat {
            format_id: id.to_string(),
            codec: codec.to_string(),
            container: container.to_string(),
            audio_sample_rate: rate,
            audio_bitrate: abr,
            bitrate: abr,
            audio_only: true,
            is_hls: false,
            url: format!("https://media.example/{id}"),
            http_headers: BTreeMap::new(),
        }
    }

    fn descriptor(duration_secs: u64, is_live: bool, formats: Vec<CandidateFormat>) -> ContentDescriptor {
        ContentDescriptor {
            id: "content".to_string(),
            title: "Content".to_string(),
            duration_secs,
            is_live,
            formats,
        }
    }

    #[test]
    fn test_remux_for_opus_webm() {
        let d = descriptor(
            212,
            false,
            vec![
                format("140", "mp4a.40.2", "m4a", Some(44100), Some(128)),
                format("251", "opus", "webm", Some(48000), Some(160)),
            ],
        );
        let selection = select(&d).unwrap();
        assert_eq!(selection.path(), RelayPath::Remux);
        assert_eq!(selection.format().format_id, "251");
    }

    #[test]
    fn test_remux_codec_is_case_insensitive() {
        let d = descriptor(
            10,
            false,
            vec![format("251", "OPUS", "webm", Some(48000), Some(160))],
        );
        assert!(matches!(select(&d).unwrap(), Selection::DirectRemux(_)));
    }

    #[test]
    fn test_first_remux_candidate_wins() {
        let d = descriptor(
            10,
            false,
            vec![
                format("250", "opus", "webm", Some(48000), Some(70)),
                format("251", "opus", "webm", Some(48000), Some(160)),
            ],
        );
        assert_eq!(select(&d).unwrap().format().format_id, "250");
    }

    #[test]
    fn test_wrong_sample_rate_is_transcoded() {
        let d = descriptor(
            10,
            false,
            vec![format("251", "opus", "webm", Some(44100), Some(160))],
        );
        let selection = select(&d).unwrap();
        assert_eq!(selection.path(), RelayPath::Transcode);
        assert_eq!(selection.format().format_id, "251");
    }

    #[test]
    fn test_live_never_remuxes() {
        let mut hls = format("91", "mp4a.40.5", "mp4", Some(22050), Some(48));
        hls.is_hls = true;
        let d = descriptor(
            0,
            true,
            vec![format("251", "opus", "webm", Some(48000), Some(160)), hls],
        );
        let selection = select(&d).unwrap();
        assert_eq!(selection.path(), RelayPath::Transcode);
        assert_eq!(selection.format().format_id, "91");
    }

    #[test]
    fn test_live_without_hls_has_no_format() {
        let d = descriptor(
            0,
            true,
            vec![format("251", "opus", "webm", Some(48000), Some(160))],
        );
        assert!(matches!(select(&d), Err(RelayError::NoSuitableFormat)));
    }

    #[test]
    fn test_zero_duration_not_live_transcodes() {
        let d = descriptor(
            0,
            false,
            vec![format("251", "opus", "webm", Some(48000), Some(160))],
        );
        assert_eq!(select(&d).unwrap().path(), RelayPath::Transcode);
    }

    #[test]
    fn test_audio_only_preferred_over_higher_combined() {
        let audio = format("a", "mp4a.40.2", "m4a", Some(44100), Some(128));
        let mut combined = format("av", "avc1+mp4a", "mp4", Some(44100), Some(160));
        combined.bitrate = Some(256);
        combined.audio_only = false;

        let d = descriptor(10, false, vec![combined, audio]);
        assert_eq!(select(&d).unwrap().format().format_id, "a");
    }

    #[test]
    fn test_combined_used_when_no_audio_only() {
        let mut low = format("18", "avc1+mp4a", "mp4", None, Some(96));
        low.audio_only = false;
        let mut high = format("22", "avc1+mp4a", "mp4", None, Some(192));
        high.audio_only = false;

        let d = descriptor(10, false, vec![low, high]);
        assert_eq!(select(&d).unwrap().format().format_id, "22");
    }

    #[test]
    fn test_equal_bitrates_keep_listed_order() {
        let formats = vec![
            format("first", "mp4a.40.2", "m4a", None, Some(128)),
            format("second", "mp4a.40.2", "m4a", None, Some(128)),
        ];
        assert_eq!(
            next_best_format(&formats, false).map(|f| f.format_id.as_str()),
            Some("first")
        );
    }

    #[test]
    fn test_no_audio_bitrate_is_no_suitable_format() {
        let d = descriptor(
            10,
            false,
            vec![format("137", "avc1", "mp4", None, None)],
        );
        assert!(matches!(select(&d), Err(RelayError::NoSuitableFormat)));
    }
}
