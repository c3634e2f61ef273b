use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use webm::WebmDemuxer;

use super::{Relay, RelayOutcome, RelayPath, forward_frames};
use crate::error::RelayError;
use crate::model::{CandidateFormat, ContentDescriptor};
use crate::source::ByteSource;
use crate::stream::StreamSink;

/// Passes Opus packets through from a WebM source without re-encoding.
pub struct DemuxRelay {
    source: Arc<dyn ByteSource>,
}

impl DemuxRelay {
    pub fn new(source: Arc<dyn ByteSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl Relay for DemuxRelay {
    fn path(&self) -> RelayPath {
        RelayPath::Remux
    }

    async fn run(
        &self,
        descriptor: &ContentDescriptor,
        format: &CandidateFormat,
        sink: &mut StreamSink,
        token: CancellationToken,
    ) -> Result<RelayOutcome, RelayError> {
        let reader = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(RelayOutcome::Cancelled),
            reader = self.source.open(descriptor, format) => reader?,
        };

        let mut frames = FramedRead::new(reader, WebmDemuxer::new());
        let outcome = forward_frames(&mut frames, sink, &token).await;

        let demuxer = frames.decoder();
        debug!(
            track = ?demuxer.track_number(),
            channels = demuxer.opus_head().map(|h| h.channels),
            frames = demuxer.frames_emitted(),
            "demux finished"
        );
        // Dropping the reader closes the source connection.
        drop(frames);

        if let Ok(RelayOutcome::Completed { frames, bytes }) = &outcome {
            info!(format = %format, frames, bytes, "remux complete");
        }
        outcome
    }
}
