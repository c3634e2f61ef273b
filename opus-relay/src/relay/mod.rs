//! Relays turn a selected format into Opus packets on a [`StreamSink`].

mod demux;
mod transcode;

pub use demux::DemuxRelay;
pub use transcode::{TranscodeConfig, TranscodeRelay};

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::RelayError;
use crate::model::{CandidateFormat, ContentDescriptor};
use crate::stream::{StreamSink, WriteStatus};

/// Which relay produced a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayPath {
    Remux,
    Transcode,
}

impl fmt::Display for RelayPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remux => write!(f, "remux"),
            Self::Transcode => write!(f, "transcode"),
        }
    }
}

/// External process stage of the transcode relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Decoder,
    Encoder,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decoder => write!(f, "decoder"),
            Self::Encoder => write!(f, "encoder"),
        }
    }
}

/// How a relay run ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// The source was exhausted and every frame was forwarded.
    Completed { frames: u64, bytes: u64 },
    /// The request was destroyed; the session has been torn down.
    Cancelled,
}

/// A relay session factory.
///
/// `run` owns the whole session: everything it starts is torn down before it
/// returns, whatever the outcome.
#[async_trait]
pub trait Relay: Send + Sync {
    fn path(&self) -> RelayPath;

    async fn run(
        &self,
        descriptor: &ContentDescriptor,
        format: &CandidateFormat,
        sink: &mut StreamSink,
        token: CancellationToken,
    ) -> Result<RelayOutcome, RelayError>;
}

/// Forward frames into the sink until the source ends, fails or the request
/// is cancelled.
pub(crate) async fn forward_frames<S, E>(
    frames: &mut S,
    sink: &mut StreamSink,
    token: &CancellationToken,
) -> Result<RelayOutcome, RelayError>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Into<RelayError>,
{
    let mut frame_count = 0u64;
    let mut byte_count = 0u64;

    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(RelayOutcome::Cancelled),
            next = frames.next() => next,
        };

        match next {
            Some(Ok(frame)) => {
                let len = frame.len() as u64;
                if sink.write(frame).await == WriteStatus::Dropped {
                    debug!(frames = frame_count, "stream destroyed while writing");
                    return Ok(RelayOutcome::Cancelled);
                }
                frame_count += 1;
                byte_count += len;
            }
            Some(Err(e)) => return Err(e.into()),
            None => {
                return Ok(RelayOutcome::Completed {
                    frames: frame_count,
                    bytes: byte_count,
                });
            }
        }
    }
}
