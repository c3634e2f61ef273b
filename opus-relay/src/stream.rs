//! Backpressured output stream between a relay and the caller.
//!
//! The producer half ([`StreamSink`]) waits for byte budget before queueing a
//! chunk; the budget is returned when the consumer ([`AudioStream`]) takes the
//! chunk off the queue. Destroying the stream cancels the request token, turns
//! every later write into a no-op and hides anything still queued.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use futures::Stream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::RelayError;
use crate::model::{CandidateFormat, ContentDescriptor};
use crate::relay::RelayPath;

/// Default byte budget of an output stream (512 KiB).
pub const DEFAULT_HIGH_WATER_MARK: usize = 512 * 1024;

/// What the caller is told before the first frame.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub descriptor: Arc<ContentDescriptor>,
    pub format: CandidateFormat,
    pub path: RelayPath,
}

/// Event observed by the consumer.
#[derive(Debug)]
pub enum StreamEvent {
    /// Emitted exactly once, before any data.
    Info(StreamInfo),
    /// One Opus packet.
    Data(Bytes),
    /// Terminal failure.
    Error(RelayError),
    /// Terminal end of stream.
    End,
}

/// Result of a [`StreamSink::write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Accepted,
    /// The stream was destroyed; the chunk was discarded.
    Dropped,
}

#[derive(Debug)]
enum Message {
    Info(StreamInfo),
    Data {
        bytes: Bytes,
        // Released when the consumer takes the chunk.
        permit: OwnedSemaphorePermit,
    },
    Error(RelayError),
    End,
}

/// Shared cancellation handle of one download request.
#[derive(Debug, Clone, Default)]
pub struct StreamHandle {
    token: CancellationToken,
}

impl StreamHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the stream destroyed and cancel the request. Idempotent.
    pub fn destroy(&self) {
        if !self.token.is_cancelled() {
            debug!("output stream destroyed");
            self.token.cancel();
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The request's cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// Create a connected sink/stream pair with a byte budget of `high_water_mark`.
pub fn channel(high_water_mark: usize) -> (StreamSink, AudioStream) {
    channel_with_handle(high_water_mark, StreamHandle::new())
}

pub(crate) fn channel_with_handle(
    high_water_mark: usize,
    handle: StreamHandle,
) -> (StreamSink, AudioStream) {
    let capacity = high_water_mark.clamp(1, u32::MAX as usize);
    let budget = Arc::new(Semaphore::new(capacity));
    let (tx, rx) = mpsc::unbounded_channel();

    let sink = StreamSink {
        tx,
        budget: budget.clone(),
        capacity,
        handle: handle.clone(),
        info_sent: false,
    };
    let stream = AudioStream {
        rx,
        budget,
        handle,
        info: None,
        finished: false,
    };
    (sink, stream)
}

/// Producer half, owned by the relay session.
#[derive(Debug)]
pub struct StreamSink {
    tx: mpsc::UnboundedSender<Message>,
    budget: Arc<Semaphore>,
    capacity: usize,
    handle: StreamHandle,
    info_sent: bool,
}

impl StreamSink {
    pub fn handle(&self) -> &StreamHandle {
        &self.handle
    }

    pub fn is_destroyed(&self) -> bool {
        self.handle.is_destroyed()
    }

    /// Send the one-time info event. Later calls are ignored.
    pub fn emit_info(&mut self, info: StreamInfo) {
        if self.info_sent || self.is_destroyed() {
            return;
        }
        self.info_sent = true;
        let _ = self.tx.send(Message::Info(info));
    }

    /// Queue a chunk, waiting while the consumer is more than the byte budget
    /// behind.
    ///
    /// A chunk larger than the whole budget waits for the queue to drain
    /// completely and is then accepted on its own.
    pub async fn write(&mut self, bytes: Bytes) -> WriteStatus {
        if self.is_destroyed() {
            return WriteStatus::Dropped;
        }
        if bytes.is_empty() {
            return WriteStatus::Accepted;
        }

        let needed = bytes.len().min(self.capacity) as u32;
        let token = self.handle.token.clone();
        let permit = tokio::select! {
            biased;
            _ = token.cancelled() => return WriteStatus::Dropped,
            permit = self.budget.clone().acquire_many_owned(needed) => match permit {
                Ok(permit) => permit,
                // Closed when the consumer went away.
                Err(_) => return WriteStatus::Dropped,
            },
        };

        if self.is_destroyed() {
            return WriteStatus::Dropped;
        }
        match self.tx.send(Message::Data { bytes, permit }) {
            Ok(()) => WriteStatus::Accepted,
            Err(_) => WriteStatus::Dropped,
        }
    }

    /// End the stream normally.
    pub fn finish(self) {
        if !self.is_destroyed() {
            let _ = self.tx.send(Message::End);
        }
    }

    /// End the stream with an error.
    pub fn fail(self, error: RelayError) {
        if !self.is_destroyed() {
            let _ = self.tx.send(Message::Error(error));
        }
    }
}

/// Consumer half handed to the caller.
///
/// Dropping it destroys the request.
#[derive(Debug)]
pub struct AudioStream {
    rx: mpsc::UnboundedReceiver<Message>,
    budget: Arc<Semaphore>,
    handle: StreamHandle,
    info: Option<StreamInfo>,
    finished: bool,
}

impl AudioStream {
    /// Info of the request, once the info event has been received.
    pub fn info(&self) -> Option<&StreamInfo> {
        self.info.as_ref()
    }

    pub fn handle(&self) -> StreamHandle {
        self.handle.clone()
    }

    pub fn destroy(&self) {
        self.handle.destroy();
    }

    pub fn is_destroyed(&self) -> bool {
        self.handle.is_destroyed()
    }

    pub fn poll_event(&mut self, cx: &mut Context<'_>) -> Poll<Option<StreamEvent>> {
        if self.finished || self.handle.is_destroyed() {
            return Poll::Ready(None);
        }

        let event = match ready!(self.rx.poll_recv(cx)) {
            Some(Message::Info(info)) => {
                self.info = Some(info.clone());
                StreamEvent::Info(info)
            }
            Some(Message::Data { bytes, permit }) => {
                drop(permit);
                StreamEvent::Data(bytes)
            }
            Some(Message::Error(error)) => {
                self.finished = true;
                StreamEvent::Error(error)
            }
            Some(Message::End) => {
                self.finished = true;
                StreamEvent::End
            }
            None => {
                self.finished = true;
                return Poll::Ready(None);
            }
        };
        Poll::Ready(Some(event))
    }

    /// Next event, or `None` once the stream is finished or destroyed.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        std::future::poll_fn(|cx| self.poll_event(cx)).await
    }

    /// Next Opus packet, skipping the info event.
    ///
    /// Returns `None` at the end of the stream or once destroyed.
    pub async fn next_frame(&mut self) -> Option<Result<Bytes, RelayError>> {
        loop {
            match self.next_event().await? {
                StreamEvent::Info(_) => continue,
                StreamEvent::Data(bytes) => return Some(Ok(bytes)),
                StreamEvent::Error(error) => return Some(Err(error)),
                StreamEvent::End => return None,
            }
        }
    }
}

impl Stream for AudioStream {
    type Item = StreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_event(cx)
    }
}

impl Drop for AudioStream {
    fn drop(&mut self) {
        self.handle.destroy();
        self.budget.close();
    }
}
