//! Audio-only Opus relay.
//!
//! A download request resolves a locator into a list of formats, picks one,
//! and produces a stream of raw Opus packets. Opus-in-WebM sources are demuxed
//! as-is; anything else is decoded and re-encoded through ffmpeg.
//!
//! ```no_run
//! # async fn example() -> Result<(), opus_relay::RelayError> {
//! use opus_relay::{DownloadOptions, StreamEvent};
//!
//! let mut stream = opus_relay::download("https://www.youtube.com/watch?v=...", DownloadOptions::default())?;
//! while let Some(event) = stream.next_event().await {
//!     match event {
//!         StreamEvent::Info(info) => println!("{} via {}", info.format, info.path),
//!         StreamEvent::Data(packet) => println!("{} byte packet", packet.len()),
//!         StreamEvent::Error(e) => return Err(e),
//!         StreamEvent::End => break,
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod model;
pub mod relay;
pub mod resolver;
pub mod selector;
pub mod source;
pub mod stream;
pub mod supervisor;

pub use config::DownloadOptions;
pub use error::{ErrorKind, RelayError, ResolveError};
pub use model::{CandidateFormat, ContentDescriptor};
pub use relay::{DemuxRelay, Relay, RelayOutcome, RelayPath, Stage, TranscodeConfig, TranscodeRelay};
pub use resolver::{ResolveOptions, Resolver, YtDlpResolver};
pub use selector::Selection;
pub use source::{BoxedReader, ByteSource, HttpByteSource, HttpSourceConfig};
pub use stream::{AudioStream, StreamEvent, StreamHandle, StreamInfo, WriteStatus};
pub use supervisor::{Request, SessionState, Supervisor};

use std::sync::Arc;

use tracing::{Instrument, info_span};

/// Entry point for download requests.
///
/// Cheap to clone; every request gets its own task, stream and session.
#[derive(Clone)]
pub struct Downloader {
    resolver: Arc<dyn Resolver>,
    source: Arc<dyn ByteSource>,
    options: DownloadOptions,
}

impl Downloader {
    /// Downloader backed by yt-dlp and an HTTP byte source.
    pub fn new(options: DownloadOptions) -> Result<Self, RelayError> {
        options.validate()?;
        let source = HttpByteSource::new(&options.http)?;
        Ok(Self {
            resolver: Arc::new(YtDlpResolver::new()),
            source: Arc::new(source),
            options,
        })
    }

    /// Downloader with custom collaborators.
    pub fn with_collaborators(
        resolver: Arc<dyn Resolver>,
        source: Arc<dyn ByteSource>,
        options: DownloadOptions,
    ) -> Result<Self, RelayError> {
        options.validate()?;
        Ok(Self {
            resolver,
            source,
            options,
        })
    }

    pub fn options(&self) -> &DownloadOptions {
        &self.options
    }

    fn supervisor(&self) -> Supervisor {
        Supervisor::new(
            self.resolver.clone(),
            Arc::new(DemuxRelay::new(self.source.clone())),
            Arc::new(TranscodeRelay::new(self.options.transcode.clone())),
            self.options.resolve.clone(),
        )
    }

    fn start(&self, request: Request, label: String) -> AudioStream {
        let (sink, stream) = stream::channel(self.options.high_water_mark);
        let supervisor = self.supervisor();
        tokio::spawn(
            async move {
                supervisor.run(request, sink).await;
            }
            .instrument(info_span!("download", request = %label)),
        );
        stream
    }

    /// Start a download. Must be called within a tokio runtime.
    ///
    /// The returned stream yields one `Info` event, then Opus packets, then
    /// `End` or a single `Error`.
    pub fn download(&self, locator: &str) -> AudioStream {
        self.start(Request::Locator(locator.to_string()), locator.to_string())
    }

    /// Start a download from an already resolved descriptor.
    pub fn download_with_info(&self, descriptor: ContentDescriptor) -> AudioStream {
        let label = descriptor.id.clone();
        self.start(Request::Resolved(descriptor), label)
    }

    /// Resolve a locator without downloading anything.
    pub async fn get_info(&self, locator: &str) -> Result<ContentDescriptor, RelayError> {
        let descriptor = self.resolver.resolve(locator, &self.options.resolve).await?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Resolve a locator and report which path and format a download would use.
    pub async fn plan(&self, locator: &str) -> Result<(ContentDescriptor, Selection), RelayError> {
        let descriptor = self.get_info(locator).await?;
        let selection = selector::select(&descriptor)?;
        Ok((descriptor, selection))
    }
}

/// Start a download with the default yt-dlp resolver and HTTP source.
pub fn download(locator: &str, options: DownloadOptions) -> Result<AudioStream, RelayError> {
    Ok(Downloader::new(options)?.download(locator))
}
