//! Error types for resolution and relaying.

use reqwest::StatusCode;
use thiserror::Error;
use webm::WebmError;

use crate::relay::Stage;
use crate::supervisor::SessionState;

/// Failure to turn a locator into a [`ContentDescriptor`](crate::ContentDescriptor).
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("resolver exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("resolver timed out after {0} seconds")]
    Timeout(u64),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid content descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("{0}")]
    Other(String),
}

impl ResolveError {
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}

/// Coarse classification of a [`RelayError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Metadata or format list unavailable.
    Resolution,
    /// No format the relays can use.
    Selection,
    /// Byte source or process I/O failure.
    Transport,
    /// Malformed container data.
    Demux,
    /// The encode stage failed.
    Encode,
    /// Misuse of the API or broken invariants.
    Internal,
}

/// Terminal error of a download request.
///
/// Every variant is fatal for the request; the relay never retries.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("resolution failed: {0}")]
    Resolution(#[from] ResolveError),

    #[error("no suitable format found")]
    NoSuitableFormat,

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} for {url}")]
    HttpStatus { status: StatusCode, url: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("failed to spawn {stage} `{program}`: {source}")]
    Spawn {
        stage: Stage,
        program: String,
        source: std::io::Error,
    },

    #[error("{stage} failed: {reason}")]
    Process { stage: Stage, reason: String },

    #[error("demux error: {0}")]
    Demux(WebmError),

    #[error("invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition {
        from: SessionState,
        to: SessionState,
    },

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl From<WebmError> for RelayError {
    fn from(err: WebmError) -> Self {
        match err {
            // I/O errors surface through the demuxer from the underlying reader.
            WebmError::Io(source) => Self::Io { source },
            other => Self::Demux(other),
        }
    }
}

impl RelayError {
    pub fn process(stage: Stage, reason: impl Into<String>) -> Self {
        Self::Process {
            stage,
            reason: reason.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Resolution(_) => ErrorKind::Resolution,
            Self::NoSuitableFormat => ErrorKind::Selection,
            Self::InvalidUrl { .. }
            | Self::Network { .. }
            | Self::HttpStatus { .. }
            | Self::Io { .. } => ErrorKind::Transport,
            Self::Spawn { stage, .. } | Self::Process { stage, .. } => match stage {
                Stage::Decoder => ErrorKind::Transport,
                Stage::Encoder => ErrorKind::Encode,
            },
            Self::Demux(_) => ErrorKind::Demux,
            Self::InvalidStateTransition { .. } | Self::Configuration(_) => ErrorKind::Internal,
        }
    }

    /// Whether a *new* request for the same content might succeed.
    ///
    /// The relay itself never retries a failed session.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Network { .. } | Self::Io { .. } | Self::Process { .. } => true,
            Self::Resolution(ResolveError::Timeout(_)) => true,
            Self::Resolution(_)
            | Self::NoSuitableFormat
            | Self::InvalidUrl { .. }
            | Self::Spawn { .. }
            | Self::Demux(_)
            | Self::InvalidStateTransition { .. }
            | Self::Configuration(_) => false,
        }
    }
}
