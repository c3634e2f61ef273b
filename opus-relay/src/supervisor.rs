//! Per-request lifecycle: resolve, select, relay, tear down.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::RelayError;
use crate::model::ContentDescriptor;
use crate::relay::{Relay, RelayOutcome, RelayPath};
use crate::resolver::{ResolveOptions, Resolver};
use crate::selector;
use crate::stream::{StreamInfo, StreamSink};

/// State of one download request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Resolving,
    Selecting,
    Remuxing,
    Transcoding,
    Completed,
    Destroyed,
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Resolving => "resolving",
            Self::Selecting => "selecting",
            Self::Remuxing => "remuxing",
            Self::Transcoding => "transcoding",
            Self::Completed => "completed",
            Self::Destroyed => "destroyed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Destroyed | Self::Failed)
    }

    pub fn can_transition_to(&self, target: SessionState) -> bool {
        use SessionState::*;
        match (self, target) {
            (from, _) if from.is_terminal() => false,
            (_, Destroyed | Failed) => true,
            (Resolving, Selecting) => true,
            (Selecting, Remuxing | Transcoding) => true,
            (Remuxing | Transcoding, Completed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<RelayPath> for SessionState {
    fn from(path: RelayPath) -> Self {
        match path {
            RelayPath::Remux => Self::Remuxing,
            RelayPath::Transcode => Self::Transcoding,
        }
    }
}

/// Owner of a request's [`SessionState`].
#[derive(Debug)]
pub struct Session {
    state: SessionState,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            state: SessionState::Resolving,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn transition(&mut self, to: SessionState) -> Result<(), RelayError> {
        if !self.state.can_transition_to(to) {
            return Err(RelayError::InvalidStateTransition {
                from: self.state,
                to,
            });
        }
        debug!(from = %self.state, %to, "session state change");
        self.state = to;
        Ok(())
    }
}

/// What a request starts from.
#[derive(Debug, Clone)]
pub enum Request {
    Locator(String),
    Resolved(ContentDescriptor),
}

/// Drives one request from resolution to a terminal stream event.
#[derive(Clone)]
pub struct Supervisor {
    resolver: Arc<dyn Resolver>,
    remux: Arc<dyn Relay>,
    transcode: Arc<dyn Relay>,
    resolve_options: ResolveOptions,
}

impl Supervisor {
    pub fn new(
        resolver: Arc<dyn Resolver>,
        remux: Arc<dyn Relay>,
        transcode: Arc<dyn Relay>,
        resolve_options: ResolveOptions,
    ) -> Self {
        Self {
            resolver,
            remux,
            transcode,
            resolve_options,
        }
    }

    fn relay_for(&self, path: RelayPath) -> Result<&Arc<dyn Relay>, RelayError> {
        let relay = match path {
            RelayPath::Remux => &self.remux,
            RelayPath::Transcode => &self.transcode,
        };
        if relay.path() != path {
            return Err(RelayError::config(format!(
                "{} relay registered for the {path} path",
                relay.path()
            )));
        }
        Ok(relay)
    }

    /// Run the request to completion and return its final state.
    ///
    /// Exactly one terminal event reaches the stream unless it was destroyed.
    pub async fn run(&self, request: Request, mut sink: StreamSink) -> SessionState {
        let token = sink.handle().token();
        let mut session = Session::new();

        let result = self.drive(&mut session, request, &mut sink, &token).await;

        let terminal = match &result {
            _ if token.is_cancelled() => SessionState::Destroyed,
            Ok(RelayOutcome::Cancelled) => SessionState::Destroyed,
            Ok(RelayOutcome::Completed { .. }) => SessionState::Completed,
            Err(_) => SessionState::Failed,
        };
        if let Err(e) = session.transition(terminal) {
            error!(error = %e, "session reached an unexpected state");
        }

        match result {
            Ok(RelayOutcome::Completed { frames, bytes }) => {
                info!(frames, bytes, state = %session.state(), "session finished");
                sink.finish();
            }
            Ok(RelayOutcome::Cancelled) => {
                info!("session destroyed");
            }
            Err(e) if token.is_cancelled() => {
                debug!(error = %e, "error after destroy ignored");
            }
            Err(e) => {
                warn!(error = %e, kind = ?e.kind(), "session failed");
                sink.fail(e);
            }
        }
        session.state()
    }

    async fn drive(
        &self,
        session: &mut Session,
        request: Request,
        sink: &mut StreamSink,
        token: &CancellationToken,
    ) -> Result<RelayOutcome, RelayError> {
        let descriptor = match request {
            Request::Locator(locator) => {
                debug!(%locator, "resolving");
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return Ok(RelayOutcome::Cancelled),
                    resolved = self.resolver.resolve(&locator, &self.resolve_options) => resolved?,
                }
            }
            Request::Resolved(descriptor) => descriptor,
        };
        descriptor.validate()?;
        let descriptor = Arc::new(descriptor);

        session.transition(SessionState::Selecting)?;
        if token.is_cancelled() {
            return Ok(RelayOutcome::Cancelled);
        }

        let selection = selector::select(&descriptor)?;
        let path = selection.path();
        let format = selection.into_format();
        info!(id = %descriptor.id, format = %format, %path, "format selected");

        sink.emit_info(StreamInfo {
            descriptor: descriptor.clone(),
            format: format.clone(),
            path,
        });
        // Give a caller reacting to the info event a chance to destroy first.
        tokio::task::yield_now().await;
        if token.is_cancelled() {
            return Ok(RelayOutcome::Cancelled);
        }

        let relay = self.relay_for(path)?;
        session.transition(path.into())?;
        relay.run(&descriptor, &format, sink, token.clone()).await
    }
}
