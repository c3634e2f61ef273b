//! Decode-then-encode relay for sources that are not Opus in WebM.
//!
//! Two ffmpeg processes run in series: the decoder reads the source URL and
//! writes raw PCM, the encoder turns that PCM into Opus in WebM, which is then
//! demuxed like any other WebM source.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webm::WebmDemuxer;

use super::{Relay, RelayOutcome, RelayPath, Stage, forward_frames};
use crate::error::RelayError;
use crate::model::{CandidateFormat, ContentDescriptor};
use crate::stream::StreamSink;

/// PCM sample rate between the stages.
pub const SAMPLE_RATE: u32 = 48_000;
/// PCM channel count between the stages.
pub const CHANNELS: u32 = 2;
/// Samples per channel in one Opus frame (20 ms at 48 kHz).
pub const FRAME_SIZE: u32 = 960;

const PUMP_BUFFER_SIZE: usize = 64 * 1024;
const STDERR_COLLECT_TIMEOUT: Duration = Duration::from_secs(1);
const ENCODER_EXIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Settings of the ffmpeg decode and encode stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeConfig {
    /// ffmpeg binary; falls back to `FFMPEG_PATH`, then `ffmpeg`.
    pub ffmpeg_path: Option<String>,
    /// Let the decoder reconnect dropped HTTP inputs.
    pub reconnect: bool,
    pub reconnect_delay_max_secs: u64,
    pub analyze_duration: u64,
    pub log_level: String,
    /// Time the encoder gets to flush and exit once its input is closed.
    pub encoder_stop_timeout_secs: u64,
    /// Time allowed for a killed decoder to be reaped.
    pub decoder_kill_timeout_secs: u64,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: None,
            reconnect: true,
            reconnect_delay_max_secs: 5,
            analyze_duration: 0,
            log_level: "0".to_string(),
            encoder_stop_timeout_secs: 10,
            decoder_kill_timeout_secs: 2,
        }
    }
}

impl TranscodeConfig {
    pub fn binary_path(&self) -> String {
        self.ffmpeg_path
            .clone()
            .or_else(|| std::env::var("FFMPEG_PATH").ok())
            .unwrap_or_else(|| "ffmpeg".to_string())
    }

    pub fn with_ffmpeg_path(mut self, path: impl Into<String>) -> Self {
        self.ffmpeg_path = Some(path.into());
        self
    }

    pub fn with_encoder_stop_timeout(mut self, timeout: Duration) -> Self {
        self.encoder_stop_timeout_secs = timeout.as_secs();
        self
    }

    fn encoder_stop_timeout(&self) -> Duration {
        Duration::from_secs(self.encoder_stop_timeout_secs)
    }

    fn decoder_kill_timeout(&self) -> Duration {
        Duration::from_secs(self.decoder_kill_timeout_secs)
    }
}

fn pcm_format_args() -> [String; 6] {
    [
        "-f".to_string(),
        "s16le".to_string(),
        "-ar".to_string(),
        SAMPLE_RATE.to_string(),
        "-ac".to_string(),
        CHANNELS.to_string(),
    ]
}

/// Transcodes any audio format to Opus through ffmpeg.
#[derive(Debug, Clone, Default)]
pub struct TranscodeRelay {
    config: TranscodeConfig,
}

impl TranscodeRelay {
    pub fn new(config: TranscodeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TranscodeConfig {
        &self.config
    }

    /// Arguments of the decode stage: source URL to raw PCM on stdout.
    pub fn decoder_args(&self, format: &CandidateFormat) -> Vec<String> {
        let mut args = Vec::new();

        if self.config.reconnect {
            args.extend([
                "-reconnect".to_string(),
                "1".to_string(),
                "-reconnect_streamed".to_string(),
                "1".to_string(),
                "-reconnect_delay_max".to_string(),
                self.config.reconnect_delay_max_secs.to_string(),
            ]);
        }

        if !format.http_headers.is_empty() {
            let headers: String = format
                .http_headers
                .iter()
                .map(|(k, v)| format!("{k}: {v}\r\n"))
                .collect();
            args.extend(["-headers".to_string(), headers]);
        }

        args.extend(["-i".to_string(), format.url.clone()]);
        args.extend([
            "-analyzeduration".to_string(),
            self.config.analyze_duration.to_string(),
            "-loglevel".to_string(),
            self.config.log_level.clone(),
        ]);
        args.extend(pcm_format_args());
        args.push("pipe:1".to_string());
        args
    }

    /// Arguments of the encode stage: raw PCM on stdin to Opus in WebM on
    /// stdout.
    pub fn encoder_args(&self) -> Vec<String> {
        let mut args = vec!["-loglevel".to_string(), self.config.log_level.clone()];
        args.extend(pcm_format_args());
        args.extend([
            "-i".to_string(),
            "pipe:0".to_string(),
            "-c:a".to_string(),
            "libopus".to_string(),
            "-frame_duration".to_string(),
            (FRAME_SIZE * 1000 / SAMPLE_RATE).to_string(),
            "-cluster_time_limit".to_string(),
            "1000".to_string(),
            "-f".to_string(),
            "webm".to_string(),
            "pipe:1".to_string(),
        ]);
        args
    }

    fn spawn_stage(
        &self,
        stage: Stage,
        program: &str,
        args: &[String],
        stdin: Stdio,
    ) -> Result<Child, RelayError> {
        debug!(%stage, %program, ?args, "spawning stage");
        let mut command = process_utils::tokio_command(program);
        command
            .args(args)
            .env("LC_ALL", "C")
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command.spawn().map_err(|source| RelayError::Spawn {
            stage,
            program: program.to_string(),
            source,
        })
    }

    /// Wait for both stages after the encoder output ended and turn their exit
    /// statuses into the relay result.
    async fn finish_stages(
        &self,
        stages: &mut Stages,
        outcome: RelayOutcome,
    ) -> Result<RelayOutcome, RelayError> {
        let stop_timeout = self.config.encoder_stop_timeout();
        let decoder_status = process_utils::wait_or_kill(&mut stages.decoder, stop_timeout).await?;
        let encoder_status = process_utils::wait_or_kill(&mut stages.encoder, stop_timeout).await?;

        let failed = match (decoder_status.success(), encoder_status.success()) {
            (true, true) => return Ok(outcome),
            (false, true) => Stage::Decoder,
            (true, false) => Stage::Encoder,
            // A decoder killed by a signal was cut off by the encoder exiting.
            (false, false) if decoder_status.code().is_some() => Stage::Decoder,
            (false, false) => Stage::Encoder,
        };

        let status = match failed {
            Stage::Decoder => decoder_status,
            Stage::Encoder => encoder_status,
        };
        let stderr = stages.take_stderr(failed).await;
        Err(stage_error(failed, &status, stderr))
    }

    /// Attribute a broken encoder output. An encoder that exits unsuccessfully
    /// explains the stream better than the demuxer does; its stdout may close
    /// before the process is reaped, so its exit is awaited for a moment.
    async fn demux_failed(&self, stages: &mut Stages, error: RelayError) -> RelayError {
        process_utils::kill_and_reap(&mut stages.decoder, self.config.decoder_kill_timeout()).await;

        let crashed = match tokio::time::timeout(ENCODER_EXIT_TIMEOUT, stages.encoder.wait()).await
        {
            Ok(Ok(status)) if !status.success() => Some(status),
            Ok(Ok(_)) => None,
            Ok(Err(e)) => {
                warn!(error = %e, "failed to wait for encoder");
                None
            }
            Err(_) => {
                process_utils::kill_and_reap(&mut stages.encoder, self.config.decoder_kill_timeout())
                    .await;
                None
            }
        };

        match crashed {
            Some(status) => {
                let stderr = stages.take_stderr(Stage::Encoder).await;
                stage_error(Stage::Encoder, &status, stderr)
            }
            None => error,
        }
    }

    /// Tear the session down after cancellation: kill the decoder, let the
    /// encoder flush into the void, and kill it if it takes too long.
    async fn stop_stages<R>(&self, stages: &mut Stages, frames: &mut FramedRead<R, WebmDemuxer>)
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        process_utils::kill_and_reap(&mut stages.decoder, self.config.decoder_kill_timeout()).await;

        let deadline = Instant::now() + self.config.encoder_stop_timeout();
        let mut discarded = 0u64;
        let drained = tokio::time::timeout_at(deadline, async {
            while let Some(frame) = frames.next().await {
                if frame.is_err() {
                    break;
                }
                discarded += 1;
            }
        })
        .await;
        if drained.is_err() {
            warn!("encoder output was not drained in time");
        }
        debug!(discarded, "discarded encoder output after cancellation");

        let grace = deadline.saturating_duration_since(Instant::now());
        match process_utils::wait_or_kill(&mut stages.encoder, grace).await {
            Ok(status) => debug!(status = %process_utils::describe_exit(&status), "encoder stopped"),
            Err(e) => warn!(error = %e, "failed to stop encoder"),
        }
    }
}

fn stage_error(stage: Stage, status: &ExitStatus, stderr: Option<String>) -> RelayError {
    let mut reason = process_utils::describe_exit(status);
    if let Some(line) = stderr {
        reason.push_str(": ");
        reason.push_str(&line);
    }
    RelayError::process(stage, reason)
}

/// Running processes of one transcode session.
struct Stages {
    decoder: Child,
    encoder: Child,
    pump: JoinHandle<u64>,
    decoder_stderr: Option<JoinHandle<Option<String>>>,
    encoder_stderr: Option<JoinHandle<Option<String>>>,
}

impl Stages {
    async fn take_stderr(&mut self, stage: Stage) -> Option<String> {
        let handle = match stage {
            Stage::Decoder => self.decoder_stderr.take(),
            Stage::Encoder => self.encoder_stderr.take(),
        }?;
        match tokio::time::timeout(STDERR_COLLECT_TIMEOUT, handle).await {
            Ok(Ok(line)) => line,
            _ => None,
        }
    }
}

/// Log a stage's stderr and keep its last non-empty line.
fn collect_stderr(stage: Stage, stderr: ChildStderr) -> JoinHandle<Option<String>> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        let mut last = None;
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if !line.is_empty() {
                        debug!(%stage, "{}", line);
                        last = Some(line.to_string());
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(%stage, error = %e, "error reading stderr");
                    break;
                }
            }
        }
        last
    })
}

/// Copy decoder PCM into the encoder until the decoder ends or the request is
/// cancelled. Dropping the encoder's stdin on exit lets it flush and finish.
fn spawn_pump(
    mut from: ChildStdout,
    mut to: ChildStdin,
    token: CancellationToken,
) -> JoinHandle<u64> {
    tokio::spawn(async move {
        let mut buffer = vec![0u8; PUMP_BUFFER_SIZE];
        let mut total = 0u64;

        loop {
            let n = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                result = from.read(&mut buffer) => match result {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        debug!(error = %e, "decoder stdout read failed");
                        break;
                    }
                },
            };

            let written = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                result = to.write_all(&buffer[..n]) => result,
            };
            if let Err(e) = written {
                debug!(error = %e, "encoder stdin closed");
                break;
            }
            total += n as u64;
        }

        drop(to);
        total
    })
}

#[async_trait]
impl Relay for TranscodeRelay {
    fn path(&self) -> RelayPath {
        RelayPath::Transcode
    }

    async fn run(
        &self,
        descriptor: &ContentDescriptor,
        format: &CandidateFormat,
        sink: &mut StreamSink,
        token: CancellationToken,
    ) -> Result<RelayOutcome, RelayError> {
        if token.is_cancelled() {
            return Ok(RelayOutcome::Cancelled);
        }

        let program = self.config.binary_path();
        info!(id = %descriptor.id, format = %format, %program, "starting transcode");

        let mut decoder = self.spawn_stage(
            Stage::Decoder,
            &program,
            &self.decoder_args(format),
            Stdio::null(),
        )?;
        let mut encoder = match self.spawn_stage(
            Stage::Encoder,
            &program,
            &self.encoder_args(),
            Stdio::piped(),
        ) {
            Ok(child) => child,
            Err(e) => {
                process_utils::kill_and_reap(&mut decoder, self.config.decoder_kill_timeout())
                    .await;
                return Err(e);
            }
        };

        let decoder_stdout = decoder
            .stdout
            .take()
            .ok_or_else(|| RelayError::process(Stage::Decoder, "stdout not captured"))?;
        let encoder_stdin = encoder
            .stdin
            .take()
            .ok_or_else(|| RelayError::process(Stage::Encoder, "stdin not captured"))?;
        let encoder_stdout = encoder
            .stdout
            .take()
            .ok_or_else(|| RelayError::process(Stage::Encoder, "stdout not captured"))?;

        let decoder_stderr = decoder
            .stderr
            .take()
            .map(|stderr| collect_stderr(Stage::Decoder, stderr));
        let encoder_stderr = encoder
            .stderr
            .take()
            .map(|stderr| collect_stderr(Stage::Encoder, stderr));

        let pump = spawn_pump(decoder_stdout, encoder_stdin, token.clone());
        let mut stages = Stages {
            decoder,
            encoder,
            pump,
            decoder_stderr,
            encoder_stderr,
        };

        let mut frames = FramedRead::new(encoder_stdout, WebmDemuxer::new());
        let result = match forward_frames(&mut frames, sink, &token).await {
            Ok(RelayOutcome::Cancelled) => {
                debug!("transcode cancelled, stopping stages");
                self.stop_stages(&mut stages, &mut frames).await;
                Ok(RelayOutcome::Cancelled)
            }
            Ok(outcome) => self.finish_stages(&mut stages, outcome).await,
            Err(e) => Err(self.demux_failed(&mut stages, e).await),
        };

        drop(frames);
        match (&mut stages.pump).await {
            Ok(pcm_bytes) => debug!(pcm_bytes, "pcm pump finished"),
            Err(e) => warn!(error = %e, "pcm pump task failed"),
        }

        if let Ok(RelayOutcome::Completed { frames, bytes }) = &result {
            info!(format = %format, frames, bytes, "transcode complete");
        }
        result
    }
}
