//! Resolution of a locator into a [`ContentDescriptor`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ResolveError;
use crate::model::{CandidateFormat, ContentDescriptor};

/// Options passed through to the resolver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolveOptions {
    /// yt-dlp binary; falls back to `YTDLP_PATH`, then `yt-dlp`.
    pub binary_path: Option<String>,
    /// Netscape cookies file handed to the resolver.
    pub cookies_file: Option<PathBuf>,
    /// Format filter passed to the resolver as-is. When set, only the
    /// formats the resolver picked with it are offered to the selector.
    pub format_filter: Option<String>,
    pub extra_args: Vec<String>,
    /// Resolution timeout in seconds (0 = none).
    pub timeout_secs: u64,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            binary_path: None,
            cookies_file: None,
            format_filter: None,
            extra_args: Vec::new(),
            timeout_secs: 60,
        }
    }
}

impl ResolveOptions {
    pub fn binary_path(&self) -> String {
        self.binary_path
            .clone()
            .or_else(|| std::env::var("YTDLP_PATH").ok())
            .unwrap_or_else(|| "yt-dlp".to_string())
    }

    pub fn with_binary_path(mut self, path: impl Into<String>) -> Self {
        self.binary_path = Some(path.into());
        self
    }

    pub fn with_cookies_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.cookies_file = Some(path.into());
        self
    }

    pub fn with_format_filter(mut self, filter: impl Into<String>) -> Self {
        self.format_filter = Some(filter.into());
        self
    }
}

/// Turns a locator into metadata and the list of available formats.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(
        &self,
        locator: &str,
        options: &ResolveOptions,
    ) -> Result<ContentDescriptor, ResolveError>;
}

#[derive(Debug, Deserialize)]
struct YtDlpInfo {
    #[serde(default)]
    id: String,
    #[serde(default)]
    title: String,
    duration: Option<f64>,
    is_live: Option<bool>,
    live_status: Option<String>,
    #[serde(default)]
    formats: Vec<YtDlpFormat>,
    /// Selection made with `--format`, e.g. `251` or `137+251`.
    format_id: Option<String>,
    #[serde(default)]
    requested_formats: Vec<YtDlpRequested>,
}

#[derive(Debug, Deserialize)]
struct YtDlpRequested {
    format_id: String,
}

impl YtDlpInfo {
    /// Format ids chosen by the resolver's own format filter.
    fn selected_format_ids(&self) -> Vec<&str> {
        if !self.requested_formats.is_empty() {
            return self
                .requested_formats
                .iter()
                .map(|f| f.format_id.as_str())
                .collect();
        }
        self.format_id
            .as_deref()
            .map(|id| id.split('+').collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
struct YtDlpFormat {
    #[serde(default)]
    format_id: String,
    url: Option<String>,
    ext: Option<String>,
    acodec: Option<String>,
    vcodec: Option<String>,
    asr: Option<f64>,
    abr: Option<f64>,
    tbr: Option<f64>,
    protocol: Option<String>,
    #[serde(default)]
    http_headers: BTreeMap<String, String>,
}

fn positive_round(value: Option<f64>) -> Option<u32> {
    value
        .filter(|v| v.is_finite() && *v > 0.0)
        .map(|v| v.round() as u32)
}

impl YtDlpFormat {
    fn into_candidate(self) -> Option<CandidateFormat> {
        let url = self.url.filter(|u| !u.trim().is_empty())?;
        let acodec = self.acodec.unwrap_or_else(|| "none".to_string());
        let has_audio = acodec != "none";
        let audio_only = has_audio && self.vcodec.as_deref() == Some("none");

        Some(CandidateFormat {
            format_id: self.format_id,
            codec: acodec,
            container: self.ext.unwrap_or_default(),
            audio_sample_rate: positive_round(self.asr),
            audio_bitrate: if has_audio {
                positive_round(self.abr)
            } else {
                None
            },
            bitrate: positive_round(self.tbr),
            audio_only,
            is_hls: self
                .protocol
                .as_deref()
                .is_some_and(|p| p.starts_with("m3u8")),
            url,
            http_headers: self.http_headers,
        })
    }
}

/// Resolves locators with `yt-dlp --dump-single-json`.
#[derive(Debug, Clone, Default)]
pub struct YtDlpResolver;

impl YtDlpResolver {
    pub fn new() -> Self {
        Self
    }

    /// Version of the configured binary, if it runs at all.
    pub fn version(options: &ResolveOptions) -> Option<String> {
        process_utils::probe_version(options.binary_path(), "--version")
    }

    pub fn build_args(locator: &str, options: &ResolveOptions) -> Vec<String> {
        let mut args = vec![
            "--dump-single-json".to_string(),
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
        ];

        if let Some(cookies) = &options.cookies_file {
            args.extend([
                "--cookies".to_string(),
                cookies.to_string_lossy().to_string(),
            ]);
        }
        if let Some(filter) = &options.format_filter {
            args.extend(["--format".to_string(), filter.clone()]);
        }
        args.extend(options.extra_args.iter().cloned());

        // Keep the locator from being read as an option.
        args.push("--".to_string());
        args.push(locator.to_string());
        args
    }

    /// Map yt-dlp's JSON output onto a [`ContentDescriptor`].
    ///
    /// Formats without a URL (storyboards, DRM placeholders) are dropped.
    /// With `selected_only`, formats the resolver did not pick are dropped too.
    pub fn parse_output(json: &str, selected_only: bool) -> Result<ContentDescriptor, ResolveError> {
        let mut info: YtDlpInfo = serde_json::from_str(json)?;

        if selected_only {
            let selected: Vec<String> = info
                .selected_format_ids()
                .into_iter()
                .map(str::to_string)
                .collect();
            if selected.is_empty() {
                debug!("resolver reported no selected format, keeping all");
            } else {
                debug!(?selected, "keeping formats picked by the format filter");
                info.formats.retain(|f| selected.contains(&f.format_id));
            }
        }

        let is_live = info.is_live.unwrap_or(false)
            || info.live_status.as_deref() == Some("is_live");
        let duration_secs = if is_live {
            0
        } else {
            info.duration
                .filter(|d| d.is_finite() && *d > 0.0)
                .map(|d| d.round() as u64)
                .unwrap_or(0)
        };

        let formats: Vec<CandidateFormat> = info
            .formats
            .into_iter()
            .filter_map(YtDlpFormat::into_candidate)
            .collect();

        Ok(ContentDescriptor {
            id: info.id,
            title: info.title,
            duration_secs,
            is_live,
            formats,
        })
    }
}

#[async_trait]
impl Resolver for YtDlpResolver {
    async fn resolve(
        &self,
        locator: &str,
        options: &ResolveOptions,
    ) -> Result<ContentDescriptor, ResolveError> {
        let program = options.binary_path();
        let args = Self::build_args(locator, options);
        debug!(%program, ?args, "running resolver");

        let mut cmd = process_utils::tokio_command(&program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // The child is killed on drop if the timeout fires.
        let output = if options.timeout_secs > 0 {
            tokio::time::timeout(Duration::from_secs(options.timeout_secs), cmd.output())
                .await
                .map_err(|_| ResolveError::Timeout(options.timeout_secs))?
        } else {
            cmd.output().await
        }
        .map_err(|source| ResolveError::Spawn {
            program: program.clone(),
            source,
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ResolveError::Failed {
                status: process_utils::describe_exit(&output.status),
                stderr,
            });
        }

        let descriptor = Self::parse_output(
            &String::from_utf8_lossy(&output.stdout),
            options.format_filter.is_some(),
        )?;
        info!(
            id = %descriptor.id,
            formats = descriptor.formats.len(),
            duration_secs = descriptor.duration_secs,
            is_live = descriptor.is_live,
            "resolved"
        );
        Ok(descriptor)
    }
}
