use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use opus_relay::DownloadOptions;

#[derive(Parser, Debug)]
#[command(
    name = "opus-relay",
    author,
    version,
    about = "Download the audio of a video as raw Opus packets",
    long_about = "Resolves the URL with yt-dlp, remuxes Opus/WebM audio when available and \
                  transcodes through ffmpeg otherwise. Packets are written length-delimited \
                  (4-byte big-endian length, then the packet)."
)]
pub struct Args {
    /// Video URL or any locator yt-dlp understands
    pub url: String,

    /// Output file ("-" for stdout)
    #[arg(short, long, default_value = "-")]
    pub output: PathBuf,

    /// Print the resolved info and selected format as JSON and exit
    #[arg(long)]
    pub info_only: bool,

    /// JSON file with download options; flags below override it
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Output buffer size in bytes
    #[arg(long)]
    pub high_water_mark: Option<usize>,

    /// Path to the ffmpeg binary
    #[arg(long, env = "FFMPEG_PATH")]
    pub ffmpeg_path: Option<String>,

    /// Path to the yt-dlp binary
    #[arg(long, env = "YTDLP_PATH")]
    pub ytdlp_path: Option<String>,

    /// Netscape cookies file passed to yt-dlp
    #[arg(long)]
    pub cookies: Option<PathBuf>,

    /// Format filter passed to yt-dlp
    #[arg(long)]
    pub format_filter: Option<String>,

    /// Resolution timeout in seconds
    #[arg(long)]
    pub resolve_timeout: Option<u64>,

    /// HTTP proxy for the remux path
    #[arg(long)]
    pub proxy: Option<String>,

    /// Enable debug logging
    #[arg(short, long, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// Options from the config file (or defaults) with flag overrides applied.
    pub fn download_options(&self) -> Result<DownloadOptions> {
        let mut options = match &self.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("Invalid config {}", path.display()))?
            }
            None => DownloadOptions::default(),
        };

        if let Some(hwm) = self.high_water_mark {
            options.high_water_mark = hwm;
        }
        if let Some(path) = &self.ffmpeg_path {
            options.transcode.ffmpeg_path = Some(path.clone());
        }
        if let Some(path) = &self.ytdlp_path {
            options.resolve.binary_path = Some(path.clone());
        }
        if let Some(cookies) = &self.cookies {
            options.resolve.cookies_file = Some(cookies.clone());
        }
        if let Some(filter) = &self.format_filter {
            options.resolve.format_filter = Some(filter.clone());
        }
        if let Some(timeout) = self.resolve_timeout {
            options.resolve.timeout_secs = timeout;
        }
        if let Some(proxy) = &self.proxy {
            options.http.proxy = Some(proxy.clone());
        }

        options.validate()?;
        Ok(options)
    }

    pub fn writes_to_stdout(&self) -> bool {
        self.output.as_os_str() == "-"
    }
}
