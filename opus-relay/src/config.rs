use serde::{Deserialize, Serialize};

use crate::error::RelayError;
use crate::relay::TranscodeConfig;
use crate::resolver::ResolveOptions;
use crate::source::HttpSourceConfig;
use crate::stream::DEFAULT_HIGH_WATER_MARK;

/// Options for one or more download requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadOptions {
    /// Byte budget of the output stream.
    pub high_water_mark: usize,
    /// Passed through to the resolver.
    pub resolve: ResolveOptions,
    /// ffmpeg settings for the transcode path.
    pub transcode: TranscodeConfig,
    /// HTTP client settings for the remux path.
    pub http: HttpSourceConfig,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            resolve: ResolveOptions::default(),
            transcode: TranscodeConfig::default(),
            http: HttpSourceConfig::default(),
        }
    }
}

impl DownloadOptions {
    pub fn with_high_water_mark(mut self, bytes: usize) -> Self {
        self.high_water_mark = bytes;
        self
    }

    pub fn with_resolve(mut self, resolve: ResolveOptions) -> Self {
        self.resolve = resolve;
        self
    }

    pub fn with_transcode(mut self, transcode: TranscodeConfig) -> Self {
        self.transcode = transcode;
        self
    }

    pub fn with_http(mut self, http: HttpSourceConfig) -> Self {
        self.http = http;
        self
    }

    pub fn validate(&self) -> Result<(), RelayError> {
        if self.high_water_mark == 0 {
            return Err(RelayError::config("high_water_mark must be greater than zero"));
        }
        if self.high_water_mark > u32::MAX as usize {
            return Err(RelayError::config(format!(
                "high_water_mark must not exceed {} bytes",
                u32::MAX
            )));
        }
        if self.transcode.encoder_stop_timeout_secs == 0 {
            return Err(RelayError::config(
                "transcode.encoder_stop_timeout_secs must be greater than zero",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = DownloadOptions::default();
        assert_eq!(options.high_water_mark, 512 * 1024);
        assert_eq!(options.resolve.timeout_secs, 60);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_partial_json() {
        let options: DownloadOptions = serde_json::from_str(
            r#"{"high_water_mark": 65536, "transcode": {"reconnect_delay_max_secs": 10}}"#,
        )
        .unwrap();
        assert_eq!(options.high_water_mark, 65536);
        assert_eq!(options.transcode.reconnect_delay_max_secs, 10);
        assert_eq!(options.transcode.encoder_stop_timeout_secs, 10);
        assert_eq!(options.http, HttpSourceConfig::default());
    }

    #[test]
    fn test_zero_high_water_mark_rejected() {
        let err = DownloadOptions::default()
            .with_high_water_mark(0)
            .validate()
            .unwrap_err();
        assert!(matches!(err, RelayError::Configuration(_)));
    }
}
