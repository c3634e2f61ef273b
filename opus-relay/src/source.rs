//! Byte sources: where the encoded media of a format comes from.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};
use url::Url;

use crate::error::RelayError;
use crate::model::{CandidateFormat, ContentDescriptor};

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

/// Readable media bytes.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Opens the encoded bytes of a format.
#[async_trait]
pub trait ByteSource: Send + Sync {
    async fn open(
        &self,
        descriptor: &ContentDescriptor,
        format: &CandidateFormat,
    ) -> Result<BoxedReader, RelayError>;
}

/// HTTP client settings for [`HttpByteSource`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSourceConfig {
    pub user_agent: String,
    /// Connection timeout in seconds (0 = none).
    pub connect_timeout_secs: u64,
    /// Maximum time between body chunks in seconds (0 = none).
    pub read_timeout_secs: u64,
    /// Explicit proxy for all requests.
    pub proxy: Option<String>,
}

impl Default for HttpSourceConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            connect_timeout_secs: 30,
            read_timeout_secs: 30,
            proxy: None,
        }
    }
}

fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Build the HTTP client used to fetch media bytes.
pub fn build_client(config: &HttpSourceConfig) -> Result<Client, RelayError> {
    install_rustls_provider();

    let mut builder = Client::builder().user_agent(&config.user_agent);
    if config.connect_timeout_secs > 0 {
        builder = builder.connect_timeout(Duration::from_secs(config.connect_timeout_secs));
    }
    if config.read_timeout_secs > 0 {
        builder = builder.read_timeout(Duration::from_secs(config.read_timeout_secs));
    }
    if let Some(proxy) = config.proxy.as_deref() {
        let proxy = reqwest::Proxy::all(proxy)
            .map_err(|e| RelayError::config(format!("invalid proxy `{proxy}`: {e}")))?;
        builder = builder.proxy(proxy);
    }

    Ok(builder.build()?)
}

fn format_headers(format: &CandidateFormat) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in &format.http_headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!(header = %name, "skipping invalid format header"),
        }
    }
    headers
}

/// Streams a format's URL over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpByteSource {
    client: Client,
}

impl HttpByteSource {
    pub fn new(config: &HttpSourceConfig) -> Result<Self, RelayError> {
        Ok(Self {
            client: build_client(config)?,
        })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ByteSource for HttpByteSource {
    async fn open(
        &self,
        descriptor: &ContentDescriptor,
        format: &CandidateFormat,
    ) -> Result<BoxedReader, RelayError> {
        let url = Url::parse(&format.url).map_err(|e| RelayError::InvalidUrl {
            input: format.url.clone(),
            reason: e.to_string(),
        })?;

        debug!(id = %descriptor.id, format = %format, host = url.host_str(), "opening source");
        let response = self
            .client
            .get(url)
            .headers(format_headers(format))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::HttpStatus {
                status,
                url: format.url.clone(),
            });
        }

        let body = response
            .bytes_stream()
            .map_err(std::io::Error::other)
            .boxed();
        Ok(Box::new(StreamReader::new(body)))
    }
}
