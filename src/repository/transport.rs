// src/repository/transport.rs
//! Transport abstraction over the upstream repository
//!
//! Locators are paths relative to the repository root
//! (`dists/focal/InRelease`, `pool/main/h/hello/hello_2.10_amd64.deb`).
//! Two backends are provided:
//! - [`HttpTransport`]: HTTP/HTTPS mirror via reqwest, streaming bodies
//! - [`LocalTransport`]: a repository tree on the local filesystem

use crate::error::{Error, Result};
use crate::filesystem::path::sanitize_path;
use async_trait::async_trait;
use futures::TryStreamExt;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};
use url::Url;

/// Connect timeout for HTTP requests
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Idle timeout between body chunks
const READ_TIMEOUT: Duration = Duration::from_secs(100);

/// Attempts made on timeouts before reporting the locator as absent
const MAX_TIMEOUT_ATTEMPTS: u32 = 3;

/// Byte stream of a fetched resource
pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

/// Successful fetch: body plus the metadata the transport knows about it
pub struct Fetched {
    pub body: ByteStream,
    /// Content type reported by the server, if any
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
}

impl std::fmt::Debug for Fetched {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetched")
            .field("content_type", &self.content_type)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Read-only access to an upstream repository
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the resource at `locator`
    ///
    /// Returns `Error::NotFoundError` when the resource is absent (or timed
    /// out repeatedly); other failures use the variant that fits.
    async fn fetch(&self, locator: &str) -> Result<Fetched>;

    /// Check for existence without transferring the body
    ///
    /// Failed checks report `false`.
    async fn exists(&self, locator: &str) -> bool;

    /// Whether the repository is reached over the network
    ///
    /// by-hash probing is only worth its round trips for remote sources.
    fn is_remote(&self) -> bool;

    /// Human-readable name for logs
    fn name(&self) -> &str;
}

/// Build the transport matching a source string
///
/// `http://` and `https://` sources use [`HttpTransport`]; `file://` URLs and
/// plain paths use [`LocalTransport`].
pub fn transport_for(source: &str) -> Result<Arc<dyn Transport>> {
    if source.starts_with("http://") || source.starts_with("https://") {
        return Ok(Arc::new(HttpTransport::new(source)?));
    }

    if source.starts_with("file://") {
        let url = Url::parse(source)
            .map_err(|e| Error::ConfigError(format!("Invalid source URL {source}: {e}")))?;
        let root = url
            .to_file_path()
            .map_err(|_| Error::ConfigError(format!("Source URL {source} is not a local path")))?;
        return Ok(Arc::new(LocalTransport::new(root)));
    }

    if source.contains("://") {
        return Err(Error::ConfigError(format!(
            "Unsupported source scheme: {source}"
        )));
    }

    Ok(Arc::new(LocalTransport::new(source)))
}

/// HTTP transport using reqwest
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: Url,
    max_attempts: u32,
}

impl HttpTransport {
    /// Create a transport rooted at `base_url`
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_timeouts(base_url, CONNECT_TIMEOUT, READ_TIMEOUT, MAX_TIMEOUT_ATTEMPTS)
    }

    /// Create a transport with explicit timeouts and timeout attempts
    pub(crate) fn with_timeouts(
        base_url: &str,
        connect_timeout: Duration,
        read_timeout: Duration,
        max_attempts: u32,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout)
            .user_agent(concat!("debmirror/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::InitError(format!("Failed to create HTTP client: {e}")))?;

        // Joining against a base without a trailing slash would drop its last segment
        let normalized = format!("{}/", base_url.trim_end_matches('/'));
        let base_url = Url::parse(&normalized)
            .map_err(|e| Error::ConfigError(format!("Invalid repository URL {base_url}: {e}")))?;

        Ok(Self {
            client,
            base_url,
            max_attempts: max_attempts.max(1),
        })
    }

    /// Full URL of a locator
    pub fn url(&self, locator: &str) -> Result<Url> {
        self.base_url
            .join(locator.trim_start_matches('/'))
            .map_err(|e| Error::InvalidPath(format!("Cannot build URL for {locator}: {e}")))
    }
}

impl HttpTransport {
    /// One GET; a timeout comes back as `TimeoutError`
    async fn request(&self, url: &Url) -> Result<reqwest::Response> {
        let response = self.client.get(url.clone()).send().await.map_err(|e| {
            if is_timeout(&e) {
                Error::TimeoutError(url.to_string())
            } else {
                Error::DownloadError(format!("Failed to fetch {url}: {e}"))
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        Err(match status {
            reqwest::StatusCode::NOT_FOUND | reqwest::StatusCode::GONE => {
                Error::NotFoundError(format!("HTTP {status} from {url}"))
            }
            _ => Error::DownloadError(format!("HTTP {status} from {url}")),
        })
    }
}

/// Whether a request failed on a connect or read timeout
fn is_timeout(err: &reqwest::Error) -> bool {
    if err.is_timeout() {
        return true;
    }
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        if let Some(io) = inner.downcast_ref::<io::Error>()
            && io.kind() == io::ErrorKind::TimedOut
        {
            return true;
        }
        source = inner.source();
    }
    false
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, locator: &str) -> Result<Fetched> {
        let url = self.url(locator)?;

        let mut attempt = 0;
        let response = loop {
            attempt += 1;
            match self.request(&url).await {
                Ok(response) => break response,
                Err(Error::TimeoutError(_)) if attempt < self.max_attempts => {
                    warn!("Request to {} timed out (attempt {}), retrying", url, attempt);
                }
                Err(Error::TimeoutError(_)) => {
                    return Err(Error::NotFoundError(format!(
                        "{url} timed out after {attempt} attempts"
                    )));
                }
                Err(e) => return Err(e),
            }
        };

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let content_length = response.content_length();

        debug!("Fetching {} ({:?} bytes)", url, content_length);

        let stream = response.bytes_stream().map_err(io::Error::other);
        Ok(Fetched {
            body: Box::pin(StreamReader::new(stream)),
            content_type,
            content_length,
        })
    }

    async fn exists(&self, locator: &str) -> bool {
        let Ok(url) = self.url(locator) else {
            return false;
        };

        match self.client.head(url.clone()).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("Existence check for {} failed: {}", url, e);
                false
            }
        }
    }

    fn is_remote(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        self.base_url.as_str()
    }
}

/// Repository tree on the local filesystem
pub struct LocalTransport {
    root: PathBuf,
    name: String,
}

impl LocalTransport {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        let name = root.display().to_string();
        Self { root, name }
    }

    /// Filesystem path of a locator
    fn resolve(&self, locator: &str) -> Result<PathBuf> {
        Ok(self.root.join(sanitize_path(locator)?))
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn fetch(&self, locator: &str) -> Result<Fetched> {
        let path = self.resolve(locator)?;

        let file = tokio::fs::File::open(&path).await.map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Error::NotFoundError(path.display().to_string())
            } else {
                Error::DownloadError(format!("Failed to open {}: {e}", path.display()))
            }
        })?;
        let content_length = file.metadata().await.ok().map(|m| m.len());

        Ok(Fetched {
            body: Box::pin(file),
            content_type: None,
            content_length,
        })
    }

    async fn exists(&self, locator: &str) -> bool {
        match self.resolve(locator) {
            Ok(path) => tokio::fs::try_exists(&path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    fn is_remote(&self) -> bool {
        false
    }

    fn name(&self) -> &str {
        &self.name
    }
}
