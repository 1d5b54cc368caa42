use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info};
use url::Url;

use super::errors::{CheckerResult, FetchError};
use super::types::CrlSourceId;

/// Default maximum CRL size (10 MB)
pub const DEFAULT_MAX_CRL_SIZE: usize = 10 * 1024 * 1024;

/// Retrieves raw CRL bytes for a source.
///
/// Implementations are stateless with respect to CRL content: they never
/// cache, and every call is a single attempt bounded by the fetcher's own
/// timeout.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CrlFetcher: Send + Sync {
    async fn fetch(&self, source: &CrlSourceId) -> Result<Vec<u8>, FetchError>;
}

/// Fetches CRLs from HTTP(S) URLs, `file:` URLs and plain filesystem paths.
#[derive(Debug, Clone)]
pub struct ResourceCrlFetcher {
    client: Client,
    request_timeout: Duration,
    max_size: usize,
}

impl ResourceCrlFetcher {
    /// Returns an error if the HTTP client cannot be initialized
    pub fn new(request_timeout: Duration) -> CheckerResult<Self> {
        Self::with_max_size(request_timeout, DEFAULT_MAX_CRL_SIZE)
    }

    /// Returns an error if the HTTP client cannot be initialized
    pub fn with_max_size(request_timeout: Duration, max_size: usize) -> CheckerResult<Self> {
        let client = Client::builder().timeout(request_timeout).build()?;

        Ok(Self {
            client,
            request_timeout,
            max_size,
        })
    }

    async fn fetch_http(&self, url: &str, deadline: Instant) -> Result<Vec<u8>, FetchError> {
        let mut response = match timeout_at(deadline, self.client.get(url).send()).await {
            Ok(result) => result.map_err(|e| map_http_error(url, e))?,
            Err(_) => return Err(FetchError::Timeout(url.to_string())),
        };

        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Err(FetchError::NotFound(format!("HTTP {status} from {url}")));
        }
        if !status.is_success() {
            return Err(FetchError::Transport(format!("HTTP {status} from {url}")));
        }

        if let Some(content_length) = response.content_length()
            && content_length > self.max_size as u64
        {
            return Err(self.too_large(url, content_length));
        }

        let max_size = self.max_size;
        let read_body = async {
            let mut body = Vec::new();
            while let Some(chunk) = response.chunk().await.map_err(|e| map_http_error(url, e))? {
                if body.len() + chunk.len() > max_size {
                    return Err(self.too_large(url, (body.len() + chunk.len()) as u64));
                }
                body.extend_from_slice(&chunk);
            }
            Ok(body)
        };

        match timeout_at(deadline, read_body).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout(url.to_string())),
        }
    }

    async fn fetch_file(
        &self,
        source: &CrlSourceId,
        path: PathBuf,
        deadline: Instant,
    ) -> Result<Vec<u8>, FetchError> {
        let read_file = async {
            let metadata = tokio::fs::metadata(&path)
                .await
                .map_err(|e| map_io_error(source, e))?;
            if metadata.len() > self.max_size as u64 {
                return Err(self.too_large(source.as_str(), metadata.len()));
            }
            tokio::fs::read(&path)
                .await
                .map_err(|e| map_io_error(source, e))
        };

        match timeout_at(deadline, read_file).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout(source.to_string())),
        }
    }

    fn too_large(&self, source: &str, size: u64) -> FetchError {
        FetchError::Transport(format!(
            "CRL from {source} is {size} bytes, exceeding the {} byte limit",
            self.max_size
        ))
    }
}

#[async_trait]
impl CrlFetcher for ResourceCrlFetcher {
    async fn fetch(&self, source: &CrlSourceId) -> Result<Vec<u8>, FetchError> {
        let deadline = Instant::now() + self.request_timeout;

        let data = match source.scheme().as_deref() {
            Some("http" | "https") => {
                info!("Fetching CRL from: {}", source);
                self.fetch_http(source.as_str(), deadline).await?
            }
            Some("file") => {
                let path = Url::parse(source.as_str())
                    .ok()
                    .and_then(|url| url.to_file_path().ok())
                    .ok_or_else(|| {
                        FetchError::Transport(format!("invalid file URL: {source}"))
                    })?;
                debug!("Reading CRL from file: {}", path.display());
                self.fetch_file(source, path, deadline).await?
            }
            None => {
                debug!("Reading CRL from file: {}", source);
                self.fetch_file(source, PathBuf::from(source.as_str()), deadline)
                    .await?
            }
            Some(scheme) => {
                return Err(FetchError::Transport(format!(
                    "unsupported CRL source scheme '{scheme}': {source}"
                )));
            }
        };

        debug!("Fetched {} bytes from {}", data.len(), source);
        Ok(data)
    }
}

fn map_http_error(url: &str, error: reqwest::Error) -> FetchError {
    if error.is_timeout() {
        FetchError::Timeout(url.to_string())
    } else {
        FetchError::Transport(format!("GET {url} failed: {error}"))
    }
}

fn map_io_error(source: &CrlSourceId, error: std::io::Error) -> FetchError {
    match error.kind() {
        ErrorKind::NotFound => FetchError::NotFound(source.to_string()),
        _ => FetchError::Transport(format!("reading {source} failed: {error}")),
    }
}
