use std::time::Duration;
use reqwest::blocking::Client;
use crate::collab::ArtifactFetcher;
use crate::error::{EngineError, Result};

/// User agent sent with every download.
pub const USER_AGENT: &str = concat!("casket/", env!("CARGO_PKG_VERSION"));

/// Default timeout for a whole download.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Fetches artifacts over HTTP(S) with a blocking client.
///
/// `file://` URLs are read from the local disk, which is handy for mirrors
/// and for testing manifests before publishing them.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Builds a fetcher whose requests give up after `timeout`.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::FetchFailed {
                url: String::new(),
                reason: format!("could not build HTTP client: {e}"),
            })?;
        Ok(Self { client })
    }

    fn fetch_http(&self, url: &str) -> Result<Vec<u8>> {
        let failed = |reason: String| EngineError::FetchFailed {
            url: url.to_string(),
            reason,
        };
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| failed(describe(&e)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(failed(format!("server responded with {status}")));
        }
        let bytes = response.bytes().map_err(|e| failed(describe(&e)))?;
        tracing::debug!(url, bytes = bytes.len(), "downloaded artifact");
        Ok(bytes.to_vec())
    }
}

fn describe(error: &reqwest::Error) -> String {
    if error.is_timeout() {
        format!("timed out: {error}")
    } else {
        error.to_string()
    }
}

impl ArtifactFetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        if let Some(path) = url.strip_prefix("file://") {
            return std::fs::read(path).map_err(|e| EngineError::FetchFailed {
                url: url.to_string(),
                reason: e.to_string(),
            });
        }
        if url.starts_with("https://") || url.starts_with("http://") {
            return self.fetch_http(url);
        }
        Err(EngineError::FetchFailed {
            url: url.to_string(),
            reason: "unsupported URL scheme".to_string(),
        })
    }
}
