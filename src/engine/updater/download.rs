//! HTTP Download Manager
//!
//! Fetches asset bodies over HTTP. The [`AssetFetcher`] seam lets the
//! reconciler run against any transport.

use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use std::collections::BTreeMap;
use std::time::Duration;

/// Download error types
#[derive(Debug)]
pub enum DownloadError {
    Network(String),
    InvalidResponse(String),
}

impl From<reqwest::Error> for DownloadError {
    fn from(e: reqwest::Error) -> Self {
        Self::Network(e.to_string())
    }
}

impl std::fmt::Display for DownloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Network(e) => write!(f, "Network error: {}", e),
            Self::InvalidResponse(e) => write!(f, "Invalid response: {}", e),
        }
    }
}

impl std::error::Error for DownloadError {}

/// Source of remote asset bytes
pub trait AssetFetcher: Send + Sync {
    fn fetch<'a>(
        &'a self,
        url: &'a str,
        headers: &'a BTreeMap<String, String>,
    ) -> BoxFuture<'a, Result<Vec<u8>, DownloadError>>;
}

/// reqwest-backed fetcher
pub struct Downloader {
    client: reqwest::Client,
}

impl Downloader {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("relaunch/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for Downloader {
    fn default() -> Self {
        Self::new()
    }
}

impl AssetFetcher for Downloader {
    fn fetch<'a>(
        &'a self,
        url: &'a str,
        headers: &'a BTreeMap<String, String>,
    ) -> BoxFuture<'a, Result<Vec<u8>, DownloadError>> {
        Box::pin(async move {
            let mut request = self.client.get(url);
            for (name, value) in headers {
                request = request.header(name.as_str(), value.as_str());
            }

            let response = request.send().await?;
            if !response.status().is_success() {
                return Err(DownloadError::InvalidResponse(format!(
                    "HTTP {}",
                    response.status()
                )));
            }

            let mut body = Vec::new();
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                body.extend_from_slice(&chunk?);
            }

            tracing::debug!(url, bytes = body.len(), "downloaded asset");
            Ok(body)
        })
    }
}
