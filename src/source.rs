//! Turns a request item's declared source into raw bytes.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::error::ItemError;
use crate::schema::{DocumentKind, ItemSource, RequestItem, ResolvedPayload};

/// Display name used when no file name is available.
pub const UNKNOWN_NAME: &str = "unknown";

/// Remote byte retrieval.
#[async_trait::async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// Plain HTTP GET. Non-2xx responses are errors; no retries.
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let bytes = self
            .client
            .get(url)
            .send()
            .await
            .context("Request failed")?
            .error_for_status()
            .context("Server returned an error")?
            .bytes()
            .await
            .context("Failed to read response body")?;
        Ok(bytes.to_vec())
    }
}

pub struct SourceResolver {
    fetcher: Arc<dyn Fetcher>,
    /// Caps how many downloads (and their bodies) are in flight at once.
    fetch_permits: Semaphore,
}

impl SourceResolver {
    pub fn new(fetcher: Arc<dyn Fetcher>, max_concurrent_fetches: usize) -> Self {
        Self {
            fetcher,
            fetch_permits: Semaphore::new(max_concurrent_fetches.max(1)),
        }
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, ItemError> {
        let _permit = self.fetch_permits.acquire().await.map_err(|_| {
            ItemError::FetchFailed {
                reference: url.to_string(),
                cause: "fetch pool is closed".to_string(),
            }
        })?;
        self.fetcher
            .fetch(url)
            .await
            .map_err(|e| ItemError::fetch_failed(url, &e))
    }

    /// Validate the item's kind, then fetch or decode its bytes.
    ///
    /// An invalid kind is rejected before any fetch or decode work.
    pub async fn resolve(&self, item: &RequestItem) -> Result<ResolvedPayload, ItemError> {
        let kind = DocumentKind::parse(&item.kind)?;

        match item.source().ok_or(ItemError::NoSourceProvided)? {
            ItemSource::Remote(url) => {
                info!("Downloading {} from {}", kind.as_str(), url);
                let data = self.fetch(url).await?;
                debug!("Downloaded {} bytes from {}", data.len(), url);
                Ok(ResolvedPayload {
                    kind,
                    data,
                    display_name: display_name(url),
                })
            }
            ItemSource::Inline(encoded) => {
                let data = decode_inline(encoded)?;
                debug!("Decoded {} bytes of inline {} data", data.len(), kind.as_str());
                Ok(ResolvedPayload {
                    kind,
                    data,
                    display_name: UNKNOWN_NAME.to_string(),
                })
            }
        }
    }
}

/// Decode standard base64, tolerating surrounding whitespace and a `data:` URL prefix.
pub fn decode_inline(encoded: &str) -> Result<Vec<u8>, ItemError> {
    let encoded = encoded.trim();
    let payload = match encoded.strip_prefix("data:") {
        Some(rest) => rest
            .split_once(";base64,")
            .map(|(_, data)| data)
            .ok_or_else(|| ItemError::DecodeFailed("data URL is not base64 encoded".to_string()))?,
        None => encoded,
    };

    let compact: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    BASE64
        .decode(compact)
        .map_err(|e| ItemError::DecodeFailed(e.to_string()))
}

/// Last path segment of a URL, ignoring query and fragment.
pub fn display_name(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty())
        .unwrap_or(UNKNOWN_NAME)
        .to_string()
}
