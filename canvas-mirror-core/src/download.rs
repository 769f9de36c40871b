//! Canvas REST client: paginated listings, single JSON documents and file downloads.
//!
//! One [`reqwest::Client`] is shared for the whole run so connections are
//! pooled. Transient failures (connect errors and status 429/500/502/503/504)
//! are retried with exponential backoff before surfacing as a [`SourceError`].

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, LINK};
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use url::Url;

use crate::config::{CanvasConfig, PerformanceConfig};
use crate::contract::{ListingPage, SourceApi};
use crate::error::SourceError;

const RETRY_STATUSES: &[u16] = &[429, 500, 502, 503, 504];

/// Append `per_page` unless the query already has that key (next links do).
pub fn with_per_page(url: &str, per_page: u32) -> String {
    let Ok(mut parsed) = Url::parse(url) else {
        return url.to_string();
    };
    if parsed.query_pairs().any(|(key, _)| key == "per_page") {
        return url.to_string();
    }
    parsed
        .query_pairs_mut()
        .append_pair("per_page", &per_page.to_string());
    parsed.into()
}

/// Extract the `rel="next"` target from an RFC 5988 `Link` header value.
pub fn next_link(header: &str) -> Option<String> {
    header.split(',').find_map(|part| {
        let mut pieces = part.split(';');
        let target = pieces.next()?.trim();
        let is_next = pieces.any(|param| {
            let param = param.trim();
            param == "rel=\"next\"" || param == "rel=next"
        });
        if !is_next {
            return None;
        }
        let target = target.strip_prefix('<')?.strip_suffix('>')?;
        Url::parse(target).ok().map(String::from)
    })
}

fn next_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(LINK)
        .and_then(|v| v.to_str().ok())
        .and_then(next_link)
}

pub struct CanvasClient {
    client: Client,
    api_key: String,
    performance: PerformanceConfig,
}

impl CanvasClient {
    pub fn new(canvas: &CanvasConfig, performance: &PerformanceConfig) -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(performance.request_timeout())
            .pool_max_idle_per_host(performance.pool_size)
            .build()
            .map_err(|e| SourceError::Transport {
                url: canvas.base_url().to_string(),
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            api_key: canvas.api_key.clone(),
            performance: performance.clone(),
        })
    }

    /// GET `url`, retrying transient failures. Returns the first successful response.
    async fn get(&self, url: &str) -> Result<Response, SourceError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let retries_left = attempt <= self.performance.max_retries;
            match self.client.get(url).bearer_auth(&self.api_key).send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    if retries_left && is_retryable(status) {
                        let delay = self.performance.backoff_delay(attempt);
                        warn!(url, status = status.as_u16(), attempt, ?delay, "Canvas request failed, retrying");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(SourceError::Status {
                        url: url.to_string(),
                        status: status.as_u16(),
                        attempts: attempt,
                    });
                }
                Err(e) if retries_left && (e.is_connect() || e.is_timeout()) => {
                    let delay = self.performance.backoff_delay(attempt);
                    warn!(url, error = %e, attempt, ?delay, "Canvas request errored, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(SourceError::Transport {
                        url: url.to_string(),
                        message: e.to_string(),
                    })
                }
            }
        }
    }
}

#[async_trait]
impl SourceApi for CanvasClient {
    async fn fetch_page(&self, url: &str) -> Result<ListingPage, SourceError> {
        let url = with_per_page(url, self.performance.per_page);
        let response = self.get(&url).await?;
        let next = next_from_headers(response.headers());
        let body: Value = response.json().await.map_err(|e| SourceError::Decode {
            url: url.clone(),
            message: e.to_string(),
        })?;
        let items = match body {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => vec![other],
        };
        debug!(url = %url, items = items.len(), has_next = next.is_some(), "Fetched listing page");
        Ok((items, next))
    }

    async fn get_json(&self, url: &str) -> Result<Value, SourceError> {
        let response = self.get(url).await?;
        response.json().await.map_err(|e| SourceError::Decode {
            url: url.to_string(),
            message: e.to_string(),
        })
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<u64, SourceError> {
        let response = self.get(url).await?;
        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| SourceError::Transport {
                url: url.to_string(),
                message: e.to_string(),
            })?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        debug!(url, bytes = written, "Downloaded file");
        Ok(written)
    }
}

/// Follow next links from `url` until the listing is exhausted.
///
/// A page that fails ends the listing early: what was collected so far is
/// returned and the failure is logged.
pub async fn collect_all<A>(api: &A, url: &str) -> Vec<Value>
where
    A: SourceApi + ?Sized,
{
    let mut items = Vec::new();
    let mut next = Some(url.to_string());
    while let Some(current) = next.take() {
        match api.fetch_page(&current).await {
            Ok((page, following)) => {
                items.extend(page);
                next = following;
            }
            Err(e) => {
                warn!(url = %current, error = %e, "Listing stopped early");
                break;
            }
        }
    }
    items
}

/// Whether a status is worth retrying, for Canvas and Drive alike.
pub(crate) fn is_retryable(status: StatusCode) -> bool {
    RETRY_STATUSES.contains(&status.as_u16())
}
