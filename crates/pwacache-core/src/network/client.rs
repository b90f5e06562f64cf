//! reqwest-backed [`Network`] implementation.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client};
use tracing::{debug, warn};

use super::{Destination, Network, NetworkError, ResourceRequest, ResourceResponse, ResponseSource};

// ============================================================================
// Constants
// ============================================================================

/// HTTP request timeout in seconds.
/// The fetch engine applies its own much shorter wait for network-first
/// classes; this only bounds requests nobody is waiting on any more.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// HTTP network access.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpNetwork {
    client: Client,
}

impl HttpNetwork {
    pub fn new() -> Result<Self, NetworkError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self { client })
    }

    fn accept_for(destination: Destination) -> &'static str {
        match destination {
            Destination::Document => "text/html,application/xhtml+xml",
            Destination::Script | Destination::Worker => "text/javascript, */*;q=0.1",
            Destination::Style => "text/css,*/*;q=0.1",
            Destination::Image => "image/avif,image/webp,image/*,*/*;q=0.8",
            Destination::Empty => "*/*",
        }
    }

    /// Returns Ok(Some(response)) for success, Ok(None) for rate limit (should retry),
    /// or Err for other errors.
    async fn check_response_for_retry(
        response: reqwest::Response,
    ) -> Result<Option<reqwest::Response>, NetworkError> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Ok(None)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(NetworkError::from_status(status, &body))
        }
    }

    fn collect_headers(headers: &header::HeaderMap) -> BTreeMap<String, String> {
        headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect()
    }
}

#[async_trait]
impl Network for HttpNetwork {
    async fn fetch(&self, request: &ResourceRequest) -> Result<ResourceResponse, NetworkError> {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let mut builder = self
                .client
                .get(request.url.clone())
                .header(header::ACCEPT, Self::accept_for(request.destination));
            if request.destination == Destination::Worker {
                // Worker scripts are always checked against the origin.
                builder = builder.header(header::CACHE_CONTROL, "no-cache");
            }

            let response = builder.send().await.map_err(NetworkError::from_send)?;

            match Self::check_response_for_retry(response).await? {
                Some(response) => {
                    let status = response.status().as_u16();
                    let headers = Self::collect_headers(response.headers());
                    let body = response.bytes().await?.to_vec();
                    debug!(url = %request.url, status, bytes = body.len(), "Network response");
                    return Ok(ResourceResponse {
                        url: request.url.to_string(),
                        status,
                        headers,
                        body,
                        source: ResponseSource::Network,
                    });
                }
                None => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(NetworkError::RateLimited);
                    }
                    warn!(url = %request.url, retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2; // Exponential backoff
                }
            }
        }
    }
}
