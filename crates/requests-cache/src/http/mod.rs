//! Coalescing of outbound HTTP requests.
//!
//! [`HttpCache`] puts a [`CoalescingCache`] in front of a [`reqwest::Client`]. Concurrent
//! identical requests share a single upstream request, and the buffered response is served to
//! further identical requests until it expires.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName};
use reqwest::{Request, StatusCode};
use thiserror::Error;
use url::Url;

use crate::caching::{CacheConfig, CacheEntry, CacheError, CoalescingCache};

mod client;
mod request_key;

pub use client::{HttpConfig, create_client};
pub use request_key::{RequestKey, RequestKeyBuilder};

/// A fully buffered response.
///
/// Responses with any status code are cached, it is up to the caller to interpret them.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// The final URL of the response, after following redirects.
    pub url: Url,
    pub body: Bytes,
}

impl CachedResponse {
    async fn from_response(response: reqwest::Response) -> Result<Self, reqwest::Error> {
        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = response.bytes().await?;

        Ok(Self {
            status,
            headers,
            url,
            body,
        })
    }

    /// Returns the body as text, replacing invalid UTF-8.
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// An error executing an outbound request.
///
/// These are cached and shared like responses, so they only carry the rendered error message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HttpError {
    #[error("request timed out")]
    Timeout,
    #[error("failed to connect: {0}")]
    Connect(String),
    #[error("failed to read response body: {0}")]
    Body(String),
    #[error("request failed: {0}")]
    Request(String),
}

impl From<reqwest::Error> for HttpError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout;
        }
        let is_connect = err.is_connect();
        let is_body = err.is_body() || err.is_decode();
        let message = err.without_url().to_string();

        if is_connect {
            Self::Connect(message)
        } else if is_body {
            Self::Body(message)
        } else {
            Self::Request(message)
        }
    }
}

/// An HTTP client that coalesces identical concurrent requests and caches their responses.
#[derive(Debug, Clone)]
pub struct HttpCache {
    client: reqwest::Client,
    cache: CoalescingCache<RequestKey, CachedResponse, HttpError>,
    key_headers: Arc<[HeaderName]>,
}

impl HttpCache {
    pub fn new(
        client: reqwest::Client,
        cache_config: CacheConfig,
        key_headers: Vec<HeaderName>,
    ) -> Self {
        Self {
            client,
            cache: CoalescingCache::new(cache_config),
            key_headers: key_headers.into(),
        }
    }

    /// Creates the client and cache from their configuration.
    pub fn from_config(
        cache_config: CacheConfig,
        http_config: &HttpConfig,
    ) -> anyhow::Result<Self> {
        let client = create_client(http_config)?;
        let key_headers = http_config.key_header_names()?;
        Ok(Self::new(client, cache_config, key_headers))
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn cache(&self) -> &CoalescingCache<RequestKey, CachedResponse, HttpError> {
        &self.cache
    }

    /// Returns the key that `request` is cached under.
    pub fn key(&self, request: &Request) -> Option<RequestKey> {
        RequestKey::from_request(request, &self.key_headers)
    }

    /// Executes `request`, unless an identical request is in flight or was recently completed.
    ///
    /// Requests with a streaming body cannot be keyed and are always executed.
    pub async fn execute(&self, request: Request) -> CacheEntry<CachedResponse, HttpError> {
        let Some(key) = self.key(&request) else {
            return self.bypass(request).await;
        };
        let client = self.client.clone();
        self.cache
            .compute_memoized(key, move || fetch(client, request))
            .await
    }

    /// Like [`execute`](Self::execute), but gives up waiting after `timeout`.
    pub async fn execute_timeout(
        &self,
        request: Request,
        timeout: Duration,
    ) -> CacheEntry<CachedResponse, HttpError> {
        let Some(key) = self.key(&request) else {
            return match tokio::time::timeout(timeout, self.bypass(request)).await {
                Ok(result) => result,
                Err(_) => Err(CacheError::WaitTimeout(timeout)),
            };
        };
        let client = self.client.clone();
        self.cache
            .compute_memoized_timeout(key, timeout, move || fetch(client, request))
            .await
    }

    async fn bypass(&self, request: Request) -> CacheEntry<CachedResponse, HttpError> {
        tracing::debug!(url = %request.url(), "Streaming request body, bypassing cache");
        fetch(self.client.clone(), request)
            .await
            .map_err(CacheError::Executor)
    }
}

async fn fetch(client: reqwest::Client, request: Request) -> Result<CachedResponse, HttpError> {
    tracing::trace!(method = %request.method(), url = %request.url(), "Fetching");
    let response = client.execute(request).await?;
    let response = CachedResponse::from_response(response).await?;
    tracing::trace!(status = %response.status, url = %response.url, "Fetched");
    Ok(response)
}
