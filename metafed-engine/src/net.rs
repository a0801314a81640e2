//! Throttled, cached HTTP GET client for network-backed sources
//!
//! Requests go through a `governor` rate limiter (one direct limiter per
//! client) and successful response bodies are kept in a small LRU cache keyed
//! by URL. Cache hits are not rate limited.

use std::num::NonZeroU32;
use std::sync::Mutex;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use indexmap::IndexMap;
use metafed_common::config::NetConfig;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::SourceError;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// URL → body cache with least-recently-used eviction
#[derive(Debug)]
struct ResponseCache {
    capacity: usize,
    entries: IndexMap<String, String>,
}

impl ResponseCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: IndexMap::new(),
        }
    }

    fn get(&mut self, url: &str) -> Option<String> {
        let body = self.entries.shift_remove(url)?;
        self.entries.insert(url.to_string(), body.clone());
        Some(body)
    }

    fn insert(&mut self, url: &str, body: String) {
        if self.capacity == 0 {
            return;
        }
        self.entries.shift_remove(url);
        self.entries.insert(url.to_string(), body);
        while self.entries.len() > self.capacity {
            self.entries.shift_remove_index(0);
        }
    }
}

/// Rate-limited GET client
pub struct WebClient {
    client: reqwest::Client,
    rate_limiter: DirectLimiter,
    cache: Mutex<ResponseCache>,
}

impl WebClient {
    /// Build a client from `[net]` settings
    pub fn new(config: &NetConfig) -> Result<Self, SourceError> {
        let per_second = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SourceError::Network(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            rate_limiter: RateLimiter::direct(Quota::per_second(per_second)),
            cache: Mutex::new(ResponseCache::new(config.cache_capacity)),
        })
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, ResponseCache> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// GET `url` and return the body as text
    ///
    /// # Errors
    /// - `NotFound` for HTTP 404
    /// - `Api` for other non-success statuses
    /// - `Network` when the request itself fails
    pub async fn get(&self, url: &str) -> Result<String, SourceError> {
        if let Some(body) = self.cache().get(url) {
            debug!(url, "Web cache hit");
            return Ok(body);
        }

        self.rate_limiter.until_ready().await;
        debug!(url, "GET");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| SourceError::Network(format!("Request to {} failed: {}", url, e)))?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Err(SourceError::NotFound(url.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Api(format!("{} returned {}: {}", url, status, body)));
        }

        let body = response
            .text()
            .await
            .map_err(|e| SourceError::Network(format!("Failed to read body from {}: {}", url, e)))?;
        self.cache().insert(url, body.clone());
        Ok(body)
    }

    /// GET `url` and deserialize the JSON body
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, SourceError> {
        let body = self.get(url).await?;
        serde_json::from_str(&body)
            .map_err(|e| SourceError::Parse(format!("Invalid JSON from {}: {}", url, e)))
    }

    /// Number of cached responses
    pub fn cached(&self) -> usize {
        self.cache().entries.len()
    }
}
