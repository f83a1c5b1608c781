/// NodeClient (spec §4.1): async wrapper over the node's REST API.
///
/// Grounded on the teacher's `monitor.rs`, which builds a blocking RPC client
/// from `get_global_config()` and maps raw JSON responses into typed structs.
/// Here the client is async (`reqwest::Client`, no `.blocking`), the wire
/// format is the node's REST JSON (not Bitcoin-style JSON-RPC), and retries
/// add exponential backoff with jitter, which the teacher's single-shot RPC
/// calls did not need.
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use reqwest::{Client, StatusCode};
use tracing::{debug, warn};

use crate::cache::NodeCache;
use crate::metrics;
use crate::types::{IndexerError, NodeBlockHeader, NodeFullBlock, NodeInfo, Result};

/// Retry budget for a transient failure before giving up with
/// `IndexerError::Unavailable` (spec §4.1: "base 200 ms, cap 5 s, max 6
/// attempts"). `MAX_RETRIES` counts retries after the first attempt, so the
/// total attempts made is `MAX_RETRIES + 1`.
const MAX_RETRIES: u32 = 5;
const BASE_BACKOFF_MS: u64 = 200;
const MAX_BACKOFF_MS: u64 = 5_000;

pub struct NodeClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    cache: Option<Arc<NodeCache>>,
}

impl NodeClient {
    pub fn new(base_url: String, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IndexerError::BadRequest(format!("failed to build http client: {e}")))?;

        Ok(Self {
            http,
            base_url,
            api_key,
            cache: None,
        })
    }

    pub fn with_cache(mut self, cache: Arc<NodeCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn apply_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("api_key", key),
            None => builder,
        }
    }

    /// Issue one GET request and classify the outcome per spec §7: 5xx/timeout
    /// → `Unavailable` (retryable), 4xx → `NotFound`/`BadRequest` (not
    /// retried), 2xx → deserialize into `T`.
    async fn get_once<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let timer = metrics::Timer::new();
        let request = self.apply_auth(self.http.get(self.url(path)));
        let response = request.send().await.map_err(|e| {
            metrics::record_node_error("transport");
            debug!(error = %e, path, "node request failed at transport level");
            IndexerError::Unavailable
        })?;

        metrics::record_node_request_duration(path, timer.elapsed_secs());

        match response.status() {
            status if status.is_success() => response.json::<T>().await.map_err(|e| {
                metrics::record_node_error("decode");
                IndexerError::BadRequest(format!("failed to decode response from {path}: {e}"))
            }),
            StatusCode::NOT_FOUND => {
                metrics::record_node_error("not_found");
                Err(IndexerError::NotFound)
            }
            status if status.is_client_error() => {
                metrics::record_node_error("bad_request");
                Err(IndexerError::BadRequest(format!(
                    "node returned {status} for {path}"
                )))
            }
            status => {
                metrics::record_node_error("unavailable");
                warn!(%status, path, "node returned server error");
                Err(IndexerError::Unavailable)
            }
        }
    }

    /// Retry `get_once` with exponential backoff and jitter on
    /// `IndexerError::Unavailable`. Any other error is returned immediately
    /// (spec §7: only transient failures are retried).
    async fn get_with_retry<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let mut attempt = 0;
        loop {
            match self.get_once(path).await {
                Ok(value) => return Ok(value),
                Err(IndexerError::Unavailable) if attempt < MAX_RETRIES => {
                    let backoff_ms = (BASE_BACKOFF_MS * 2u64.pow(attempt)).min(MAX_BACKOFF_MS);
                    let jitter_ms = rand::thread_rng().gen_range(0..=backoff_ms / 2);
                    let delay = Duration::from_millis(backoff_ms + jitter_ms);
                    warn!(attempt, ?delay, path, "retrying node request after transient failure");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// `GET /info` — current node chain tip (spec §4.1, §4.8).
    pub async fn info(&self) -> Result<NodeInfo> {
        self.get_with_retry("/info").await
    }

    /// `GET /blocks/at/{height}` — block ids at a height (used for lineage
    /// walkback during reorg detection, spec §4.4).
    pub async fn block_ids_at(&self, height: u32) -> Result<Vec<String>> {
        self.get_with_retry(&format!("/blocks/at/{height}")).await
    }

    /// `GET /blocks/{id}/header` — lightweight header-only fetch, used when
    /// only `parentId`/`height` are needed (e.g. lineage walkback).
    pub async fn header(&self, block_id: &str) -> Result<NodeBlockHeader> {
        if let Some(cache) = &self.cache {
            if let Some(cached) = cache.get_header(block_id).await {
                metrics::record_cache_hit("header");
                return Ok((*cached).clone());
            }
            metrics::record_cache_miss("header");
        }

        let header: NodeBlockHeader = self
            .get_with_retry(&format!("/blocks/{block_id}/header"))
            .await?;

        if let Some(cache) = &self.cache {
            cache
                .put_header(block_id.to_string(), Arc::new(header.clone()))
                .await;
        }

        Ok(header)
    }

    /// `GET /blocks/{id}` — full block with transactions (spec §4.1, §4.3).
    pub async fn block(&self, block_id: &str) -> Result<Arc<NodeFullBlock>> {
        if let Some(cache) = &self.cache {
            if let Some(cached) = cache.get_block(block_id).await {
                metrics::record_cache_hit("block");
                return Ok(cached);
            }
            metrics::record_cache_miss("block");
        }

        let block: NodeFullBlock = self.get_with_retry(&format!("/blocks/{block_id}")).await?;
        let block = Arc::new(block);

        if let Some(cache) = &self.cache {
            cache.put_block(block_id.to_string(), block.clone()).await;
        }

        Ok(block)
    }

    /// Resolve a height to its main-chain block id, then fetch the full block.
    /// Used by WorkPool for the initial sync pass (spec §4.5).
    pub async fn block_at_height(&self, height: u32) -> Result<Arc<NodeFullBlock>> {
        let ids = self.block_ids_at(height).await?;
        let block_id = ids.into_iter().next().ok_or(IndexerError::NotFound)?;
        self.block(&block_id).await
    }

    /// Invalidate any cached entries for `block_id`. Called by the
    /// ReorgDetector when an id it previously treated as stable is replaced.
    pub async fn invalidate(&self, block_id: &str) {
        if let Some(cache) = &self.cache {
            cache.invalidate(block_id).await;
        }
    }
}
