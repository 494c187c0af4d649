//! HTTP client used for every node-to-node call of the storage layer.
//!
//! Forwarded commands, replication and partition transfers all go through
//! [`PeerClient`], which adds per-request timeouts and a bounded retry with
//! exponential backoff and jitter for idempotent calls.

use anyhow::{Result, anyhow};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::net::SocketAddr;
use std::time::Duration;

const INITIAL_BACKOFF_MS: u64 = 150;
const MAX_BACKOFF_MS: u64 = 1200;

#[derive(Clone)]
pub struct PeerClient {
    http_client: reqwest::Client,
}

impl Default for PeerClient {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerClient {
    pub fn new() -> Self {
        Self {
            http_client: reqwest::Client::new(),
        }
    }

    pub fn url(addr: SocketAddr, path: &str) -> String {
        format!("http://{}{}", addr, path)
    }

    /// POSTs `payload` and decodes a JSON reply. A non-success status is an error.
    pub async fn post_json<T, R>(
        &self,
        url: String,
        payload: &T,
        timeout: Duration,
        attempts: usize,
    ) -> Result<R>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let response = self.post_with_retry(url, payload, timeout, attempts).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("peer answered {}", status));
        }
        Ok(response.json::<R>().await?)
    }

    /// GETs `url` and decodes a JSON reply. A non-success status is an error.
    pub async fn get_json<R: DeserializeOwned>(
        &self,
        url: String,
        timeout: Duration,
        attempts: usize,
    ) -> Result<R> {
        let response = self.get_with_retry(url, timeout, attempts).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("peer answered {}", status));
        }
        Ok(response.json::<R>().await?)
    }

    async fn post_with_retry<T: Serialize>(
        &self,
        url: String,
        payload: &T,
        timeout: Duration,
        attempts: usize,
    ) -> Result<reqwest::Response> {
        self.send_with_retry(attempts, || {
            self.http_client
                .post(url.clone())
                .json(payload)
                .timeout(timeout)
        })
        .await
    }

    async fn get_with_retry(
        &self,
        url: String,
        timeout: Duration,
        attempts: usize,
    ) -> Result<reqwest::Response> {
        self.send_with_retry(attempts, || self.http_client.get(url.clone()).timeout(timeout))
            .await
    }

    /// Sends the request built by `build` until it gets any HTTP answer,
    /// sleeping with doubling backoff between transport failures.
    async fn send_with_retry<F>(&self, attempts: usize, build: F) -> Result<reqwest::Response>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut delay_ms = INITIAL_BACKOFF_MS;
        let attempts = attempts.max(1);

        for attempt in 0..attempts {
            match build().send().await {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    if attempt + 1 == attempts {
                        return Err(anyhow!(e));
                    }
                    // Simple jitter to prevent thundering herd
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(MAX_BACKOFF_MS);
                }
            }
        }

        Err(anyhow!("Retry attempts exhausted"))
    }
}
