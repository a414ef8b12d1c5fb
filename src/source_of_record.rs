use crate::error::{CacheError, Result};
use crate::key::CacheKey;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// Where resources come from when neither tier has them.
///
/// Implementations should honour `timeout`; the fetch coordinator enforces it as well, so a
/// transport that ignores it still cannot hold a fetch slot past the deadline.
#[async_trait]
pub trait SourceOfRecord: Send + Sync {
    async fn retrieve(&self, key: &CacheKey, timeout: Duration) -> Result<Bytes>;
}

/// Fetches keys as URLs over HTTP(S).
#[derive(Debug, Clone, Default)]
pub struct HttpSourceOfRecord {
    client: reqwest::Client,
}

impl HttpSourceOfRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        HttpSourceOfRecord { client }
    }
}

#[async_trait]
impl SourceOfRecord for HttpSourceOfRecord {
    async fn retrieve(&self, key: &CacheKey, timeout: Duration) -> Result<Bytes> {
        let response = self
            .client
            .get(key.as_str())
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, timeout))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::GONE {
            return Err(CacheError::NotFound);
        }
        if !status.is_success() {
            return Err(CacheError::Network(format!("unexpected status {status}")));
        }

        response
            .bytes()
            .await
            .map_err(|e| map_reqwest_error(e, timeout))
    }
}

fn map_reqwest_error(err: reqwest::Error, timeout: Duration) -> CacheError {
    if err.is_timeout() {
        CacheError::NetworkTimeout(timeout)
    } else if err.is_decode() {
        CacheError::Decode(err.to_string())
    } else {
        CacheError::Network(err.to_string())
    }
}

/// Turns raw bytes from disk or the network into the value held in memory.
pub trait Decoder<V>: Send + Sync {
    fn decode(&self, key: &CacheKey, data: &Bytes) -> Result<V>;
}

/// Keeps the raw bytes as the resident value.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawBytes;

impl Decoder<Bytes> for RawBytes {
    fn decode(&self, _key: &CacheKey, data: &Bytes) -> Result<Bytes> {
        Ok(data.clone())
    }
}

impl<V, F> Decoder<V> for F
where
    F: Fn(&CacheKey, &Bytes) -> Result<V> + Send + Sync,
{
    fn decode(&self, key: &CacheKey, data: &Bytes) -> Result<V> {
        self(key, data)
    }
}
