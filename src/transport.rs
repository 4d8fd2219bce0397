use std::env;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{header, Client};

use crate::error::TransportError;

/// Environment variable naming the per-read retry budget forwarded into every
/// file handle opened by [`HttpConnector`].
pub const READ_RECOVERY_ENV: &str = "READ_RECOVERY";

/// Opens replica URLs for reading.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, url: &str) -> Result<Arc<dyn RemoteFile>, TransportError>;
}

/// An open replica handle: knows its size and serves ranged reads.
///
/// Reads are issued concurrently by the engine, so implementations must allow
/// overlapping `read` calls on the same handle.
#[async_trait]
pub trait RemoteFile: Send + Sync {
    async fn size(&self) -> Result<u64, TransportError>;

    /// Reads exactly `length` bytes at `offset`. Returning fewer (or more)
    /// bytes on success is a protocol violation the engine turns into a
    /// failed read.
    async fn read(&self, offset: u64, length: u64) -> Result<Bytes, TransportError>;
}

/// HTTP transport: `HEAD` to open and stat, ranged `GET` to read.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    client: Client,
    read_recovery: u32,
}

impl HttpConnector {
    pub fn new() -> Self {
        Self::with_client(Client::new())
    }

    /// Wraps an existing client, picking up the [`READ_RECOVERY_ENV`] retry
    /// budget from the environment.
    pub fn with_client(client: Client) -> Self {
        let read_recovery = env::var(READ_RECOVERY_ENV)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        Self {
            client,
            read_recovery,
        }
    }
}

impl Default for HttpConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn open(&self, url: &str) -> Result<Arc<dyn RemoteFile>, TransportError> {
        tracing::debug!(%url, "opening replica for reading");

        let response =
            self.client
                .head(url)
                .send()
                .await
                .map_err(|source| TransportError::Open {
                    url: url.to_owned(),
                    source,
                })?;

        if !response.status().is_success() {
            return Err(TransportError::Status {
                url: url.to_owned(),
                status: response.status(),
            });
        }

        // parsed off the raw header: `Response::content_length` reports the
        // body size, which is zero for a HEAD answer
        let size = response
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok());

        Ok(Arc::new(HttpRemoteFile {
            client: self.client.clone(),
            url: url.to_owned(),
            size,
            read_recovery: self.read_recovery,
        }))
    }
}

struct HttpRemoteFile {
    client: Client,
    url: String,
    /// `Content-Length` captured at open time, if the replica sent one.
    size: Option<u64>,
    read_recovery: u32,
}

impl HttpRemoteFile {
    async fn read_range(&self, offset: u64, length: u64) -> Result<Bytes, TransportError> {
        let range = format!("bytes={}-{}", offset, offset + length - 1);
        let response = self
            .client
            .get(&self.url)
            .header(header::RANGE, range)
            .send()
            .await
            .map_err(|source| TransportError::Read {
                offset,
                length,
                source,
            })?;

        if !response.status().is_success() {
            return Err(TransportError::Status {
                url: self.url.clone(),
                status: response.status(),
            });
        }

        response
            .bytes()
            .await
            .map_err(|source| TransportError::Read {
                offset,
                length,
                source,
            })
    }
}

#[async_trait]
impl RemoteFile for HttpRemoteFile {
    async fn size(&self) -> Result<u64, TransportError> {
        self.size.ok_or_else(|| TransportError::Stat {
            url: self.url.clone(),
        })
    }

    async fn read(&self, offset: u64, length: u64) -> Result<Bytes, TransportError> {
        debug_assert!(length > 0);

        let mut attempt = 0;
        loop {
            match self.read_range(offset, length).await {
                Ok(body) => return Ok(body),
                Err(err) if attempt < self.read_recovery => {
                    attempt += 1;
                    tracing::debug!(
                        url = %self.url,
                        offset,
                        attempt,
                        error = %err,
                        "retrying failed read"
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }
}
