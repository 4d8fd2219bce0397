use reqwest::Error as ReqError;
use reqwest::StatusCode;
use thiserror::Error as ThisError;

pub type DownloadResult<T> = Result<T, DownloadError>;

/// Errors surfaced to the consumer of a [`crate::DownloadContext`].
///
/// Individual replica failures are absorbed by redistributing their work and
/// never show up here; the transfer only fails once no source remains with
/// anything left to do.
#[derive(Debug, ThisError)]
pub enum DownloadError {
    #[error("no reachable source replicas")]
    NoReachableSources,
}

/// Failures of a single replica's transport.
///
/// These latch the issuing source into a failed state; the context prunes the
/// source and hands its outstanding work to a healthier replica.
#[derive(Debug, ThisError)]
pub enum TransportError {
    #[error("failed to open {url}: {source}")]
    Open {
        url: String,
        #[source]
        source: ReqError,
    },
    #[error("replica {url} answered HTTP {status}")]
    Status { url: String, status: StatusCode },
    #[error("size of {url} is unknown")]
    Stat { url: String },
    #[error("read of {length} bytes at offset {offset} failed: {source}")]
    Read {
        offset: u64,
        length: u64,
        #[source]
        source: ReqError,
    },
    #[error("short read at offset {offset}: requested {requested} bytes, got {got}")]
    ShortRead { offset: u64, requested: u64, got: u64 },
    #[error("read rejected by replica: {0}")]
    Rejected(String),
}
