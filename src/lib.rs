//! Concurrent multi-source file transfer engine.
//!
//! Downloads a single logical file from several replica URLs in parallel,
//! rebalancing work between replicas so the transfer tracks the combined
//! throughput of the fastest peers and survives slow or failing ones.
//!
//! The entry point is [`DownloadContext`]: it owns the file's address space,
//! deals byte blocks to one worker per replica, and hands completed chunks
//! back to the caller in completion order. Workers that run out of work steal
//! from slower peers; a replica that fails mid-transfer has its outstanding
//! work absorbed by the others.
//!
//! ```no_run
//! use multisource_download::{ChunkEvent, DownloadContext, TransferConfig};
//!
//! # async fn run() -> multisource_download::DownloadResult<()> {
//! let urls = vec![
//!     "https://mirror-a.example.com/dataset.bin".to_owned(),
//!     "https://mirror-b.example.com/dataset.bin".to_owned(),
//! ];
//! let mut ctx = DownloadContext::over_http(urls, TransferConfig::default());
//! ctx.initialize(None).await?;
//!
//! loop {
//!     match ctx.get_chunk().await? {
//!         ChunkEvent::Received(chunk) => { /* write chunk.data at chunk.offset */ }
//!         ChunkEvent::Retry => continue,
//!         ChunkEvent::Done => break,
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Chunks arrive in completion order, not file order, so consumers must seek
//! by [`Chunk::offset`]. Integrity verification and resume across restarts
//! are out of scope.

mod context;
pub mod error;
mod sink;
mod source;
pub mod transport;

pub use context::{DownloadContext, TransferConfig};
pub use error::{DownloadError, DownloadResult, TransportError};
pub use transport::{Connector, HttpConnector, RemoteFile};

use bytes::Bytes;

/// A completed read: an owned buffer and the file offset it belongs at.
///
/// The unit of delivery to the consumer. Dropping a chunk frees its buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Offset of this chunk within the logical file.
    pub offset: u64,
    /// The bytes read at `offset`.
    pub data: Bytes,
}

impl Chunk {
    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Outcome of one [`DownloadContext::get_chunk`] call.
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkEvent {
    /// The next completed chunk.
    Received(Chunk),
    /// Nothing deliverable this round; call again.
    Retry,
    /// Every byte of the file has been delivered.
    Done,
}
