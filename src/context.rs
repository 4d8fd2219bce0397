use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::error::{DownloadError, DownloadResult};
use crate::sink::Sink;
use crate::source::{Source, SourceStatus};
use crate::transport::{Connector, HttpConnector};
use crate::ChunkEvent;

/// Sizing and parallelism knobs for a transfer.
///
/// `block_size` is how much contiguous file each source is dealt at a time;
/// sources subdivide their block into reads of at most `chunk_size` bytes and
/// keep up to `parallel_chunks` of them in flight. Both sizes may be lowered
/// by [`DownloadContext::initialize`] when the file is small relative to the
/// number of sources.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub block_size: u64,
    pub chunk_size: u64,
    pub parallel_sources: usize,
    pub parallel_chunks: usize,
}

impl TransferConfig {
    pub const DEFAULT_BLOCK_SIZE: u64 = 128 * 1024 * 1024;
    pub const DEFAULT_CHUNK_SIZE: u64 = 8 * 1024 * 1024;
    pub const DEFAULT_PARALLEL_SOURCES: usize = 4;
    pub const DEFAULT_PARALLEL_CHUNKS: usize = 4;
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            block_size: Self::DEFAULT_BLOCK_SIZE,
            chunk_size: Self::DEFAULT_CHUNK_SIZE,
            parallel_sources: Self::DEFAULT_PARALLEL_SOURCES,
            parallel_chunks: Self::DEFAULT_PARALLEL_CHUNKS,
        }
    }
}

/// Coordinator of a multi-source transfer.
///
/// Owns the replica URL pool, the file's address space, one worker per live
/// replica and the sink they all report into. [`DownloadContext::get_chunk`]
/// drives everything: it prunes dead workers, spins up replacements from the
/// pool, pumps every worker, re-assigns work to idle ones, and hands the next
/// completed chunk to the caller.
pub struct DownloadContext {
    connector: Arc<dyn Connector>,
    urls: VecDeque<String>,
    block_size: u64,
    chunk_size: u64,
    parallel_sources: usize,
    parallel_chunks: usize,
    /// Everything below this offset has been assigned to some source.
    offset: u64,
    size: u64,
    sources: Vec<Arc<Source>>,
    /// Failed sources that still owe work; drained by [`Self::alloc_block`].
    failed: VecDeque<Arc<Source>>,
    sink: Arc<Sink>,
    /// Set once a steal may have put the same bytes in flight twice; from
    /// then on every delivered offset is recorded and repeats are dropped.
    beware_dups: bool,
    /// Delivered offsets (and their lengths), populated only once
    /// `beware_dups` is set.
    received: HashMap<u64, u64>,
}

impl DownloadContext {
    pub fn new(connector: Arc<dyn Connector>, urls: Vec<String>, config: TransferConfig) -> Self {
        Self {
            connector,
            urls: urls.into(),
            block_size: config.block_size,
            chunk_size: config.chunk_size,
            parallel_sources: config.parallel_sources,
            // a zero cap would never issue a read and stall the transfer
            parallel_chunks: config.parallel_chunks.max(1),
            offset: 0,
            size: 0,
            sources: Vec::new(),
            failed: VecDeque::new(),
            sink: Arc::new(Sink::new()),
            beware_dups: false,
            received: HashMap::new(),
        }
    }

    /// A context reading its replicas over HTTP.
    pub fn over_http(urls: Vec<String>, config: TransferConfig) -> Self {
        Self::new(Arc::new(HttpConnector::new()), urls, config)
    }

    /// Opens the first batch of sources and deals out the initial blocks.
    ///
    /// Pass the file size if it is already known; with `None` the first
    /// reachable replica is stat'ed for it. URLs that fail to open are
    /// consumed and logged; only a completely unreachable pool is an error.
    #[tracing::instrument(skip(self), err(Debug))]
    pub async fn initialize(&mut self, file_size: Option<u64>) -> DownloadResult<()> {
        self.init_new_sources(file_size).await;
        if self.sources.is_empty() {
            return Err(DownloadError::NoReachableSources);
        }

        self.size = match file_size {
            Some(size) => size,
            None => self.sources[0].size(),
        };

        // shrink the block so every source gets one, but never below the
        // chunk size
        let allocation = self.size / self.sources.len() as u64;
        if allocation < self.block_size {
            self.block_size = allocation;
        }
        if self.block_size < self.chunk_size {
            self.block_size = self.chunk_size;
        }

        tracing::info!(
            size = self.size,
            block_size = self.block_size,
            sources = self.sources.len(),
            "starting transfer"
        );

        for src in &self.sources {
            if self.offset >= self.size {
                break;
            }
            let block = self.block_size.min(self.size - self.offset);
            src.set_block(self.offset, block);
            self.offset += block;
        }

        Ok(())
    }

    /// File size adopted during [`Self::initialize`].
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Drives the transfer and returns the next completed chunk.
    ///
    /// Chunks arrive in completion order, not file order. `Retry` means the
    /// call was woken without anything deliverable (a worker died, or a
    /// duplicate tail chunk was filtered out); just call again. After `Done`
    /// or an error the transfer is over; further calls keep returning `Done`
    /// but are not expected.
    pub async fn get_chunk(&mut self) -> DownloadResult<ChunkEvent> {
        self.remove_failed();
        self.init_new_sources(Some(self.size)).await;

        if self.sources.is_empty() {
            return Err(DownloadError::NoReachableSources);
        }

        for i in 0..self.sources.len() {
            let src = Arc::clone(&self.sources[i]);
            let status = src.read_chunk();
            // a failure latched mid-round is terminal; the source is pruned
            // next call and must not be handed fresh work
            if matches!(status, SourceStatus::Failed(_)) {
                continue;
            }
            if !src.has_block() {
                if self.alloc_block(&src) {
                    self.beware_dups = true;
                }
                // issue whatever the re-assignment granted right away, so
                // the wait below always has a completion to wake on
                src.read_chunk();
            }
        }

        if self.sources.iter().all(|src| src.is_done()) && self.sink.is_empty() {
            tracing::info!("transfer complete");
            return Ok(ChunkEvent::Done);
        }

        match self.sink.get().await {
            Some(chunk) => {
                if self.beware_dups {
                    if let Some(&length) = self.received.get(&chunk.offset) {
                        // same offset can only ever carry the same length
                        debug_assert_eq!(length, chunk.len());
                        tracing::debug!(offset = chunk.offset, "dropping duplicate chunk");
                        return Ok(ChunkEvent::Retry);
                    }
                    self.received.insert(chunk.offset, chunk.len());
                }
                Ok(ChunkEvent::Received(chunk))
            }
            None => Ok(ChunkEvent::Retry),
        }
    }

    /// Moves dead sources out of the live list: those still owing work are
    /// parked for takeover, the rest are dropped.
    fn remove_failed(&mut self) {
        let failed = &mut self.failed;
        self.sources.retain(|src| {
            if !src.has_failed() {
                return true;
            }
            if src.has_work() {
                tracing::debug!("parking failed source holding outstanding work");
                failed.push_back(Arc::clone(src));
            }
            false
        });
    }

    /// Tops the live set up from the URL pool. Unreachable replicas are
    /// consumed silently apart from a log line.
    async fn init_new_sources(&mut self, file_size: Option<u64>) {
        while self.sources.len() < self.parallel_sources {
            let Some(url) = self.urls.pop_front() else {
                break;
            };
            match Source::connect(
                self.connector.as_ref(),
                url.clone(),
                file_size,
                self.chunk_size,
                self.parallel_chunks,
                Arc::clone(&self.sink),
            )
            .await
            {
                Ok(src) => self.sources.push(src),
                Err(err) => {
                    tracing::warn!(%url, error = %err, "discarding unreachable replica");
                }
            }
        }
    }

    /// Finds `src` more work: a fresh block while the file has unassigned
    /// bytes, else the leftovers of a failed source, else a steal from the
    /// weakest live peer. Returns `true` when the steal made duplicate
    /// downloads possible.
    fn alloc_block(&mut self, src: &Arc<Source>) -> bool {
        if self.offset < self.size {
            let block = self.block_size.min(self.size - self.offset);
            src.set_block(self.offset, block);
            self.offset += block;
            return false;
        }

        if let Some(failed) = self.failed.pop_front() {
            src.steal(&failed);
            return false;
        }

        match self.weakest_link(src) {
            Some(victim) => src.steal(&victim),
            None => false,
        }
    }

    /// The live source with the highest (worst) efficiency indicator, or
    /// `None` when every candidate scored zero or less. First-wins on ties.
    fn weakest_link(&self, exclude: &Arc<Source>) -> Option<Arc<Source>> {
        let mut weakest: Option<(f64, &Arc<Source>)> = None;
        for src in &self.sources {
            if Arc::ptr_eq(src, exclude) {
                continue;
            }
            let indicator = src.efficiency_indicator();
            if indicator > weakest.map_or(0.0, |(worst, _)| worst) {
                weakest = Some((indicator, src));
            }
        }
        weakest.map(|(_, src)| Arc::clone(src))
    }
}
