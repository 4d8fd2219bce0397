use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::error::TransportError;
use crate::sink::Sink;
use crate::transport::{Connector, RemoteFile};
use crate::Chunk;

/// Where a source stands with the work assigned to it.
#[derive(Debug, Clone, Default)]
pub(crate) enum SourceStatus {
    /// No block, no ongoing reads, no stolen chunks.
    #[default]
    Done,
    /// Work remains.
    Continue,
    /// A read failed; the source is dead and keeps this status.
    Failed(Arc<TransportError>),
}

#[derive(Debug, Default)]
struct SourceState {
    status: SourceStatus,
    /// Offset of the next chunk to carve from the block.
    cur: u64,
    /// End of the block (exclusive).
    end: u64,
    /// In-flight reads, offset → length.
    ongoing: BTreeMap<u64, u64>,
    /// Chunk assignments inherited from another source, offset → length.
    /// Drained before the block when issuing new reads.
    stolen: BTreeMap<u64, u64>,
    /// Bytes this source has delivered so far.
    transferred: u64,
}

impl SourceState {
    fn has_work(&self) -> bool {
        self.cur < self.end || !self.ongoing.is_empty() || !self.stolen.is_empty()
    }

    /// Bytes assigned to this source that have not been delivered yet.
    fn outstanding(&self) -> u64 {
        self.ongoing.values().sum::<u64>() + self.stolen.values().sum::<u64>() + (self.end - self.cur)
    }

    /// Recomputes `Continue`/`Done` from the remaining work. A latched
    /// failure is never overwritten.
    fn refresh_status(&mut self) {
        if matches!(self.status, SourceStatus::Failed(_)) {
            return;
        }
        self.status = if self.has_work() {
            SourceStatus::Continue
        } else {
            SourceStatus::Done
        };
    }
}

/// One replica's worker: holds the open file handle and pumps asynchronous
/// reads over its assigned block, reporting completions into the shared sink.
///
/// Mutable state lives behind one mutex because it is touched from two sides:
/// the context's driver task (pump, block assignment, stealing) and the read
/// tasks (result reporting).
pub(crate) struct Source {
    /// Handle to ourselves, upgraded when a read task needs to own the
    /// source for the duration of its read.
    weak: Weak<Source>,
    url: String,
    file: Arc<dyn RemoteFile>,
    size: u64,
    chunk_size: u64,
    parallel: usize,
    sink: Arc<Sink>,
    state: Mutex<SourceState>,
}

impl Source {
    /// Opens `url` through the connector and returns a ready source. With no
    /// `file_size` given, the replica is stat'ed for it.
    ///
    /// A source that fails here never exists; the caller just consumed the
    /// URL.
    pub(crate) async fn connect(
        connector: &dyn Connector,
        url: String,
        file_size: Option<u64>,
        chunk_size: u64,
        parallel: usize,
        sink: Arc<Sink>,
    ) -> Result<Arc<Self>, TransportError> {
        let file = connector.open(&url).await?;
        let size = match file_size {
            Some(size) => size,
            None => file.size().await?,
        };

        Ok(Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            url,
            file,
            size,
            chunk_size,
            parallel,
            sink,
            state: Mutex::new(SourceState::default()),
        }))
    }

    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    pub(crate) fn is_done(&self) -> bool {
        matches!(self.state.lock().unwrap().status, SourceStatus::Done)
    }

    pub(crate) fn has_failed(&self) -> bool {
        matches!(self.state.lock().unwrap().status, SourceStatus::Failed(_))
    }

    pub(crate) fn has_work(&self) -> bool {
        self.state.lock().unwrap().has_work()
    }

    pub(crate) fn has_block(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.cur < state.end
    }

    /// Installs a new block and forces the status back to `Continue`.
    pub(crate) fn set_block(&self, offset: u64, size: u64) {
        tracing::debug!(url = %self.url, offset, size, "assigning block");
        let mut state = self.state.lock().unwrap();
        state.cur = offset;
        state.end = offset + size;
        state.status = SourceStatus::Continue;
    }

    /// The pump: tops the in-flight read count up to the parallelism cap,
    /// draining stolen chunks (lowest offset first) before carving new ones
    /// from the block, and returns the resulting status.
    pub(crate) fn read_chunk(&self) -> SourceStatus {
        loop {
            let (offset, length) = {
                let mut state = self.state.lock().unwrap();
                if let SourceStatus::Failed(_) = state.status {
                    return state.status.clone();
                }
                if state.ongoing.len() >= self.parallel {
                    break;
                }
                if let Some((offset, length)) = state.stolen.pop_first() {
                    state.ongoing.insert(offset, length);
                    (offset, length)
                } else if state.cur < state.end {
                    let offset = state.cur;
                    let length = self.chunk_size.min(state.end - state.cur);
                    state.ongoing.insert(offset, length);
                    state.cur += length;
                    (offset, length)
                } else {
                    break;
                }
            };
            self.issue_read(offset, length);
        }

        let mut state = self.state.lock().unwrap();
        state.refresh_status();
        state.status.clone()
    }

    /// Spawns the asynchronous read. The task owns a strong handle to this
    /// source, so a source with reads in flight outlives the context's
    /// release of it; the completing task is what may drop it last.
    fn issue_read(&self, offset: u64, length: u64) {
        tracing::trace!(url = %self.url, offset, length, "issuing read");
        // cannot fail: the caller reached us through a strong handle
        let Some(src) = self.weak.upgrade() else {
            return;
        };
        let file = Arc::clone(&self.file);
        tokio::spawn(async move {
            let result = match file.read(offset, length).await {
                Ok(data) if data.len() as u64 == length => Ok(Chunk { offset, data }),
                Ok(data) => Err(TransportError::ShortRead {
                    offset,
                    requested: length,
                    got: data.len() as u64,
                }),
                Err(err) => Err(err),
            };
            src.report_result(result);
        });
    }

    /// Accepts a read completion. A failure latches the source; the chunk of
    /// a completion that raced a latched failure is dropped. Either way the
    /// consumer is woken: with the chunk, or with a bare sentinel.
    pub(crate) fn report_result(&self, result: Result<Chunk, TransportError>) {
        let chunk = match result {
            Ok(chunk) => chunk,
            Err(err) => {
                tracing::warn!(url = %self.url, error = %err, "replica read failed");
                self.state.lock().unwrap().status = SourceStatus::Failed(Arc::new(err));
                self.sink.put(None);
                return;
            }
        };

        {
            let mut state = self.state.lock().unwrap();
            if let SourceStatus::Failed(_) = state.status {
                drop(state);
                drop(chunk);
                self.sink.put(None);
                return;
            }
            state.ongoing.remove(&chunk.offset);
            state.transferred += chunk.len();
        }
        self.sink.put(Some(chunk));
    }

    /// Work left per byte transferred; greater means less efficient. A source
    /// that has transferred nothing scores infinite.
    pub(crate) fn efficiency_indicator(&self) -> f64 {
        let state = self.state.lock().unwrap();
        if state.transferred == 0 {
            return f64::INFINITY;
        }
        state.outstanding() as f64 / state.transferred as f64
    }

    /// Takes work off `victim`, from most to least drastic:
    ///
    /// 1. a done victim has nothing to give;
    /// 2. a failed victim forfeits everything it still owes;
    /// 3. a victim with a block loses a suffix of it, sized by the ratio of
    ///    the two transfer counters;
    /// 4. a victim left with stolen chunks loses those;
    /// 5. a victim left with only ongoing reads gets raced: its in-flight
    ///    assignments are copied, not moved, and the same bytes may now
    ///    arrive twice.
    ///
    /// Returns `true` only in the racing case, which is the caller's signal
    /// to start filtering duplicate offsets.
    pub(crate) fn steal(&self, victim: &Source) -> bool {
        debug_assert!(!std::ptr::eq(self, victim));

        let (mut mine, mut theirs) = self.lock_pair(victim);
        // callers only steal for a source that has drained its own block
        debug_assert!(mine.cur >= mine.end);

        if matches!(theirs.status, SourceStatus::Done) {
            return false;
        }

        if matches!(theirs.status, SourceStatus::Failed(_)) {
            tracing::debug!(
                thief = %self.url,
                victim = %victim.url,
                "taking over failed replica's outstanding work"
            );
            mine.stolen.append(&mut theirs.ongoing);
            mine.stolen.append(&mut theirs.stolen);
            mine.cur = theirs.cur;
            mine.end = theirs.end;
            theirs.cur = 0;
            theirs.end = 0;
            mine.refresh_status();
            return false;
        }

        if theirs.cur < theirs.end {
            let remaining = theirs.end - theirs.cur;
            let steal = if remaining <= self.chunk_size {
                remaining
            } else {
                let total = mine.transferred + theirs.transferred;
                if total == 0 {
                    remaining / 2
                } else {
                    (remaining as f64 * mine.transferred as f64 / total as f64) as u64
                }
            };
            tracing::debug!(
                thief = %self.url,
                victim = %victim.url,
                steal,
                remaining,
                "stealing block suffix"
            );
            mine.cur = theirs.end - steal;
            mine.end = theirs.end;
            theirs.end -= steal;
            mine.refresh_status();
            theirs.refresh_status();
            return false;
        }

        if !theirs.stolen.is_empty() {
            tracing::debug!(
                thief = %self.url,
                victim = %victim.url,
                "taking over stolen chunks"
            );
            mine.stolen.append(&mut theirs.stolen);
            mine.refresh_status();
            theirs.refresh_status();
            return false;
        }

        if mine.transferred > theirs.transferred {
            tracing::debug!(
                thief = %self.url,
                victim = %victim.url,
                "racing ongoing reads; duplicates now possible"
            );
            for (&offset, &length) in theirs.ongoing.iter() {
                mine.stolen.insert(offset, length);
            }
            mine.refresh_status();
            return true;
        }

        false
    }

    /// Acquires both state locks under a total order (by source address) so
    /// that overlapping steals cannot deadlock. Returns `(mine, victim's)`.
    fn lock_pair<'a>(
        &'a self,
        other: &'a Source,
    ) -> (MutexGuard<'a, SourceState>, MutexGuard<'a, SourceState>) {
        let this = self as *const Source as usize;
        let that = other as *const Source as usize;
        if this < that {
            let mine = self.state.lock().unwrap();
            let theirs = other.state.lock().unwrap();
            (mine, theirs)
        } else {
            let theirs = other.state.lock().unwrap();
            let mine = self.state.lock().unwrap();
            (mine, theirs)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::transport::mock::{pattern, MockConnector, ReplicaSpec};

    async fn test_source(
        spec: ReplicaSpec,
        chunk_size: u64,
        parallel: usize,
        sink: &Arc<Sink>,
    ) -> Arc<Source> {
        let url = "mock://replica";
        let connector = MockConnector::new().replica(url, spec);
        Source::connect(
            &connector,
            url.to_owned(),
            None,
            chunk_size,
            parallel,
            Arc::clone(sink),
        )
        .await
        .unwrap()
    }

    /// A pair of sources sharing one sink, for steal tests.
    async fn test_pair(chunk_size: u64) -> (Arc<Source>, Arc<Source>, Arc<Sink>) {
        let sink = Arc::new(Sink::new());
        let thief = test_source(ReplicaSpec::sized(1 << 20), chunk_size, 4, &sink).await;
        let victim = test_source(ReplicaSpec::sized(1 << 20), chunk_size, 4, &sink).await;
        (thief, victim, sink)
    }

    #[tokio::test]
    async fn connect_stats_when_size_unknown() {
        let sink = Arc::new(Sink::new());
        let src = test_source(ReplicaSpec::sized(4096), 256, 2, &sink).await;
        assert_eq!(src.size(), 4096);
        assert!(src.is_done());
        assert!(!src.has_work());
    }

    #[tokio::test]
    async fn connect_propagates_open_failure() {
        let url = "mock://refused";
        let spec = ReplicaSpec {
            refuse_open: true,
            ..ReplicaSpec::sized(4096)
        };
        let connector = MockConnector::new().replica(url, spec);
        let sink = Arc::new(Sink::new());
        let result =
            Source::connect(&connector, url.to_owned(), None, 256, 2, Arc::clone(&sink)).await;
        assert!(matches!(result, Err(TransportError::Rejected(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn pump_respects_parallel_cap() {
        let spec = ReplicaSpec {
            read_delay: Duration::from_secs(3600),
            ..ReplicaSpec::sized(1024)
        };
        let sink = Arc::new(Sink::new());
        let src = test_source(spec, 128, 3, &sink).await;

        src.set_block(0, 1024);
        assert!(matches!(src.read_chunk(), SourceStatus::Continue));

        let state = src.state.lock().unwrap();
        assert_eq!(state.ongoing.len(), 3);
        assert_eq!(state.cur, 384);
        assert_eq!(state.end, 1024);
    }

    #[tokio::test(start_paused = true)]
    async fn pump_drains_stolen_before_block() {
        let spec = ReplicaSpec {
            read_delay: Duration::from_secs(3600),
            ..ReplicaSpec::sized(4096)
        };
        let sink = Arc::new(Sink::new());
        let src = test_source(spec, 128, 3, &sink).await;

        src.set_block(512, 256);
        {
            let mut state = src.state.lock().unwrap();
            state.stolen.insert(0, 128);
            state.stolen.insert(128, 128);
        }
        src.read_chunk();

        let state = src.state.lock().unwrap();
        assert!(state.stolen.is_empty());
        assert_eq!(
            state.ongoing.keys().copied().collect::<Vec<_>>(),
            vec![0, 128, 512]
        );
        assert_eq!(state.cur, 640);
    }

    #[tokio::test]
    async fn completes_a_block_and_goes_done() {
        let sink = Arc::new(Sink::new());
        let src = test_source(ReplicaSpec::sized(256), 128, 4, &sink).await;

        src.set_block(0, 256);
        assert!(matches!(src.read_chunk(), SourceStatus::Continue));

        let mut offsets = vec![
            sink.get().await.unwrap().offset,
            sink.get().await.unwrap().offset,
        ];
        offsets.sort_unstable();
        assert_eq!(offsets, vec![0, 128]);

        assert!(matches!(src.read_chunk(), SourceStatus::Done));
        assert_eq!(src.state.lock().unwrap().transferred, 256);
    }

    #[tokio::test]
    async fn delivered_chunks_carry_the_replica_bytes() {
        let sink = Arc::new(Sink::new());
        let src = test_source(ReplicaSpec::sized(128), 128, 1, &sink).await;

        src.set_block(0, 128);
        src.read_chunk();

        let chunk = sink.get().await.unwrap();
        assert_eq!(chunk.data, pattern(0, 128));
    }

    #[tokio::test]
    async fn failed_read_latches_and_wakes_consumer() {
        let spec = ReplicaSpec {
            fail_reads_at: vec![128],
            ..ReplicaSpec::sized(256)
        };
        let sink = Arc::new(Sink::new());
        let src = test_source(spec, 128, 4, &sink).await;

        src.set_block(0, 256);
        src.read_chunk();

        let results = vec![sink.get().await, sink.get().await];
        assert_eq!(results.iter().filter(|r| r.is_some()).count(), 1);
        assert_eq!(results.iter().filter(|r| r.is_none()).count(), 1);

        assert!(src.has_failed());
        // the failed read's assignment is still owed; a thief can recover it
        assert!(src.has_work());
        assert!(src
            .state
            .lock()
            .unwrap()
            .ongoing
            .contains_key(&128));
    }

    #[tokio::test]
    async fn completion_after_latched_failure_is_dropped() {
        let sink = Arc::new(Sink::new());
        let src = test_source(ReplicaSpec::sized(256), 128, 4, &sink).await;

        src.report_result(Err(TransportError::Rejected("boom".into())));
        src.report_result(Ok(Chunk {
            offset: 0,
            data: pattern(0, 128),
        }));

        assert!(sink.get().await.is_none());
        assert!(sink.get().await.is_none());
        assert_eq!(src.state.lock().unwrap().transferred, 0);
    }

    #[tokio::test]
    async fn short_read_is_normalized_to_an_error() {
        let sink = Arc::new(Sink::new());
        // replica smaller than the block we assign: the read comes back full
        // length from the mock, so fake the short completion directly
        let src = test_source(ReplicaSpec::sized(256), 128, 4, &sink).await;
        src.report_result(Err(TransportError::ShortRead {
            offset: 0,
            requested: 128,
            got: 0,
        }));
        assert!(src.has_failed());
    }

    #[tokio::test]
    async fn efficiency_is_infinite_before_first_byte() {
        let sink = Arc::new(Sink::new());
        let src = test_source(ReplicaSpec::sized(1024), 128, 2, &sink).await;
        src.set_block(0, 1024);
        assert_eq!(src.efficiency_indicator(), f64::INFINITY);
    }

    #[tokio::test]
    async fn efficiency_is_outstanding_over_transferred() {
        let sink = Arc::new(Sink::new());
        let src = test_source(ReplicaSpec::sized(1024), 128, 2, &sink).await;
        {
            let mut state = src.state.lock().unwrap();
            state.transferred = 512;
            state.cur = 512;
            state.end = 640;
            state.ongoing.insert(256, 64);
            state.stolen.insert(768, 64);
        }
        // (128 + 64 + 64) / 512
        assert_eq!(src.efficiency_indicator(), 0.5);
    }

    #[tokio::test]
    async fn steal_from_done_victim_is_a_no_op() {
        let (thief, victim, _sink) = test_pair(128).await;
        assert!(!thief.steal(&victim));
        assert!(thief.is_done());
        assert!(!thief.has_work());
    }

    #[tokio::test]
    async fn steal_from_failed_victim_takes_everything() {
        let (thief, victim, _sink) = test_pair(128).await;
        {
            let mut state = victim.state.lock().unwrap();
            state.cur = 256;
            state.end = 1024;
            state.ongoing.insert(0, 128);
            state.stolen.insert(2048, 128);
            state.status = SourceStatus::Failed(Arc::new(TransportError::Rejected("down".into())));
        }

        assert!(!thief.steal(&victim));

        let mine = thief.state.lock().unwrap();
        assert_eq!(mine.cur, 256);
        assert_eq!(mine.end, 1024);
        assert_eq!(
            mine.stolen.iter().map(|(&o, &l)| (o, l)).collect::<Vec<_>>(),
            vec![(0, 128), (2048, 128)]
        );
        assert!(matches!(mine.status, SourceStatus::Continue));

        let theirs = victim.state.lock().unwrap();
        assert_eq!((theirs.cur, theirs.end), (0, 0));
        assert!(theirs.ongoing.is_empty());
        assert!(theirs.stolen.is_empty());
        // the failure stays latched
        assert!(matches!(theirs.status, SourceStatus::Failed(_)));
    }

    #[tokio::test]
    async fn steal_takes_block_suffix_proportional_to_throughput() {
        let (thief, victim, _sink) = test_pair(100).await;
        {
            let mut state = thief.state.lock().unwrap();
            state.transferred = 300;
        }
        {
            let mut state = victim.state.lock().unwrap();
            state.cur = 0;
            state.end = 4000;
            state.transferred = 100;
            state.status = SourceStatus::Continue;
        }

        assert!(!thief.steal(&victim));

        let mine = thief.state.lock().unwrap();
        let theirs = victim.state.lock().unwrap();
        // 300 / (300 + 100) of 4000 bytes
        assert_eq!((mine.cur, mine.end), (1000, 4000));
        assert_eq!((theirs.cur, theirs.end), (0, 1000));
        assert!(matches!(mine.status, SourceStatus::Continue));
        assert!(matches!(theirs.status, SourceStatus::Continue));
    }

    #[tokio::test]
    async fn steal_takes_whole_remainder_when_at_most_one_chunk() {
        let (thief, victim, _sink) = test_pair(128).await;
        {
            let mut state = victim.state.lock().unwrap();
            state.cur = 896;
            state.end = 1024;
            state.transferred = 512;
            state.status = SourceStatus::Continue;
        }

        assert!(!thief.steal(&victim));

        let mine = thief.state.lock().unwrap();
        let theirs = victim.state.lock().unwrap();
        assert_eq!((mine.cur, mine.end), (896, 1024));
        assert_eq!(theirs.cur, theirs.end);
        // nothing else outstanding, so the victim is now done
        assert!(matches!(theirs.status, SourceStatus::Done));
    }

    #[tokio::test]
    async fn steal_takes_over_stolen_chunks() {
        let (thief, victim, _sink) = test_pair(128).await;
        {
            let mut state = victim.state.lock().unwrap();
            state.stolen.insert(512, 128);
            state.status = SourceStatus::Continue;
        }

        assert!(!thief.steal(&victim));

        assert_eq!(
            thief
                .state
                .lock()
                .unwrap()
                .stolen
                .iter()
                .map(|(&o, &l)| (o, l))
                .collect::<Vec<_>>(),
            vec![(512, 128)]
        );
        assert!(victim.state.lock().unwrap().stolen.is_empty());
    }

    #[tokio::test]
    async fn steal_races_ongoing_reads_and_signals_duplicates() {
        let (thief, victim, _sink) = test_pair(128).await;
        {
            let mut state = thief.state.lock().unwrap();
            state.transferred = 1024;
        }
        {
            let mut state = victim.state.lock().unwrap();
            state.ongoing.insert(512, 128);
            state.transferred = 512;
            state.status = SourceStatus::Continue;
        }

        assert!(thief.steal(&victim));

        // copied, not moved: both sources now hold the assignment
        assert_eq!(thief.state.lock().unwrap().stolen.get(&512), Some(&128));
        assert_eq!(victim.state.lock().unwrap().ongoing.get(&512), Some(&128));
        assert!(matches!(
            thief.state.lock().unwrap().status,
            SourceStatus::Continue
        ));
    }

    #[tokio::test]
    async fn steal_yields_nothing_from_a_faster_victim() {
        let (thief, victim, _sink) = test_pair(128).await;
        {
            let mut state = thief.state.lock().unwrap();
            state.transferred = 256;
        }
        {
            let mut state = victim.state.lock().unwrap();
            state.ongoing.insert(512, 128);
            state.transferred = 512;
            state.status = SourceStatus::Continue;
        }

        assert!(!thief.steal(&victim));
        assert!(thief.state.lock().unwrap().stolen.is_empty());
    }
}
