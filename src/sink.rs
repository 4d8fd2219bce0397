use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::Chunk;

/// The queue completed chunks flow through: every source is a producer, the
/// context is the single consumer.
///
/// A `None` entry is a sentinel: it wakes the consumer without delivering
/// anything, so a source that latched a failure can nudge the context into
/// its prune-and-redistribute pass instead of leaving it parked on the queue.
///
/// Chunks queued here are owned by the sink until popped; whatever is left at
/// teardown is freed when the sink drops.
#[derive(Debug, Default)]
pub(crate) struct Sink {
    queue: Mutex<VecDeque<Option<Chunk>>>,
    notify: Notify,
}

impl Sink {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Appends an item and wakes the consumer. Never fails, never blocks.
    pub(crate) fn put(&self, item: Option<Chunk>) {
        self.queue.lock().unwrap().push_back(item);
        self.notify.notify_one();
    }

    /// Pops the oldest item, waiting until one is available.
    ///
    /// Returns `None` for a sentinel. Intended for a single consumer; any
    /// number of producers may `put` concurrently.
    pub(crate) async fn get(&self) -> Option<Chunk> {
        loop {
            if let Some(item) = self.queue.lock().unwrap().pop_front() {
                return item;
            }
            self.notify.notified().await;
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}
