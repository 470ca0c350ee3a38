//! Delay queue ordered by `(ready_at, ordinal)`.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tokio::time::Instant;

struct Entry<T> {
    ready_at: Instant,
    ordinal: u64,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.ordinal == other.ordinal
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    // Reversed: `BinaryHeap` is a max-heap and the earliest entry must be on top.
    fn cmp(&self, other: &Self) -> Ordering {
        other.ready_at.cmp(&self.ready_at).then_with(|| other.ordinal.cmp(&self.ordinal))
    }
}

/// Unbounded queue whose single consumer waits for the head's ready time.
pub(crate) struct DelayQueue<T> {
    heap: Mutex<BinaryHeap<Entry<T>>>,
    available: Notify,
}

impl<T> Default for DelayQueue<T> {
    fn default() -> Self {
        Self { heap: Mutex::new(BinaryHeap::new()), available: Notify::new() }
    }
}

impl<T> DelayQueue<T> {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BinaryHeap<Entry<T>>> {
        self.heap.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn push(&self, ready_at: Instant, ordinal: u64, item: T) {
        self.lock().push(Entry { ready_at, ordinal, item });
        self.available.notify_one();
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    pub(crate) fn clear(&self) {
        self.lock().clear();
    }

    /// Wait for the head to become ready and pop it. Single consumer only.
    pub(crate) async fn take(&self) -> T {
        loop {
            let next_ready = {
                let mut heap = self.lock();
                match heap.peek() {
                    Some(head) if head.ready_at <= Instant::now() => {
                        if let Some(entry) = heap.pop() {
                            return entry.item;
                        }
                        None
                    }
                    Some(head) => Some(head.ready_at),
                    None => None,
                }
            };
            match next_ready {
                Some(at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(at) => {}
                        _ = self.available.notified() => {}
                    }
                }
                None => self.available.notified().await,
            }
        }
    }
}
