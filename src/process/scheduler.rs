//! Timed handlers run on pool threads

use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub type Handler = Box<dyn FnOnce() + Send + 'static>;

struct Timed {
    due: Instant,
    seq: u64,
    handler: Handler,
}

impl PartialEq for Timed {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Timed {}

impl PartialOrd for Timed {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timed {
    // Reversed: BinaryHeap is a max-heap and the earliest handler must win.
    // Equal deadlines run in posting order.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
pub(crate) struct Scheduler {
    queue: Mutex<BinaryHeap<Timed>>,
    seq: AtomicU64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&self, due: Instant, handler: Handler) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.queue.lock().push(Timed { due, seq, handler });
    }

    /// Earliest handler due at `now`, removed from the queue
    pub fn take_due(&self, now: Instant) -> Option<Handler> {
        let mut queue = self.queue.lock();
        if queue.peek().map_or(false, |timed| timed.due <= now) {
            queue.pop().map(|timed| timed.handler)
        } else {
            None
        }
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.queue.lock().peek().map(|timed| timed.due)
    }

    pub fn has_due(&self, now: Instant) -> bool {
        self.next_due().map_or(false, |due| due <= now)
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }
}
