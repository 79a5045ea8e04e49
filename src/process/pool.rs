//! Pool thread accounting
//!
//! Counts only; the threads themselves run
//! [`crate::thread::DispatchThread`] loops.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::ThreadId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Threads inside the dispatch loop
    pub live: usize,
    /// Spawned but not yet in the loop
    pub pending: usize,
    /// Live threads blocked waiting for work
    pub idle: usize,
}

#[derive(Debug, Default)]
struct PoolState {
    live: usize,
    pending: usize,
    idle: VecDeque<ThreadId>,
}

#[derive(Debug, Default)]
pub(crate) struct ThreadPool {
    state: Mutex<PoolState>,
    started: AtomicBool,
    spawned: AtomicUsize,
}

impl ThreadPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// True the first time only
    pub fn mark_started(&self) -> bool {
        !self.started.swap(true, Ordering::AcqRel)
    }

    /// Reserve room for one more thread. Returns its sequence number, or
    /// `None` at capacity.
    pub fn reserve(&self, max: usize) -> Option<usize> {
        let mut state = self.state.lock();
        if state.live + state.pending >= max {
            return None;
        }
        state.pending += 1;
        Some(self.spawned.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub fn cancel_reservation(&self) {
        let mut state = self.state.lock();
        state.pending = state.pending.saturating_sub(1);
    }

    pub fn enter(&self, reserved: bool) -> PoolStats {
        let mut state = self.state.lock();
        if reserved {
            state.pending = state.pending.saturating_sub(1);
        }
        state.live += 1;
        Self::snapshot(&state)
    }

    pub fn leave(&self) -> PoolStats {
        let mut state = self.state.lock();
        state.live = state.live.saturating_sub(1);
        Self::snapshot(&state)
    }

    /// Leave the pool if it stays at or above `min` without this thread
    pub fn try_retire(&self, id: ThreadId, min: usize) -> bool {
        let mut state = self.state.lock();
        if state.live <= min {
            return false;
        }
        state.live -= 1;
        state.idle.retain(|idle| *idle != id);
        true
    }

    pub fn set_idle(&self, id: ThreadId, idle: bool) {
        let mut state = self.state.lock();
        if idle {
            state.idle.push_back(id);
        } else {
            state.idle.retain(|waiting| *waiting != id);
        }
    }

    /// Idle threads are down to `min_idle` and there is room below `max`
    pub fn should_grow(&self, min_idle: usize, max: usize) -> bool {
        let state = self.state.lock();
        state.idle.len() <= min_idle && state.live + state.pending < max
    }

    pub fn stats(&self) -> PoolStats {
        Self::snapshot(&self.state.lock())
    }

    fn snapshot(state: &PoolState) -> PoolStats {
        PoolStats {
            live: state.live,
            pending: state.pending,
            idle: state.idle.len(),
        }
    }
}
