//! Reference instrumentation hooks
//!
//! Every acquire/release carries an [`Owner`] token naming the holder on whose
//! behalf it happens. The core never looks at owners; they exist so a
//! [`RefTracker`] can cross-check pairing while hunting leaks. With no tracker
//! installed the hooks cost one relaxed load.

use once_cell::sync::OnceCell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque identity of a reference holder
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Owner(u64);

impl Owner {
    /// References held by the transport on behalf of remote processes
    pub const TRANSPORT: Owner = Owner(1);
    /// References held by the deferred-destruction queue
    pub const REAPER: Owner = Owner(3);

    /// A fresh token, unique for the life of the process
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1024);
        Owner(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Owner::TRANSPORT => f.pad("Owner(transport)"),
            Owner::REAPER => f.pad("Owner(reaper)"),
            Owner(id) => write!(f, "Owner({})", id),
        }
    }
}

/// Which counter an event touched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefKind {
    Strong,
    Weak,
}

/// Observer for reference events. All methods default to no-ops.
pub trait RefTracker: Send + Sync + 'static {
    fn acquired(&self, _object: usize, _kind: RefKind, _owner: Owner) {}
    fn released(&self, _object: usize, _kind: RefKind, _owner: Owner) {}
    fn destroyed(&self, _object: usize) {}
    fn freed(&self, _object: usize) {}
}

static TRACKER: OnceCell<Box<dyn RefTracker>> = OnceCell::new();

/// Install the process-wide tracker. Only the first call succeeds.
pub fn install_tracker(tracker: Box<dyn RefTracker>) -> Result<(), Box<dyn RefTracker>> {
    TRACKER.set(tracker)
}

#[inline]
pub(crate) fn acquired(object: usize, kind: RefKind, owner: Owner) {
    if let Some(tracker) = TRACKER.get() {
        tracker.acquired(object, kind, owner);
    }
}

#[inline]
pub(crate) fn released(object: usize, kind: RefKind, owner: Owner) {
    if let Some(tracker) = TRACKER.get() {
        tracker.released(object, kind, owner);
    }
}

#[inline]
pub(crate) fn destroyed(object: usize) {
    if let Some(tracker) = TRACKER.get() {
        tracker.destroyed(object);
    }
}

#[inline]
pub(crate) fn freed(object: usize) {
    if let Some(tracker) = TRACKER.get() {
        tracker.freed(object);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_tokens_are_unique() {
        let a = Owner::next();
        let b = Owner::next();
        assert_ne!(a, b);
        assert_ne!(a, Owner::TRANSPORT);
        assert_eq!(format!("{:?}", Owner::TRANSPORT), "Owner(transport)");
    }
}
