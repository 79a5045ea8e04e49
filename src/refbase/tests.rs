//! Unit tests for the dual-count object base

use super::*;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::thread;

/// Counts every hook invocation
#[derive(Default)]
struct Counters {
    first: AtomicUsize,
    finish: AtomicUsize,
    dropped: AtomicUsize,
}

struct Tracked {
    counters: Arc<Counters>,
    finish: Finish,
    revive: bool,
}

impl Tracked {
    fn new(counters: &Arc<Counters>) -> Self {
        Self::with(counters, Finish::Proceed, false)
    }

    fn with(counters: &Arc<Counters>, finish: Finish, revive: bool) -> Self {
        Tracked {
            counters: Arc::clone(counters),
            finish,
            revive,
        }
    }
}

impl RefHooks for Tracked {
    fn on_first_ref(&self) {
        self.counters.first.fetch_add(1, Ordering::SeqCst);
    }

    fn on_last_strong_ref(&self) -> Finish {
        self.counters.finish.fetch_add(1, Ordering::SeqCst);
        self.finish
    }

    fn on_try_acquire_failed(&self, _never_acquired: bool) -> bool {
        self.revive
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.counters.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

fn counts(counters: &Counters) -> (usize, usize, usize) {
    (
        counters.first.load(Ordering::SeqCst),
        counters.finish.load(Ordering::SeqCst),
        counters.dropped.load(Ordering::SeqCst),
    )
}

// ============================================================================
// Strong / weak basics
// ============================================================================

#[test]
fn test_new_fires_first_ref_once() {
    let counters = Arc::new(Counters::default());
    let sp = Sp::new(Tracked::new(&counters));
    assert_eq!(Sp::strong_count(&sp), 1);
    assert_eq!(Sp::weak_count(&sp), 1);

    let other = sp.clone();
    assert_eq!(Sp::strong_count(&sp), 2);
    assert_eq!(Sp::weak_count(&sp), 2);
    drop(other);

    assert_eq!(counts(&counters), (1, 0, 0));
    drop(sp);
    assert_eq!(counts(&counters), (1, 1, 1));
}

#[test]
fn test_weak_outlives_value() {
    let counters = Arc::new(Counters::default());
    let sp = Sp::new(Tracked::new(&counters));
    let wp = Sp::downgrade(&sp);
    drop(sp);

    assert_eq!(counts(&counters), (1, 1, 1));
    assert_eq!(wp.strong_count(), 0);
    assert!(wp.promote().is_none());
}

#[test]
fn test_weak_only_object_is_never_initialized() {
    let counters = Arc::new(Counters::default());
    let wp = Wp::new(Tracked::new(&counters));
    assert_eq!(wp.strong_count(), INITIAL_BIAS);
    assert!(wp.ref_box().never_acquired());

    drop(wp);
    // No first ref, no finish, but the value is still dropped on free.
    assert_eq!(counts(&counters), (0, 0, 1));
}

#[test]
fn test_promote_never_acquired_needs_hook() {
    let counters = Arc::new(Counters::default());
    let refused = Wp::new(Tracked::new(&counters));
    assert!(refused.promote().is_none());

    let accepted = Wp::new(Tracked::with(&counters, Finish::Proceed, true));
    let sp = accepted.promote().expect("hook opted in");
    assert_eq!(Sp::strong_count(&sp), 1);
    assert_eq!(counters.first.load(Ordering::SeqCst), 1);
}

#[test]
fn test_promote_live_object() {
    let counters = Arc::new(Counters::default());
    let sp = Sp::new(Tracked::new(&counters));
    let wp = Sp::downgrade(&sp);
    let promoted = wp.promote().unwrap();
    assert!(Sp::ptr_eq(&sp, &promoted));
    assert_eq!(Sp::strong_count(&sp), 2);
}

#[test]
fn test_try_release_gives_back_shared_reference() {
    let counters = Arc::new(Counters::default());
    let sp = Sp::new(Tracked::new(&counters));
    let owner = Owner::next();
    let ptr = Sp::as_non_null(&sp);

    Sp::ref_box(&sp).acquire_strong(owner);
    assert!(unsafe { RefBox::try_release_strong(ptr, owner) });
    assert_eq!(Sp::strong_count(&sp), 1);
    assert_eq!(Sp::weak_count(&sp), 1);
    assert_eq!(counters.finish.load(Ordering::SeqCst), 0);
}

#[test]
fn test_try_release_of_last_reference_finishes() {
    let counters = Arc::new(Counters::default());
    let sp = Sp::new(Tracked::new(&counters));
    let wp = Sp::downgrade(&sp);
    let ptr = Sp::as_non_null(&sp);
    let owner = Owner::next();
    Sp::ref_box(&sp).acquire_strong(owner);
    drop(sp);

    // Safety: `owner` holds the only strong reference; `wp` keeps the block.
    assert!(unsafe { RefBox::try_release_strong(ptr, owner) });
    assert_eq!(counters.finish.load(Ordering::SeqCst), 1);
    assert_eq!(counters.dropped.load(Ordering::SeqCst), 1);
    assert!(wp.promote().is_none());

    // Nothing left to give back.
    assert!(!unsafe { RefBox::try_release_strong(ptr, Owner::next()) });
}

#[test]
fn test_try_release_refuses_unacquired_object() {
    let counters = Arc::new(Counters::default());
    let wp = Wp::new(Tracked::new(&counters));
    assert!(!unsafe { RefBox::try_release_strong(wp.as_non_null(), Owner::next()) });
    assert!(wp.ref_box().never_acquired());
}

#[test]
fn test_try_acquire_weak() {
    let counters = Arc::new(Counters::default());
    let sp = Sp::new(Tracked::new(&counters));
    let owner = Owner::next();
    assert!(Sp::ref_box(&sp).try_acquire_weak(owner));
    assert_eq!(Sp::weak_count(&sp), 2);
    unsafe { RefBox::release_weak(Sp::as_non_null(&sp), owner) };
}

// ============================================================================
// Finish decisions
// ============================================================================

#[test]
fn test_extend_keeps_value_until_weak_zero() {
    let counters = Arc::new(Counters::default());
    let sp = Sp::new(Tracked::with(&counters, Finish::Extend, false));
    let wp = Sp::downgrade(&sp);
    drop(sp);

    assert_eq!(counts(&counters), (1, 1, 0));
    drop(wp);
    assert_eq!(counts(&counters), (1, 1, 1));
}

#[test]
fn test_defer_destroys_on_reaper() {
    let counters = Arc::new(Counters::default());
    let sp = Sp::new(Tracked::with(&counters, Finish::Defer, false));
    drop(sp);
    reaper::flush();
    assert_eq!(counts(&counters), (1, 1, 1));
}

#[test]
fn test_revival_from_extend() {
    let counters = Arc::new(Counters::default());
    let sp = Sp::new(Tracked::with(&counters, Finish::Extend, true));
    let wp = Sp::downgrade(&sp);
    drop(sp);

    let revived = wp.promote().expect("revival hook opted in");
    assert_eq!(Sp::strong_count(&revived), 1);
    assert!(Sp::ref_box(&revived).revived.load(Ordering::Relaxed));
    // Revival does not re-run the init hook.
    assert_eq!(counters.first.load(Ordering::SeqCst), 1);

    drop(revived);
    assert_eq!(counters.finish.load(Ordering::SeqCst), 2);
    drop(wp);
    assert_eq!(counters.dropped.load(Ordering::SeqCst), 1);
}

#[test]
fn test_revival_cancels_pending_deferred_destroy() {
    let counters = Arc::new(Counters::default());
    let sp = Sp::new(Tracked::with(&counters, Finish::Defer, true));
    let wp = Sp::downgrade(&sp);

    drop(sp);
    // Either the reaper already destroyed it, or the revival wins and the
    // reaper job becomes stale. Never both.
    match wp.promote() {
        Some(revived) => {
            reaper::flush();
            assert_eq!(counters.dropped.load(Ordering::SeqCst), 0);
            drop(revived);
            reaper::flush();
            assert_eq!(counters.dropped.load(Ordering::SeqCst), 1);
        }
        None => {
            reaper::flush();
            assert_eq!(counters.dropped.load(Ordering::SeqCst), 1);
        }
    }
}

// ============================================================================
// Contract violations
// ============================================================================

#[test]
#[should_panic(expected = "contract violation")]
fn test_double_strong_release_is_fatal() {
    let counters = Arc::new(Counters::default());
    let sp = Sp::new(Tracked::with(&counters, Finish::Extend, false));
    let wp = Sp::downgrade(&sp);
    let ptr = Sp::as_non_null(&sp);
    drop(sp);
    unsafe { RefBox::release_strong(ptr, Owner::next()) };
    drop(wp);
}

#[test]
#[should_panic(expected = "contract violation")]
fn test_acquire_strong_on_released_object_is_fatal() {
    let counters = Arc::new(Counters::default());
    let sp = Sp::new(Tracked::with(&counters, Finish::Extend, false));
    let wp = Sp::downgrade(&sp);
    drop(sp);
    wp.ref_box().acquire_strong(Owner::next());
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn test_racing_first_acquire_fires_init_once() {
    for _ in 0..50 {
        let counters = Arc::new(Counters::default());
        let wp = Wp::new(Tracked::with(&counters, Finish::Proceed, true));
        let holders: Vec<_> = thread::scope(|scope| {
            let handles: Vec<_> = (0..4).map(|_| scope.spawn(|| wp.promote())).collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(holders.iter().all(Option::is_some));
        assert_eq!(counters.first.load(Ordering::SeqCst), 1);
        assert_eq!(wp.strong_count(), 4);
    }
}

#[test]
fn test_concurrent_clone_drop_balances() {
    let counters = Arc::new(Counters::default());
    let sp = Sp::new(Tracked::new(&counters));
    thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                for _ in 0..1000 {
                    let local = sp.clone();
                    drop(local);
                }
            });
        }
    });
    assert_eq!(Sp::strong_count(&sp), 1);
    assert_eq!(Sp::weak_count(&sp), 1);
    assert_eq!(counts(&counters), (1, 0, 0));
}
