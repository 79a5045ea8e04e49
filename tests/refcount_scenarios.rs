//! Reference counting scenarios across threads

use bindery::refbase::reaper;
use bindery::{Finish, RefHooks, Sp, Wp};
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

#[derive(Default)]
struct Counters {
    first: AtomicUsize,
    finish: AtomicUsize,
    dropped: AtomicUsize,
}

struct Object {
    counters: Arc<Counters>,
    finish: Finish,
    revive: bool,
}

impl Object {
    fn new(counters: &Arc<Counters>, finish: Finish, revive: bool) -> Self {
        Object {
            counters: Arc::clone(counters),
            finish,
            revive,
        }
    }
}

impl RefHooks for Object {
    fn on_first_ref(&self) {
        self.counters.first.fetch_add(1, Ordering::SeqCst);
    }

    fn on_last_strong_ref(&self) -> Finish {
        self.counters.finish.fetch_add(1, Ordering::SeqCst);
        self.finish
    }

    fn on_try_acquire_failed(&self, never_acquired: bool) -> bool {
        !never_acquired && self.revive
    }
}

impl Drop for Object {
    fn drop(&mut self) {
        self.counters.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_three_threads_balance_to_one() {
    let counters = Arc::new(Counters::default());
    let sp = Sp::new(Object::new(&counters, Finish::Proceed, false));

    thread::scope(|scope| {
        for _ in 0..3 {
            scope.spawn(|| {
                for _ in 0..1000 {
                    let extra = sp.clone();
                    drop(extra);
                }
            });
        }
    });

    assert_eq!(Sp::strong_count(&sp), 1);
    assert_eq!(counters.first.load(Ordering::SeqCst), 1);
    assert_eq!(counters.finish.load(Ordering::SeqCst), 0);
    assert_eq!(counters.dropped.load(Ordering::SeqCst), 0);

    drop(sp);
    assert_eq!(counters.finish.load(Ordering::SeqCst), 1);
    assert_eq!(counters.dropped.load(Ordering::SeqCst), 1);
}

#[test]
fn test_deferred_destroy_races_revival() {
    for _ in 0..200 {
        let counters = Arc::new(Counters::default());
        let sp = Sp::new(Object::new(&counters, Finish::Defer, true));
        let wp = Sp::downgrade(&sp);

        let promoted = thread::scope(|scope| {
            let promoter = scope.spawn(|| wp.promote().map(drop).is_some());
            drop(sp);
            promoter.join().unwrap()
        });

        reaper::flush();
        drop(wp);
        reaper::flush();

        // Whatever interleaving happened, the value dies exactly once.
        assert_eq!(counters.dropped.load(Ordering::SeqCst), 1);
        assert!(counters.finish.load(Ordering::SeqCst) >= 1);
        if !promoted {
            assert_eq!(counters.finish.load(Ordering::SeqCst), 1);
        }
    }
}

#[test]
fn test_extend_then_revive_keeps_one_value() {
    let counters = Arc::new(Counters::default());
    let sp = Sp::new(Object::new(&counters, Finish::Extend, true));
    let wp = Sp::downgrade(&sp);
    drop(sp);
    assert_eq!(counters.dropped.load(Ordering::SeqCst), 0);

    let revived = wp.promote().unwrap();
    assert_eq!(Sp::strong_count(&revived), 1);
    assert_eq!(counters.first.load(Ordering::SeqCst), 1);
    drop(revived);
    assert_eq!(counters.finish.load(Ordering::SeqCst), 2);

    drop(wp);
    assert_eq!(counters.dropped.load(Ordering::SeqCst), 1);
}

#[derive(Debug, Clone)]
enum Op {
    Clone,
    DropStrong,
    Downgrade,
    Promote,
    DropWeak,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::Clone),
        Just(Op::DropStrong),
        Just(Op::Downgrade),
        Just(Op::Promote),
        Just(Op::DropWeak),
    ]
}

proptest! {
    #[test]
    fn prop_counts_track_live_handles(ops in prop::collection::vec(op(), 1..64)) {
        let counters = Arc::new(Counters::default());
        let mut strong = vec![Sp::new(Object::new(&counters, Finish::Proceed, false))];
        let mut weak: Vec<Wp<Object>> = Vec::new();
        let mut destroyed = false;

        for op in ops {
            match op {
                Op::Clone => {
                    if let Some(sp) = strong.first().cloned() {
                        strong.push(sp);
                    }
                }
                Op::DropStrong => {
                    strong.pop();
                }
                Op::Downgrade => {
                    if let Some(sp) = strong.first() {
                        weak.push(Sp::downgrade(sp));
                    }
                }
                Op::Promote => {
                    if let Some(wp) = weak.first() {
                        match wp.promote() {
                            Some(sp) => strong.push(sp),
                            None => prop_assert!(destroyed),
                        }
                    }
                }
                Op::DropWeak => {
                    weak.pop();
                }
            }
            if strong.is_empty() {
                destroyed = true;
            }
            prop_assert_eq!(counters.dropped.load(Ordering::SeqCst), usize::from(destroyed));
            if let Some(sp) = strong.first() {
                prop_assert_eq!(Sp::strong_count(sp) as usize, strong.len());
            }
            if let Some(wp) = weak.first() {
                prop_assert_eq!(wp.strong_count() as usize, strong.len());
            }
        }

        drop(strong);
        drop(weak);
        prop_assert_eq!(counters.dropped.load(Ordering::SeqCst), 1);
        prop_assert_eq!(counters.first.load(Ordering::SeqCst), 1);
    }
}
