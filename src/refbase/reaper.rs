//! Deferred destruction queue
//!
//! Objects whose finish hook answers [`super::Finish::Defer`] are destroyed
//! here, away from whatever locks the releasing thread held. One worker
//! thread, started on first use, drains a bounded queue. A full queue blocks
//! the releasing thread until the worker catches up.

use super::{RefBox, RefHooks};
use flume::{Receiver, Sender};
use once_cell::sync::Lazy;
use std::ptr::NonNull;
use std::thread::{self, ThreadId};

const QUEUE_DEPTH: usize = 1024;

/// One pending destruction; owns a weak reference on the object
pub(crate) struct DeferredDestroy {
    object: NonNull<()>,
    epoch: u32,
    run: unsafe fn(NonNull<()>, u32),
}

// Safety: the object type is Send + Sync (RefHooks bound) and the job owns a
// weak reference, so the pointer stays valid on whichever thread runs it.
unsafe impl Send for DeferredDestroy {}

impl DeferredDestroy {
    pub(crate) fn new<T: RefHooks>(object: NonNull<RefBox<T>>, epoch: u32) -> Self {
        unsafe fn run<T: RefHooks>(object: NonNull<()>, epoch: u32) {
            RefBox::<T>::run_deferred(object.cast(), epoch);
        }
        DeferredDestroy {
            object: object.cast(),
            epoch,
            run: run::<T>,
        }
    }

    fn execute(self) {
        // Safety: `run` was instantiated for the object's real type.
        unsafe { (self.run)(self.object, self.epoch) }
    }
}

enum Job {
    Destroy(DeferredDestroy),
    Flush(Sender<()>),
}

struct Reaper {
    sender: Option<Sender<Job>>,
    thread: Option<ThreadId>,
}

static REAPER: Lazy<Reaper> = Lazy::new(Reaper::start);

impl Reaper {
    fn start() -> Self {
        let (sender, receiver) = flume::bounded(QUEUE_DEPTH);
        match thread::Builder::new()
            .name("bindery-reaper".into())
            .spawn(move || Reaper::run(receiver))
        {
            Ok(handle) => Reaper {
                sender: Some(sender),
                thread: Some(handle.thread().id()),
            },
            Err(e) => {
                tracing::warn!(
                    target: "bindery::refbase",
                    error = %e,
                    "reaper thread unavailable, deferred destruction runs inline"
                );
                Reaper {
                    sender: None,
                    thread: None,
                }
            }
        }
    }

    fn run(receiver: Receiver<Job>) {
        for job in receiver.iter() {
            match job {
                Job::Destroy(job) => job.execute(),
                Job::Flush(ack) => {
                    let _ = ack.send(());
                }
            }
        }
    }

    fn on_worker(&self) -> bool {
        self.thread == Some(thread::current().id())
    }
}

/// Queue a destruction; runs inline when called from the worker itself
pub(crate) fn schedule(job: DeferredDestroy) {
    let reaper = &*REAPER;
    if reaper.on_worker() {
        job.execute();
        return;
    }
    let Some(sender) = reaper.sender.as_ref() else {
        job.execute();
        return;
    };
    if let Err(flume::SendError(Job::Destroy(job))) = sender.send(Job::Destroy(job)) {
        job.execute();
    }
}

/// Block until every destruction queued before this call has run
pub fn flush() {
    let reaper = &*REAPER;
    if reaper.on_worker() {
        return;
    }
    let Some(sender) = reaper.sender.as_ref() else {
        return;
    };
    let (ack, done) = flume::bounded(1);
    if sender.send(Job::Flush(ack)).is_ok() {
        let _ = done.recv();
    }
}

/// True when called on the deferred-destruction worker
pub fn is_reaper_thread() -> bool {
    REAPER.on_worker()
}
