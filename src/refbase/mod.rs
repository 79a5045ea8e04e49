//! Dual strong/weak reference counting
//!
//! Design: one heap block ([`RefBox`]) carries both counters next to the
//! value, so the counter block is handed to the object at construction and
//! never has to be recovered from an address.
//!
//! - `strong` starts at [`INITIAL_BIAS`]; the acquire that observes exactly
//!   the bias removes it and fires [`RefHooks::on_first_ref`].
//! - Every strong reference also holds one weak reference.
//! - The value is destroyed when strong reaches zero (or later, see
//!   [`Finish`]); the block is freed when weak reaches zero.
//!
//! Negative counter values are private sentinels. A releaser moves `1` to
//! FINISHING while the finish hook runs, a reviver moves `0` to REVIVING while
//! the revival hook runs, and a destroyed value is marked DESTROYED. Every
//! transition out of zero is a compare-exchange, so a revival and a pending
//! deferred destruction can never both succeed.

mod pointer;
pub mod reaper;

#[cfg(test)]
mod tests;

pub use pointer::{Sp, Wp};

use crate::error::contract_violation;
use crate::instrument::{self, Owner, RefKind};
use crossbeam::utils::Backoff;
use std::cell::UnsafeCell;
use std::mem::ManuallyDrop;
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicBool, AtomicI32, AtomicU32, Ordering};

/// Added to `strong` before the first strong reference exists
pub const INITIAL_BIAS: i32 = 1 << 28;

const DESTROYED: i32 = i32::MIN;
const REVIVING: i32 = i32::MIN + 1;
const FINISHING: i32 = i32::MIN + 2;

/// Answer of [`RefHooks::on_last_strong_ref`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finish {
    /// Destroy the value now, on the releasing thread
    Proceed,
    /// Destroy the value on the deferred-destruction thread
    Defer,
    /// Keep the value; it is destroyed when the last weak reference goes
    Extend,
}

/// Lifecycle customization for counted objects. All hooks are optional.
///
/// Hooks run while the counter is held in a transitional state. They must not
/// try to promote a weak reference to the object they are running for.
pub trait RefHooks: Send + Sync + 'static {
    /// The first strong reference was just taken
    fn on_first_ref(&self) {}

    /// The last strong reference was just released
    fn on_last_strong_ref(&self) -> Finish {
        Finish::Proceed
    }

    /// A weak-to-strong promotion found no live strong reference.
    ///
    /// `never_acquired` is true when the object was never strongly held.
    /// Returning true revives the object. An object that was revived must
    /// not answer [`Finish::Proceed`] afterwards.
    fn on_try_acquire_failed(&self, never_acquired: bool) -> bool {
        let _ = never_acquired;
        false
    }
}

/// Counter block and value in one allocation
pub struct RefBox<T: RefHooks> {
    strong: AtomicI32,
    weak: AtomicI32,
    revived: AtomicBool,
    epoch: AtomicU32,
    value: UnsafeCell<ManuallyDrop<T>>,
}

// Safety: the value is only handed out as `&T` (T: Sync) and dropped exactly
// once under the counter protocol.
unsafe impl<T: RefHooks> Send for RefBox<T> {}
unsafe impl<T: RefHooks> Sync for RefBox<T> {}

impl<T: RefHooks> RefBox<T> {
    pub(crate) fn allocate(value: T) -> NonNull<Self> {
        let block = Box::new(RefBox {
            strong: AtomicI32::new(INITIAL_BIAS),
            weak: AtomicI32::new(0),
            revived: AtomicBool::new(false),
            epoch: AtomicU32::new(0),
            value: UnsafeCell::new(ManuallyDrop::new(value)),
        });
        NonNull::from(Box::leak(block))
    }

    /// Reinterpret an address previously published from a live block.
    ///
    /// # Safety
    /// `addr` must come from [`RefBox::addr`] of a block of this type on which
    /// the caller (directly or through the transport) still holds a weak
    /// reference.
    pub(crate) unsafe fn from_addr<'a>(addr: usize) -> &'a Self {
        &*(addr as *const Self)
    }

    /// Object identity: the address of the counter block
    pub fn addr(&self) -> usize {
        self as *const Self as usize
    }

    /// Access the value.
    ///
    /// Only called while a strong reference or a transitional state keeps the
    /// value alive.
    #[inline]
    pub(crate) fn value(&self) -> &T {
        // Safety: callers guarantee the value has not been destroyed.
        unsafe { &*self.value.get() }
    }

    /// Snapshot of the strong count; stale as soon as it returns
    pub fn strong_count(&self) -> i32 {
        match self.strong.load(Ordering::Relaxed) {
            DESTROYED | REVIVING | FINISHING => 0,
            count => count,
        }
    }

    /// Snapshot of the weak count; stale as soon as it returns
    pub fn weak_count(&self) -> i32 {
        self.weak.load(Ordering::Relaxed)
    }

    /// True until the first strong reference has been taken
    pub fn never_acquired(&self) -> bool {
        self.strong.load(Ordering::Relaxed) >= INITIAL_BIAS
    }

    fn violation(&self, what: &str) -> ! {
        contract_violation(
            self.addr(),
            what,
            self.strong.load(Ordering::Relaxed),
            self.weak.load(Ordering::Relaxed),
        )
    }

    /// Take a strong reference. Returns the new strong count.
    ///
    /// Taking a strong reference on an object with no strong holders is a
    /// contract violation; use [`RefBox::try_acquire_strong`] from a weak one.
    pub fn acquire_strong(&self, owner: Owner) -> i32 {
        self.acquire_weak_unchecked(owner);
        let old = self.strong.fetch_add(1, Ordering::Relaxed);
        if old <= 0 {
            self.violation("strong acquire on an object without strong references");
        }
        instrument::acquired(self.addr(), RefKind::Strong, owner);

        if old != INITIAL_BIAS {
            return unbiased(old + 1);
        }

        let count = self.strong.fetch_sub(INITIAL_BIAS, Ordering::Relaxed) - INITIAL_BIAS;
        self.value().on_first_ref();
        count
    }

    /// Release a strong reference. Returns the remaining strong count.
    ///
    /// # Safety
    /// `this` must point to a live block and the caller must own the strong
    /// reference being released. The block may be freed before this returns.
    pub unsafe fn release_strong(this: NonNull<Self>, owner: Owner) -> i32 {
        let block = this.as_ref();
        let mut current = block.strong.load(Ordering::Relaxed);
        loop {
            if current <= 0 || current == INITIAL_BIAS {
                block.violation("strong release without a matching acquire");
            }
            let next = if current == 1 { FINISHING } else { current - 1 };
            match block.strong.compare_exchange_weak(
                current,
                next,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        instrument::released(block.addr(), RefKind::Strong, owner);

        let remaining = if current == 1 {
            fence(Ordering::Acquire);
            block.finish();
            0
        } else {
            unbiased(current - 1)
        };

        Self::release_weak(this, owner);
        remaining
    }

    /// Run the finish hook with `strong` parked at FINISHING
    fn finish(&self) {
        let decision = self.value().on_last_strong_ref();
        self.epoch.fetch_add(1, Ordering::Relaxed);

        if cfg!(debug_assertions)
            && decision == Finish::Proceed
            && self.revived.load(Ordering::Relaxed)
        {
            self.violation("revived object answered Proceed from its finish hook");
        }

        match decision {
            Finish::Proceed => {
                self.strong.store(DESTROYED, Ordering::Release);
                // Safety: strong is DESTROYED, nothing can reach the value again.
                unsafe { self.destroy_value() };
            }
            Finish::Defer => {
                // The queued job keeps the block alive.
                self.acquire_weak_unchecked(Owner::REAPER);
                let epoch = self.epoch.load(Ordering::Relaxed);
                self.strong.store(0, Ordering::Release);
                reaper::schedule(reaper::DeferredDestroy::new::<T>(
                    NonNull::from(self),
                    epoch,
                ));
            }
            Finish::Extend => {
                self.strong.store(0, Ordering::Release);
            }
        }
    }

    /// Deferred destruction entry point, run by the reaper.
    ///
    /// # Safety
    /// `this` must carry the weak reference taken by [`RefBox::finish`].
    pub(crate) unsafe fn run_deferred(this: NonNull<Self>, epoch: u32) {
        let block = this.as_ref();
        let backoff = Backoff::new();
        loop {
            match block.strong.compare_exchange(
                0,
                FINISHING,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    if block.epoch.load(Ordering::Relaxed) == epoch {
                        block.strong.store(DESTROYED, Ordering::Release);
                        block.destroy_value();
                    } else {
                        // A newer decision owns the object now.
                        block.strong.store(0, Ordering::Release);
                    }
                    break;
                }
                Err(FINISHING) | Err(REVIVING) => backoff.snooze(),
                // Revived (or already destroyed by a newer job): nothing to do.
                Err(_) => break,
            }
        }
        Self::release_weak(this, Owner::REAPER);
    }

    /// Promote a weak reference the caller holds into a strong one.
    ///
    /// Succeeds without consulting hooks only while the strong count is in
    /// the open range `0 < strong < INITIAL_BIAS`. Otherwise
    /// [`RefHooks::on_try_acquire_failed`] decides, unless the value is
    /// already destroyed.
    pub fn try_acquire_strong(&self, owner: Owner) -> bool {
        let backoff = Backoff::new();
        let mut hook_approved = false;
        let mut current = self.strong.load(Ordering::Relaxed);
        loop {
            match current {
                DESTROYED => return false,
                FINISHING | REVIVING => {
                    backoff.snooze();
                    current = self.strong.load(Ordering::Relaxed);
                }
                0 => {
                    match self.strong.compare_exchange(
                        0,
                        REVIVING,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => return self.revive(owner),
                        Err(actual) => current = actual,
                    }
                }
                c if c < 0 => self.violation("corrupted strong count"),
                c if c >= INITIAL_BIAS && !hook_approved => {
                    if !self.value().on_try_acquire_failed(true) {
                        return false;
                    }
                    hook_approved = true;
                    current = self.strong.load(Ordering::Relaxed);
                }
                c => {
                    if let Err(actual) = self.strong.compare_exchange_weak(
                        c,
                        c + 1,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    ) {
                        current = actual;
                        continue;
                    }
                    self.acquire_weak_unchecked(owner);
                    instrument::acquired(self.addr(), RefKind::Strong, owner);
                    if c == INITIAL_BIAS {
                        self.strong.fetch_sub(INITIAL_BIAS, Ordering::Relaxed);
                        self.value().on_first_ref();
                    }
                    return true;
                }
            }
        }
    }

    /// Called with `strong` parked at REVIVING
    fn revive(&self, owner: Owner) -> bool {
        if !self.value().on_try_acquire_failed(false) {
            self.strong.store(0, Ordering::Release);
            return false;
        }
        self.acquire_weak_unchecked(owner);
        self.revived.store(true, Ordering::Relaxed);
        self.epoch.fetch_add(1, Ordering::Relaxed);
        self.strong.store(1, Ordering::Release);
        instrument::acquired(self.addr(), RefKind::Strong, owner);
        tracing::trace!(
            target: "bindery::refbase",
            object = format_args!("{:#x}", self.addr()),
            "object revived"
        );
        true
    }

    /// Give back a strong reference while the count is positive.
    ///
    /// Returns false, touching nothing, when no strong reference is held
    /// (zero, still biased, or mid-finish). Releasing the last one runs the
    /// finish hook exactly as [`RefBox::release_strong`] does.
    ///
    /// # Safety
    /// As for [`RefBox::release_strong`]. On `true` the caller's reference is
    /// gone and the block may already be freed.
    pub unsafe fn try_release_strong(this: NonNull<Self>, owner: Owner) -> bool {
        let block = this.as_ref();
        let mut current = block.strong.load(Ordering::Relaxed);
        loop {
            if current <= 0 || current >= INITIAL_BIAS {
                return false;
            }
            let next = if current == 1 { FINISHING } else { current - 1 };
            match block.strong.compare_exchange_weak(
                current,
                next,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        instrument::released(block.addr(), RefKind::Strong, owner);
        if current == 1 {
            fence(Ordering::Acquire);
            block.finish();
        }
        Self::release_weak(this, owner);
        true
    }

    /// Take a weak reference. Returns the new weak count.
    pub fn acquire_weak(&self, owner: Owner) -> i32 {
        let old = self.weak.fetch_add(1, Ordering::Relaxed);
        if old < 0 || (old == 0 && !self.never_acquired()) {
            self.violation("weak acquire on a released object");
        }
        instrument::acquired(self.addr(), RefKind::Weak, owner);
        old + 1
    }

    fn acquire_weak_unchecked(&self, owner: Owner) {
        let old = self.weak.fetch_add(1, Ordering::Relaxed);
        if old < 0 {
            self.violation("weak count corrupted");
        }
        instrument::acquired(self.addr(), RefKind::Weak, owner);
    }

    /// Take a weak reference only if one is still held somewhere
    pub fn try_acquire_weak(&self, owner: Owner) -> bool {
        let mut current = self.weak.load(Ordering::Relaxed);
        loop {
            if current <= 0 {
                return false;
            }
            match self.weak.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    instrument::acquired(self.addr(), RefKind::Weak, owner);
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Release a weak reference. Returns the remaining weak count.
    ///
    /// # Safety
    /// `this` must point to a live block and the caller must own the weak
    /// reference being released. The block is freed when this was the last.
    pub unsafe fn release_weak(this: NonNull<Self>, owner: Owner) -> i32 {
        let block = this.as_ref();
        let old = block.weak.fetch_sub(1, Ordering::Release);
        if old <= 0 {
            block.violation("weak release without a matching acquire");
        }
        instrument::released(block.addr(), RefKind::Weak, owner);
        if old != 1 {
            return old - 1;
        }

        fence(Ordering::Acquire);
        let strong = block.strong.load(Ordering::Relaxed);
        if strong != DESTROYED && strong != 0 && strong != INITIAL_BIAS {
            block.violation("last weak reference released while strong references remain");
        }
        if strong != DESTROYED {
            block.destroy_value();
        }

        let addr = block.addr();
        drop(Box::from_raw(this.as_ptr()));
        instrument::freed(addr);
        0
    }

    /// # Safety
    /// Must be called exactly once, after every path to the value is closed.
    unsafe fn destroy_value(&self) {
        ManuallyDrop::drop(&mut *self.value.get());
        instrument::destroyed(self.addr());
    }
}

/// Hide the bias while a first acquisition is still in flight
#[inline]
fn unbiased(count: i32) -> i32 {
    if count > INITIAL_BIAS {
        count - INITIAL_BIAS
    } else {
        count
    }
}
