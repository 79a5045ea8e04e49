//! Strong-only counted objects for process-local helpers
//!
//! Same first-reference bias as [`crate::refbase`] on a single counter. No
//! weak references, no revival, no deferred destruction: the value is
//! dropped on the thread that releases the last reference.

use crate::error::contract_violation;
use crate::instrument::{self, Owner, RefKind};
use crate::refbase::INITIAL_BIAS;
use std::fmt;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicI32, Ordering};

pub trait LightHooks: Send + Sync + 'static {
    fn on_first_ref(&self) {}
}

struct LightBox<T> {
    strong: AtomicI32,
    value: T,
}

/// Strong-only counted pointer
pub struct LightRc<T: LightHooks> {
    ptr: NonNull<LightBox<T>>,
    owner: Owner,
}

unsafe impl<T: LightHooks> Send for LightRc<T> {}
unsafe impl<T: LightHooks> Sync for LightRc<T> {}

impl<T: LightHooks> LightRc<T> {
    pub fn new(value: T) -> Self {
        let ptr = NonNull::from(Box::leak(Box::new(LightBox {
            strong: AtomicI32::new(INITIAL_BIAS),
            value,
        })));
        let rc = LightRc {
            ptr,
            owner: Owner::next(),
        };
        rc.acquire(rc.owner);
        rc
    }

    fn block(&self) -> &LightBox<T> {
        // Safety: a live LightRc holds a strong reference.
        unsafe { self.ptr.as_ref() }
    }

    fn acquire(&self, owner: Owner) {
        let block = self.block();
        let old = block.strong.fetch_add(1, Ordering::Relaxed);
        if old <= 0 {
            contract_violation(self.addr(), "light acquire on a destroyed object", old, 0);
        }
        instrument::acquired(self.addr(), RefKind::Strong, owner);
        if old == INITIAL_BIAS {
            block.strong.fetch_sub(INITIAL_BIAS, Ordering::Relaxed);
            block.value.on_first_ref();
        }
    }

    pub fn strong_count(this: &Self) -> i32 {
        this.block().strong.load(Ordering::Relaxed)
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        a.ptr == b.ptr
    }

    fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }
}

impl<T: LightHooks> Clone for LightRc<T> {
    fn clone(&self) -> Self {
        let owner = Owner::next();
        self.acquire(owner);
        LightRc {
            ptr: self.ptr,
            owner,
        }
    }
}

impl<T: LightHooks> Drop for LightRc<T> {
    fn drop(&mut self) {
        let addr = self.addr();
        let old = self.block().strong.fetch_sub(1, Ordering::Release);
        if old <= 0 || old == INITIAL_BIAS {
            contract_violation(addr, "light release without a matching acquire", old, 0);
        }
        instrument::released(addr, RefKind::Strong, self.owner);
        if old != 1 {
            return;
        }
        fence(Ordering::Acquire);
        // Safety: last reference; nobody else can reach the block.
        drop(unsafe { Box::from_raw(self.ptr.as_ptr()) });
        instrument::destroyed(addr);
        instrument::freed(addr);
    }
}

impl<T: LightHooks> Deref for LightRc<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.block().value
    }
}

impl<T: LightHooks + fmt::Debug> fmt::Debug for LightRc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LightRc").field(&**self).finish()
    }
}
