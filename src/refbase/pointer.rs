//! Owning handles over [`RefBox`]

use super::{RefBox, RefHooks};
use crate::instrument::Owner;
use std::fmt;
use std::ops::Deref;
use std::ptr::NonNull;

/// Strong reference: keeps the value alive and initialized
pub struct Sp<T: RefHooks> {
    ptr: NonNull<RefBox<T>>,
    owner: Owner,
}

// Safety: RefHooks requires Send + Sync and the counters are atomic.
unsafe impl<T: RefHooks> Send for Sp<T> {}
unsafe impl<T: RefHooks> Sync for Sp<T> {}

impl<T: RefHooks> Sp<T> {
    /// Allocate and take the first strong reference (fires `on_first_ref`)
    pub fn new(value: T) -> Self {
        let ptr = RefBox::allocate(value);
        let owner = Owner::next();
        // Safety: freshly allocated, nobody else can see it.
        unsafe { ptr.as_ref() }.acquire_strong(owner);
        Sp { ptr, owner }
    }

    /// Adopt a strong reference that was already acquired for `owner`.
    ///
    /// # Safety
    /// The caller transfers exactly one strong reference taken with `owner`.
    pub(crate) unsafe fn from_acquired(ptr: NonNull<RefBox<T>>, owner: Owner) -> Self {
        Sp { ptr, owner }
    }

    pub fn downgrade(this: &Self) -> Wp<T> {
        let owner = Owner::next();
        Sp::ref_box(this).acquire_weak(owner);
        Wp {
            ptr: this.ptr,
            owner,
        }
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        a.ptr == b.ptr
    }

    /// Object identity (address of the counter block)
    pub fn addr(this: &Self) -> usize {
        this.ptr.as_ptr() as usize
    }

    pub fn strong_count(this: &Self) -> i32 {
        Sp::ref_box(this).strong_count()
    }

    pub fn weak_count(this: &Self) -> i32 {
        Sp::ref_box(this).weak_count()
    }

    pub fn ref_box(this: &Self) -> &RefBox<T> {
        // Safety: a strong reference keeps the block alive.
        unsafe { this.ptr.as_ref() }
    }

    pub(crate) fn as_non_null(this: &Self) -> NonNull<RefBox<T>> {
        this.ptr
    }
}

impl<T: RefHooks> Clone for Sp<T> {
    fn clone(&self) -> Self {
        let owner = Owner::next();
        Sp::ref_box(self).acquire_strong(owner);
        Sp {
            ptr: self.ptr,
            owner,
        }
    }
}

impl<T: RefHooks> Drop for Sp<T> {
    fn drop(&mut self) {
        // Safety: we own one strong reference taken with `self.owner`.
        unsafe { RefBox::release_strong(self.ptr, self.owner) };
    }
}

impl<T: RefHooks> Deref for Sp<T> {
    type Target = T;

    fn deref(&self) -> &T {
        Sp::ref_box(self).value()
    }
}

impl<T: RefHooks + fmt::Debug> fmt::Debug for Sp<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sp")
            .field("addr", &format_args!("{:#x}", Sp::addr(self)))
            .field("value", &**self)
            .finish()
    }
}

/// Weak reference: keeps the memory valid, not the value alive
pub struct Wp<T: RefHooks> {
    ptr: NonNull<RefBox<T>>,
    owner: Owner,
}

unsafe impl<T: RefHooks> Send for Wp<T> {}
unsafe impl<T: RefHooks> Sync for Wp<T> {}

impl<T: RefHooks> Wp<T> {
    /// Allocate holding only a weak reference; the value stays un-initialized
    /// in the `on_first_ref` sense until promoted
    pub fn new(value: T) -> Self {
        let ptr = RefBox::allocate(value);
        let owner = Owner::next();
        // Safety: freshly allocated.
        unsafe { ptr.as_ref() }.acquire_weak(owner);
        Wp { ptr, owner }
    }

    /// # Safety
    /// The caller transfers exactly one weak reference taken with `owner`.
    pub(crate) unsafe fn from_acquired(ptr: NonNull<RefBox<T>>, owner: Owner) -> Self {
        Wp { ptr, owner }
    }

    /// Try to obtain a strong reference (`TryAcquireStrong`)
    pub fn promote(&self) -> Option<Sp<T>> {
        let owner = Owner::next();
        if self.ref_box().try_acquire_strong(owner) {
            // Safety: the strong reference was just taken for `owner`.
            Some(unsafe { Sp::from_acquired(self.ptr, owner) })
        } else {
            None
        }
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        a.ptr == b.ptr
    }

    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub fn strong_count(&self) -> i32 {
        self.ref_box().strong_count()
    }

    pub fn weak_count(&self) -> i32 {
        self.ref_box().weak_count()
    }

    pub fn ref_box(&self) -> &RefBox<T> {
        // Safety: a weak reference keeps the block allocated.
        unsafe { self.ptr.as_ref() }
    }

    pub(crate) fn as_non_null(&self) -> NonNull<RefBox<T>> {
        self.ptr
    }
}

impl<T: RefHooks> Clone for Wp<T> {
    fn clone(&self) -> Self {
        let owner = Owner::next();
        self.ref_box().acquire_weak(owner);
        Wp {
            ptr: self.ptr,
            owner,
        }
    }
}

impl<T: RefHooks> Drop for Wp<T> {
    fn drop(&mut self) {
        // Safety: we own one weak reference taken with `self.owner`.
        unsafe { RefBox::release_weak(self.ptr, self.owner) };
    }
}

impl<T: RefHooks> fmt::Debug for Wp<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wp")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("strong", &self.strong_count())
            .field("weak", &self.weak_count())
            .finish()
    }
}
