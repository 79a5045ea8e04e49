//! Handle to proxy table
//!
//! At most one live proxy exists per handle. Slots hold a raw pointer to the
//! proxy's counter block and no reference of their own: the proxy clears its
//! slot when its memory goes away. Lookups therefore take a weak reference
//! under the lock with `try_acquire_weak`, which fails once the block is on
//! its way out.

use super::Process;
use crate::binder::{BinderObject, Proxy, StrongBinder, WeakBinder};
use crate::error::IpcError;
use crate::instrument::Owner;
use crate::logging;
use crate::protocol::Handle;
use crate::refbase::{RefBox, Wp};
use parking_lot::Mutex;
use std::ptr::NonNull;
use std::sync::Arc;

struct Slot {
    block: NonNull<RefBox<BinderObject>>,
}

// Safety: the pointer is only dereferenced under the registry lock, and the
// block is Send + Sync.
unsafe impl Send for Slot {}

impl Slot {
    fn identity(&self) -> usize {
        self.block.as_ptr() as usize
    }

    /// Weak reference to the slot's proxy, unless its memory is being freed.
    ///
    /// Must run under the registry lock: the proxy's drop clears the slot
    /// under the same lock before the block is freed.
    fn try_weak(&self) -> Option<WeakBinder> {
        // Safety: see above; the block is still allocated while the slot is set.
        let block = unsafe { self.block.as_ref() };
        let owner = Owner::next();
        if block.try_acquire_weak(owner) {
            // Safety: the weak reference was just taken for `owner`.
            Some(unsafe { Wp::from_acquired(self.block, owner) })
        } else {
            None
        }
    }
}

#[derive(Default)]
pub(crate) struct HandleRegistry {
    slots: Mutex<Vec<Option<Slot>>>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup(&self, handle: Handle) -> Option<WeakBinder> {
        let slots = self.slots.lock();
        slots.get(handle as usize)?.as_ref()?.try_weak()
    }

    /// Strong reference to the proxy for `handle`, creating or reviving it
    pub fn proxy_for_handle(
        &self,
        process: &Arc<Process>,
        handle: Handle,
    ) -> Result<StrongBinder, IpcError> {
        let mut stale = None;
        loop {
            // References are promoted and dropped outside the lock: both may
            // run hooks that talk to the transport or clear a slot.
            if let Some(weak) = self.lookup(handle) {
                if let Some(strong) = weak.promote() {
                    return Ok(strong);
                }
                stale = Some(weak.addr());
            }
            let weak = self.install(process, handle, stale);
            if let Some(strong) = weak.promote() {
                return Ok(strong);
            }
            stale = Some(weak.addr());
        }
    }

    /// Weak reference to the proxy for `handle`, creating it if needed.
    /// A fresh proxy stays unacquired until promoted.
    pub fn weak_proxy_for_handle(&self, process: &Arc<Process>, handle: Handle) -> WeakBinder {
        match self.lookup(handle) {
            Some(weak) => weak,
            None => self.install(process, handle, None),
        }
    }

    /// Put a fresh proxy in the slot unless a usable one appeared meanwhile.
    /// `stale` names a proxy that refused promotion and may be replaced.
    fn install(&self, process: &Arc<Process>, handle: Handle, stale: Option<usize>) -> WeakBinder {
        let candidate = Wp::new(BinderObject::Remote(Proxy::new(handle, Arc::clone(process))));
        if let BinderObject::Remote(proxy) = candidate.ref_box().value() {
            proxy.set_identity(candidate.addr());
        }

        let mut slots = self.slots.lock();
        let index = handle as usize;
        if slots.len() <= index {
            slots.resize_with(index + 1, || None);
        }
        let existing = slots[index]
            .as_ref()
            .and_then(|slot| slot.try_weak().map(|weak| (slot.identity(), weak)));
        let replaced = match existing {
            Some((identity, existing)) => {
                if stale != Some(identity) || existing.strong_count() > 0 {
                    drop(slots);
                    drop(candidate);
                    return existing;
                }
                Some(existing)
            }
            None => None,
        };
        slots[index] = Some(Slot {
            block: candidate.as_non_null(),
        });
        drop(slots);
        drop(replaced);
        logging::log_proxy_created(handle, candidate.addr());
        candidate
    }

    /// Clear the slot for `handle` if it still belongs to `identity`
    pub fn expunge(&self, handle: Handle, identity: usize) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(handle as usize) {
            if slot.as_ref().map_or(false, |s| s.identity() == identity) {
                *slot = None;
            }
        }
    }

    /// Number of occupied slots
    pub fn len(&self) -> usize {
        self.slots.lock().iter().filter(|slot| slot.is_some()).count()
    }
}
