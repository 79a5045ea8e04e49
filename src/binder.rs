//! Binder objects
//!
//! A [`StrongBinder`] points either at a service hosted by this process
//! ([`BinderObject::Local`]) or at a [`Proxy`] standing in for an object in
//! another process. Both answer [`BinderObject::transact`]; callers never need
//! to know which one they hold.

use crate::error::IpcError;
use crate::payload::Payload;
use crate::process::Process;
use crate::protocol::{Handle, CONTEXT_MANAGER_HANDLE, FLAG_ONEWAY};
use crate::refbase::{Finish, RefHooks, Sp, Wp};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Liveness probe answered by every object without reaching its handler
pub const PING_TRANSACTION: u32 = u32::from_be_bytes(*b"_PNG");

/// Asks an object for its interface descriptor
pub const INTERFACE_TRANSACTION: u32 = u32::from_be_bytes(*b"_NTF");

/// Context-object lookup, served by the context manager
pub const GET_CONTEXT_OBJECT: u32 = u32::from_be_bytes(*b"_CTX");

/// First code available to application protocols
pub const FIRST_CALL_TRANSACTION: u32 = 1;

/// Identity of the process that sent the transaction being handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallerInfo {
    pub pid: u32,
    pub euid: u32,
    pub priority: i32,
}

impl CallerInfo {
    /// The calling process itself, for direct local calls
    pub fn local() -> Self {
        CallerInfo {
            pid: std::process::id(),
            euid: 0,
            priority: 0,
        }
    }
}

/// A service that can be published to other processes.
///
/// Handlers run on pool threads; any number may be executing at once.
pub trait Binder: Send + Sync + 'static {
    fn descriptor(&self) -> &str;

    fn on_transact(
        &self,
        code: u32,
        data: &Payload,
        reply: &mut Payload,
        caller: &CallerInfo,
    ) -> Result<(), IpcError>;

    /// First strong reference taken, locally or by a remote process
    fn on_first_ref(&self) {}

    /// Last strong reference gone. See [`RefHooks::on_last_strong_ref`].
    fn on_last_strong_ref(&self) -> Finish {
        Finish::Proceed
    }

    fn on_try_acquire_failed(&self, never_acquired: bool) -> bool {
        let _ = never_acquired;
        false
    }
}

pub enum BinderObject {
    Local(Box<dyn Binder>),
    Remote(Proxy),
}

pub type StrongBinder = Sp<BinderObject>;
pub type WeakBinder = Wp<BinderObject>;

impl BinderObject {
    /// Wrap a local service in its first strong reference
    pub fn local(binder: impl Binder) -> StrongBinder {
        Sp::new(BinderObject::Local(Box::new(binder)))
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }

    pub fn as_local(&self) -> Option<&dyn Binder> {
        match self {
            Self::Local(binder) => Some(binder.as_ref()),
            Self::Remote(_) => None,
        }
    }

    pub fn as_proxy(&self) -> Option<&Proxy> {
        match self {
            Self::Local(_) => None,
            Self::Remote(proxy) => Some(proxy),
        }
    }

    /// Send a transaction and wait for its reply.
    ///
    /// One-way calls (`FLAG_ONEWAY`) return an empty payload as soon as the
    /// transport accepted them.
    pub fn transact(&self, code: u32, data: &Payload, flags: u32) -> Result<Payload, IpcError> {
        match self {
            Self::Local(_) => {
                let mut reply = Payload::new();
                let result = self.dispatch(code, data, &mut reply, &CallerInfo::local());
                if flags & FLAG_ONEWAY != 0 {
                    return Ok(Payload::new());
                }
                result.map(|()| reply)
            }
            Self::Remote(proxy) => proxy.transact(code, data, flags),
        }
    }

    pub fn ping(&self) -> Result<(), IpcError> {
        self.transact(PING_TRANSACTION, &Payload::new(), 0).map(|_| ())
    }

    /// Descriptor of the object's interface, asking the owner when remote
    pub fn interface_descriptor(&self) -> Result<String, IpcError> {
        match self {
            Self::Local(binder) => Ok(binder.descriptor().to_string()),
            Self::Remote(proxy) => {
                let reply = proxy.transact(INTERFACE_TRANSACTION, &Payload::new(), 0)?;
                reply.as_str().map(str::to_string)
            }
        }
    }

    /// Run an inbound transaction against a local object
    pub(crate) fn dispatch(
        &self,
        code: u32,
        data: &Payload,
        reply: &mut Payload,
        caller: &CallerInfo,
    ) -> Result<(), IpcError> {
        let Self::Local(binder) = self else {
            return Err(IpcError::FailedTransaction);
        };
        match code {
            PING_TRANSACTION => Ok(()),
            INTERFACE_TRANSACTION => {
                reply.write_bytes(binder.descriptor().as_bytes());
                Ok(())
            }
            _ => binder.on_transact(code, data, reply, caller),
        }
    }
}

impl RefHooks for BinderObject {
    fn on_first_ref(&self) {
        match self {
            Self::Local(binder) => binder.on_first_ref(),
            Self::Remote(proxy) => proxy.acquire_remote(),
        }
    }

    fn on_last_strong_ref(&self) -> Finish {
        match self {
            Self::Local(binder) => binder.on_last_strong_ref(),
            Self::Remote(proxy) => {
                proxy.release_remote();
                // Memory stays while weak references remain, so a lookup
                // racing with this release revives the same proxy.
                Finish::Extend
            }
        }
    }

    fn on_try_acquire_failed(&self, never_acquired: bool) -> bool {
        match self {
            Self::Local(binder) => binder.on_try_acquire_failed(never_acquired),
            Self::Remote(proxy) => never_acquired || proxy.attempt_acquire(),
        }
    }
}

impl fmt::Debug for BinderObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(binder) => f.debug_tuple("Local").field(&binder.descriptor()).finish(),
            Self::Remote(proxy) => f.debug_tuple("Remote").field(proxy).finish(),
        }
    }
}

/// Local stand-in for a remote object, addressed by handle
pub struct Proxy {
    handle: Handle,
    process: Arc<Process>,
    identity: AtomicUsize,
}

impl Proxy {
    /// Takes the weak transport reference for `handle`
    pub(crate) fn new(handle: Handle, process: Arc<Process>) -> Self {
        process.with_thread(|thread| thread.inc_weak_handle(handle));
        Proxy {
            handle,
            process,
            identity: AtomicUsize::new(0),
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn process(&self) -> &Arc<Process> {
        &self.process
    }

    /// Registry identity, set once the counter block exists
    pub(crate) fn set_identity(&self, identity: usize) {
        self.identity.store(identity, Ordering::Release);
    }

    fn transact(&self, code: u32, data: &Payload, flags: u32) -> Result<Payload, IpcError> {
        let handle = self.handle;
        self.process
            .with_thread(|thread| thread.transact(handle, code, data, flags))
    }

    fn acquire_remote(&self) {
        let handle = self.handle;
        self.process.with_thread(|thread| thread.inc_strong_handle(handle));
    }

    fn release_remote(&self) {
        let handle = self.handle;
        self.process.with_thread(|thread| thread.dec_strong_handle(handle));
    }

    fn attempt_acquire(&self) -> bool {
        // The context manager handle is never reference counted.
        if self.handle == CONTEXT_MANAGER_HANDLE {
            return true;
        }
        let handle = self.handle;
        self.process
            .with_thread(|thread| thread.attempt_acquire_handle(handle))
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        let handle = self.handle;
        self.process.with_thread(|thread| thread.dec_weak_handle(handle));
        self.process
            .expunge_handle(handle, self.identity.load(Ordering::Acquire));
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("handle", &self.handle)
            .field("process", &self.process.id())
            .finish()
    }
}
