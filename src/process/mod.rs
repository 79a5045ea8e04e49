//! Per-process state
//!
//! One [`Process`] per transport connection. It owns the handle registry, the
//! table of published local objects, the context objects it serves as
//! context manager, timed handlers, and the pool thread accounting. Every OS
//! thread that touches a process gets its own
//! [`DispatchThread`](crate::thread::DispatchThread), created lazily and kept
//! in thread-local storage.

mod context;
mod nodes;
mod pool;
mod registry;
mod scheduler;

pub use context::PermissionCheck;
pub use pool::PoolStats;
pub use scheduler::Handler;

use crate::binder::{
    BinderObject, CallerInfo, StrongBinder, WeakBinder, GET_CONTEXT_OBJECT, PING_TRANSACTION,
};
use crate::config::ProcessConfig;
use crate::error::{ConfigError, IpcError};
use crate::instrument::Owner;
use crate::logging;
use crate::payload::Payload;
use crate::protocol::{FlatObject, Handle, NodeAddr, CONTEXT_MANAGER_HANDLE};
use crate::refbase::Sp;
use crate::thread::DispatchThread;
use crate::transport::Transport;
use context::ContextObjects;
use nodes::NodeTable;
use pool::ThreadPool;
use registry::HandleRegistry;
use scheduler::Scheduler;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

thread_local! {
    static THREADS: RefCell<Vec<Rc<DispatchThread>>> = RefCell::new(Vec::new());
}

pub struct Process {
    id: u64,
    config: ProcessConfig,
    transport: Arc<dyn Transport>,
    registry: HandleRegistry,
    nodes: NodeTable,
    contexts: ContextObjects,
    scheduler: Scheduler,
    pool: ThreadPool,
}

impl Process {
    pub fn new(config: ProcessConfig, transport: Arc<dyn Transport>) -> Result<Arc<Self>, ConfigError> {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);

        config.validate()?;
        let process = Arc::new(Process {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            config,
            transport,
            registry: HandleRegistry::new(),
            nodes: NodeTable::new(),
            contexts: ContextObjects::new(),
            scheduler: Scheduler::new(),
            pool: ThreadPool::new(),
        });
        tracing::debug!(
            target: "bindery::process",
            id = process.id,
            pid = process.pid(),
            max_threads = process.config.max_threads,
            "process created"
        );
        Ok(process)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Process id peers see as the sender of our calls
    pub fn pid(&self) -> u32 {
        self.transport.pid()
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub(crate) fn nodes(&self) -> &NodeTable {
        &self.nodes
    }

    pub(crate) fn pool(&self) -> &ThreadPool {
        &self.pool
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Number of handles with a registered proxy
    pub fn proxy_count(&self) -> usize {
        self.registry.len()
    }

    /// Number of local objects currently published to the transport
    pub fn published_count(&self) -> usize {
        self.nodes.len()
    }

    /// Run `f` with the calling OS thread's dispatch state for this process.
    ///
    /// During thread teardown, when thread-local storage is gone, a temporary
    /// dispatch state is used and flushed when `f` returns.
    pub fn with_thread<R>(self: &Arc<Self>, f: impl FnOnce(&DispatchThread) -> R) -> R {
        let current = THREADS
            .try_with(|threads| {
                let mut threads = threads.try_borrow_mut().ok()?;
                if let Some(thread) = threads.iter().find(|t| t.process().id == self.id) {
                    return Some(Rc::clone(thread));
                }
                let thread = Rc::new(DispatchThread::new(Arc::clone(self)));
                threads.push(Rc::clone(&thread));
                Some(thread)
            })
            .ok()
            .flatten();
        match current {
            Some(thread) => f(&thread),
            None => f(&DispatchThread::new(Arc::clone(self))),
        }
    }

    /// Drop the calling thread's dispatch state for this process, flushing
    /// what it still holds
    pub fn release_current_thread(&self) {
        let released = THREADS
            .try_with(|threads| {
                let mut threads = threads.try_borrow_mut().ok()?;
                let index = threads.iter().position(|t| t.process().id == self.id)?;
                Some(threads.remove(index))
            })
            .ok()
            .flatten();
        drop(released);
    }

    pub fn proxy_for_handle(self: &Arc<Self>, handle: Handle) -> Result<StrongBinder, IpcError> {
        self.registry.proxy_for_handle(self, handle)
    }

    pub fn weak_proxy_for_handle(self: &Arc<Self>, handle: Handle) -> WeakBinder {
        self.registry.weak_proxy_for_handle(self, handle)
    }

    /// Forget the proxy registered for `handle`, if it is still `identity`
    pub fn expunge_handle(&self, handle: Handle, identity: usize) {
        self.registry.expunge(handle, identity);
    }

    pub fn context_manager(self: &Arc<Self>) -> Result<StrongBinder, IpcError> {
        self.proxy_for_handle(CONTEXT_MANAGER_HANDLE)
    }

    /// Claim the context manager role with the transport
    pub fn become_context_manager(self: &Arc<Self>) -> Result<(), IpcError> {
        self.with_thread(|thread| thread.register_context_manager())?;
        tracing::info!(target: "bindery::process", id = self.id, "registered as context manager");
        Ok(())
    }

    /// Serve `binder` under `name` to context lookups
    pub fn set_context_object(&self, name: &str, binder: StrongBinder) {
        let replaced = self.contexts.set(name, binder);
        tracing::debug!(target: "bindery::context", name, replaced = replaced.is_some(), "context object set");
    }

    pub fn remove_context_object(&self, name: &str) -> Option<StrongBinder> {
        self.contexts.remove(name)
    }

    pub fn get_context_object(&self, name: &str, caller: &CallerInfo) -> Result<StrongBinder, IpcError> {
        self.contexts.get(name, caller)
    }

    /// Install the check consulted before every context lookup. Once only.
    pub fn set_permission_check(
        &self,
        check: impl Fn(&str, &CallerInfo) -> bool + Send + Sync + 'static,
    ) -> Result<(), IpcError> {
        self.contexts.set_permission_check(Box::new(check))
    }

    /// Ask the context manager for the object registered under `name`
    pub fn lookup_context_object(self: &Arc<Self>, name: &str) -> Result<StrongBinder, IpcError> {
        let manager = self.context_manager()?;
        let request = Payload::from_bytes(name.as_bytes());
        let reply = manager.transact(GET_CONTEXT_OBJECT, &request, 0)?;
        reply.read_binder(0)
    }

    /// Answer a transaction the transport routed to us as context manager
    pub(crate) fn serve_context(
        &self,
        code: u32,
        data: &Payload,
        reply: &mut Payload,
        caller: &CallerInfo,
    ) -> Result<(), IpcError> {
        match code {
            PING_TRANSACTION => Ok(()),
            GET_CONTEXT_OBJECT => {
                let object = self.get_context_object(data.as_str()?, caller)?;
                reply.write_binder(&object);
                Ok(())
            }
            _ => Err(IpcError::UnknownTransaction),
        }
    }

    /// Strong reference for an object named in an inbound payload
    pub(crate) fn resolve_flat(self: &Arc<Self>, flat: FlatObject) -> Result<StrongBinder, IpcError> {
        match flat {
            FlatObject::Handle(handle) => self.proxy_for_handle(handle),
            FlatObject::Node(node) => self.local_binder(node),
        }
    }

    /// Strong reference to a published local object, if it is still alive
    pub(crate) fn local_binder(&self, node: NodeAddr) -> Result<StrongBinder, IpcError> {
        let block = self.nodes.resolve(node);
        let owner = Owner::next();
        // Safety: resolve only returns blocks kept allocated by a publication.
        if unsafe { block.as_ref() }.try_acquire_strong(owner) {
            // Safety: the strong reference was just taken for `owner`.
            Ok(unsafe { Sp::<BinderObject>::from_acquired(block, owner) })
        } else {
            Err(IpcError::DeadObject)
        }
    }

    /// Spawn the first pool thread. Later calls do nothing.
    pub fn start_thread_pool(self: &Arc<Self>) -> Result<(), IpcError> {
        if self.pool.mark_started() {
            self.spawn_pooled_thread(true)
        } else {
            Ok(())
        }
    }

    /// Spawn one pool thread unless the pool is at `max_threads`
    pub fn spawn_pooled_thread(self: &Arc<Self>, is_main: bool) -> Result<(), IpcError> {
        let Some(seq) = self.pool.reserve(self.config.max_threads) else {
            tracing::debug!(target: "bindery::pool", max = self.config.max_threads, "pool at capacity");
            return Ok(());
        };
        let name = format!("bindery:{}_{}", self.pid(), seq);
        let process = Arc::clone(self);
        match thread::Builder::new()
            .name(name)
            .spawn(move || process.with_thread(|t| t.join_thread_pool(is_main, true)))
        {
            Ok(_) => Ok(()),
            Err(e) => {
                self.pool.cancel_reservation();
                Err(IpcError::ThreadSpawn(e.to_string()))
            }
        }
    }

    /// Turn the calling thread into a pool thread until the transport closes
    pub fn join_thread_pool(self: &Arc<Self>, is_main: bool) {
        self.with_thread(|thread| thread.join_thread_pool(is_main, false));
    }

    /// Run `handler` on a pool thread as soon as possible
    pub fn post_handler(&self, handler: impl FnOnce() + Send + 'static) -> Result<(), IpcError> {
        self.post_handler_at(Instant::now(), handler)
    }

    /// Run `handler` on a pool thread once `at` has passed
    pub fn post_handler_at(
        &self,
        at: Instant,
        handler: impl FnOnce() + Send + 'static,
    ) -> Result<(), IpcError> {
        self.scheduler.post(at, Box::new(handler));
        self.transport.request_wakeup(at)?;
        Ok(())
    }

    /// Run one due handler on the calling pool thread.
    ///
    /// The thread is busy until the handler returns, so anything still
    /// queued may need another pool thread, and the next deadline is armed
    /// before the handler starts.
    pub(crate) fn run_scheduled(self: &Arc<Self>) {
        let handler = self.scheduler.take_due(Instant::now());
        if handler.is_some() && self.scheduler.len() > 0 {
            self.grow_pool();
        }
        if let Some(next) = self.scheduler.next_due() {
            if let Err(e) = self.transport.request_wakeup(next) {
                tracing::debug!(target: "bindery::pool", error = %e, "could not rearm wakeup");
            }
        }
        if let Some(handler) = handler {
            handler();
        }
    }

    /// Add a pool thread when timed work is overdue after a drain
    pub(crate) fn maybe_grow_pool(self: &Arc<Self>) {
        if self.scheduler.has_due(Instant::now()) {
            self.grow_pool();
        }
    }

    fn grow_pool(self: &Arc<Self>) {
        if !self.pool.should_grow(self.config.min_threads, self.config.max_threads) {
            return;
        }
        if let Err(e) = self.spawn_pooled_thread(false) {
            tracing::error!(target: "bindery::pool", error = %e, "failed to grow thread pool");
        }
    }

    /// Write out the calling thread's queued commands without waiting
    pub fn flush_commands(self: &Arc<Self>) -> Result<(), IpcError> {
        self.with_thread(|thread| thread.flush_commands())
    }

    /// Close the transport connection. Pool threads leave their loops and
    /// peers see this process as dead.
    pub fn shutdown(&self) {
        tracing::info!(target: "bindery::process", id = self.id, "shutting down");
        let stats = self.pool.stats();
        logging::log_pool_change("shutdown", stats.live, stats.idle);
        self.transport.close();
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.id)
            .field("pid", &self.pid())
            .field("pool", &self.pool.stats())
            .field("proxies", &self.registry.len())
            .field("published", &self.nodes.len())
            .field("contexts", &self.contexts.len())
            .field("scheduled", &self.scheduler.len())
            .finish()
    }
}
