//! Per-thread dispatch state
//!
//! A [`DispatchThread`] owns one OS thread's command buffers. Outbound
//! commands accumulate in a write buffer and go out with the next exchange;
//! inbound commands are drained from the read buffer one at a time. The same
//! loop serves two masters: a thread blocked in [`DispatchThread::transact`]
//! keeps executing inbound work (nested call-backs, reference commands) until
//! its reply arrives, and a pool thread runs it forever in
//! [`DispatchThread::join_thread_pool`].
//!
//! Nothing here holds a `RefCell` borrow while user code runs: handlers and
//! object destructors can re-enter the thread freely.

#[cfg(test)]
mod tests;

use crate::binder::CallerInfo;
use crate::error::{protocol_violation, IpcError, TransportError};
use crate::instrument::Owner;
use crate::logging;
use crate::payload::{Keepalive, Payload};
use crate::process::Process;
use crate::protocol::{
    Command, CommandWriter, Handle, NodeAddr, ReplyData, Return, ReturnReader, Target,
    Transaction, WirePayload, FLAG_ONEWAY,
};
use crate::refbase::RefBox;
use crate::transport::{ReadMode, WriteRead};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What the thread is doing right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Waiting on the transport, or not in a loop
    Idle,
    /// Executing inbound commands from the read buffer
    Draining,
    /// Running a transaction handler
    Dispatching,
}

/// Why a pool loop iteration stopped short
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    /// Nothing arrived within the idle timeout
    Timeout,
    /// The transport is gone
    Closed,
}

pub struct DispatchThread {
    process: Arc<Process>,
    out: RefCell<CommandWriter>,
    input: RefCell<ReturnReader>,
    /// One entry per Transaction/Reply sent, popped on TransactionComplete
    keepalive: RefCell<VecDeque<Keepalive>>,
    pending_strong: RefCell<Vec<NodeAddr>>,
    pending_weak: RefCell<Vec<NodeAddr>>,
    priority: Cell<i32>,
    caller: Cell<Option<CallerInfo>>,
    looper: Cell<bool>,
    /// Depth of inbound transactions being handled
    serving: Cell<usize>,
    flushing: Cell<bool>,
    state: Cell<ThreadState>,
}

impl DispatchThread {
    pub(crate) fn new(process: Arc<Process>) -> Self {
        DispatchThread {
            process,
            out: RefCell::new(CommandWriter::new()),
            input: RefCell::new(ReturnReader::new()),
            keepalive: RefCell::new(VecDeque::new()),
            pending_strong: RefCell::new(Vec::new()),
            pending_weak: RefCell::new(Vec::new()),
            priority: Cell::new(0),
            caller: Cell::new(None),
            looper: Cell::new(false),
            serving: Cell::new(0),
            flushing: Cell::new(false),
            state: Cell::new(ThreadState::Idle),
        }
    }

    pub fn process(&self) -> &Arc<Process> {
        &self.process
    }

    pub fn state(&self) -> ThreadState {
        self.state.get()
    }

    pub fn is_looper(&self) -> bool {
        self.looper.get()
    }

    /// Priority attached to outbound calls
    pub fn priority(&self) -> i32 {
        self.priority.get()
    }

    pub fn set_priority(&self, priority: i32) {
        self.priority.set(priority);
    }

    /// Sender of the transaction currently being handled on this thread
    pub fn calling_info(&self) -> Option<CallerInfo> {
        self.caller.get()
    }

    /// Commands written but not yet handed to the transport
    pub fn pending_commands(&self) -> usize {
        self.out.borrow().len()
    }

    fn write(&self, command: Command) {
        self.out.borrow_mut().push(&command);
    }

    /// One exchange: write everything queued, then read when asked to and
    /// the read buffer is drained.
    fn talk_with_transport(&self, read: bool, timeout: Option<Duration>) -> Result<(), TransportError> {
        let needs_read = read && self.input.borrow().is_drained();
        let write = self.out.borrow_mut().take();
        if write.is_empty() && !needs_read {
            return Ok(());
        }
        let mode = if needs_read {
            ReadMode::Block { timeout }
        } else {
            ReadMode::Skip
        };
        let mut exchange = WriteRead::new(write, mode);
        let transport = Arc::clone(self.process.transport());
        let result = loop {
            match transport.write_read(&mut exchange) {
                Err(TransportError::Interrupted) => continue,
                other => break other,
            }
        };
        if result.is_ok() {
            self.out.borrow_mut().restore(exchange.unconsumed().to_vec());
            if needs_read && !exchange.read.is_empty() {
                self.input.borrow_mut().refill(exchange.read);
            }
        }
        result
    }

    fn next_return(&self) -> Option<Return> {
        let next = self.input.borrow_mut().next_return();
        match next {
            Ok(ret) => ret,
            Err(e) => protocol_violation(&format!("undecodable return: {}", e)),
        }
    }

    /// Send a transaction to `handle` and wait for its reply
    pub fn transact(
        &self,
        handle: Handle,
        code: u32,
        data: &Payload,
        flags: u32,
    ) -> Result<Payload, IpcError> {
        let (objects, keep) = data.flatten(&self.process)?;
        let oneway = flags & FLAG_ONEWAY != 0;
        logging::log_transaction_sent(handle, code, data.len(), oneway);
        self.write(Command::Transaction(Transaction {
            target: Target::Handle(handle),
            code,
            flags,
            sender_pid: 0,
            sender_euid: 0,
            priority: self.priority.get(),
            payload: WirePayload {
                data: data.data().to_vec(),
                objects,
                buffer: 0,
            },
        }));
        self.keepalive.borrow_mut().push_back(keep);

        if oneway {
            self.wait_for_response(false)?;
            return Ok(Payload::new());
        }
        self.wait_for_response(true)?
            .ok_or(IpcError::FailedTransaction)
    }

    /// Run the loop until the outstanding call resolves. Without
    /// `expect_reply` the call resolves at TransactionComplete.
    fn wait_for_response(&self, expect_reply: bool) -> Result<Option<Payload>, IpcError> {
        let reply_timeout = self.process.config().reply_timeout();
        let started = Instant::now();
        let mut warned = false;
        loop {
            // Whatever broke, the caller only learns that the peer is gone.
            if let Err(e) = self.talk_with_transport(true, Some(reply_timeout)) {
                tracing::debug!(target: "bindery::dispatch", error = %e, "transport failed during call");
                self.drop_keepalives();
                return Err(IpcError::DeadObject);
            }
            while let Some(ret) = self.next_return() {
                match ret {
                    Return::TransactionComplete => {
                        self.pop_keepalive();
                        if !expect_reply {
                            return Ok(None);
                        }
                    }
                    Return::Reply(reply) => return self.take_reply(reply).map(Some),
                    Return::DeadReply => return Err(IpcError::DeadObject),
                    Return::FailedReply => return Err(IpcError::FailedTransaction),
                    Return::Timeout => {
                        if !warned && started.elapsed() >= reply_timeout {
                            warned = true;
                            tracing::warn!(
                                target: "bindery::dispatch",
                                waited_ms = started.elapsed().as_millis() as u64,
                                "still waiting for a reply"
                            );
                        }
                    }
                    other => self.execute_command(other),
                }
            }
            self.process_pending_derefs();
        }
    }

    fn take_reply(&self, reply: ReplyData) -> Result<Payload, IpcError> {
        let payload = Payload::inbound(&self.process, reply.payload);
        if reply.status != 0 {
            return Err(IpcError::from_code(reply.status));
        }
        Ok(payload)
    }

    fn pop_keepalive(&self) {
        let entry = self.keepalive.borrow_mut().pop_front();
        let Some(entry) = entry else {
            tracing::warn!(target: "bindery::dispatch", "TransactionComplete without an outstanding send");
            return;
        };
        self.unpublish(&entry);
        drop(entry);
    }

    fn drop_keepalives(&self) {
        let entries: Vec<Keepalive> = self.keepalive.borrow_mut().drain(..).collect();
        for entry in &entries {
            self.unpublish(entry);
        }
        drop(entries);
    }

    fn unpublish(&self, entry: &Keepalive) {
        for binder in entry.iter().filter(|binder| !binder.is_remote()) {
            self.process.nodes().release(crate::refbase::Sp::addr(binder));
        }
    }

    fn node_block(&self, node: NodeAddr) -> &RefBox<crate::binder::BinderObject> {
        let block = self.process.nodes().resolve(node);
        // Safety: published nodes stay allocated while the transport holds a
        // weak reference or a send is in flight.
        unsafe { &*block.as_ptr() }
    }

    fn execute_command(&self, ret: Return) {
        match ret {
            Return::Noop | Return::Timeout => {}
            Return::Error(code) => tracing::warn!(
                target: "bindery::dispatch",
                code,
                error = %IpcError::from_code(code),
                "transport reported an error"
            ),
            Return::SpawnLooper => {
                if let Err(e) = self.process.spawn_pooled_thread(false) {
                    tracing::error!(target: "bindery::pool", error = %e, "failed to spawn pool thread");
                }
            }
            Return::TransactionComplete => self.pop_keepalive(),
            Return::IncRefs(node) => {
                let block = self.node_block(node);
                self.process.nodes().retain(node.addr());
                block.acquire_weak(Owner::TRANSPORT);
                self.write(Command::IncRefsDone(node));
            }
            Return::Acquire(node) => {
                self.node_block(node).acquire_strong(Owner::TRANSPORT);
                self.write(Command::AcquireDone(node));
            }
            // Unknown nodes fail here rather than when the batch is applied.
            Return::Release(node) => {
                self.process.nodes().resolve(node);
                self.pending_strong.borrow_mut().push(node);
            }
            Return::DecRefs(node) => {
                self.process.nodes().resolve(node);
                self.pending_weak.borrow_mut().push(node);
            }
            Return::AttemptAcquire(node) => {
                let success = self.node_block(node).try_acquire_strong(Owner::TRANSPORT);
                self.write(Command::AcquireResult { node, success });
            }
            Return::Transaction(tx) => self.execute_transaction(tx),
            Return::EventOccurred => self.process.run_scheduled(),
            Return::Reply(_) | Return::DeadReply | Return::FailedReply | Return::AcquireResult(_) => {
                protocol_violation(&format!("{} with no call outstanding", ret.name()))
            }
        }
    }

    fn execute_transaction(&self, tx: Transaction) {
        let caller = CallerInfo {
            pid: tx.sender_pid,
            euid: tx.sender_euid,
            priority: tx.priority,
        };
        let saved_state = self.state.replace(ThreadState::Dispatching);
        let saved_caller = self.caller.replace(Some(caller));
        let saved_priority = self.priority.replace(tx.priority);
        self.serving.set(self.serving.get() + 1);
        logging::log_transaction_received(tx.code, tx.sender_pid, tx.payload.data.len());

        let oneway = tx.is_oneway();
        let code = tx.code;
        let data = Payload::inbound(&self.process, tx.payload);
        let mut reply = Payload::new();
        let result = match tx.target {
            Target::Node(node) => self
                .process
                .local_binder(node)
                .and_then(|binder| binder.dispatch(code, &data, &mut reply, &caller)),
            Target::Context => self.process.serve_context(code, &data, &mut reply, &caller),
            Target::Handle(handle) => {
                protocol_violation(&format!("inbound transaction addressed to handle {}", handle))
            }
        };
        drop(data);

        if oneway {
            if let Err(e) = result {
                tracing::debug!(target: "bindery::dispatch", code, error = %e, "one-way handler failed");
            }
        } else {
            self.send_reply(result.map(|()| reply));
        }

        self.serving.set(self.serving.get() - 1);
        self.priority.set(saved_priority);
        self.caller.set(saved_caller);
        self.state.set(saved_state);
    }

    fn send_reply(&self, result: Result<Payload, IpcError>) {
        let flattened = result.and_then(|payload| {
            let (objects, keep) = payload.flatten(&self.process)?;
            Ok((payload, objects, keep))
        });
        let reply = match flattened {
            Ok((payload, objects, keep)) => {
                self.keepalive.borrow_mut().push_back(keep);
                ReplyData {
                    status: 0,
                    payload: WirePayload {
                        data: payload.data().to_vec(),
                        objects,
                        buffer: 0,
                    },
                }
            }
            Err(err) => {
                self.keepalive.borrow_mut().push_back(Keepalive::new());
                ReplyData {
                    status: err.code(),
                    payload: WirePayload::default(),
                }
            }
        };
        self.write(Command::Reply(reply));
        if let Err(e) = self.wait_for_response(false) {
            tracing::debug!(target: "bindery::dispatch", error = %e, "reply not delivered");
        }
    }

    /// Apply the Release/DecRefs deferred until the read buffer drained
    fn process_pending_derefs(&self) {
        loop {
            let strong = std::mem::take(&mut *self.pending_strong.borrow_mut());
            let weak = std::mem::take(&mut *self.pending_weak.borrow_mut());
            if strong.is_empty() && weak.is_empty() {
                return;
            }
            for node in strong {
                let block = self.process.nodes().resolve(node);
                // Safety: the transport's strong reference, taken on Acquire.
                unsafe { RefBox::release_strong(block, Owner::TRANSPORT) };
            }
            for node in weak {
                let block = self.process.nodes().resolve(node);
                self.process.nodes().release(node.addr());
                // Safety: the transport's weak reference, taken on IncRefs.
                unsafe { RefBox::release_weak(block, Owner::TRANSPORT) };
            }
        }
    }

    /// Serve inbound work until the transport closes or, for a spawned
    /// thread, until it has been idle long enough to retire
    pub(crate) fn join_thread_pool(&self, is_main: bool, reserved: bool) {
        let pool = self.process.pool();
        let min_threads = self.process.config().min_threads;
        let stats = pool.enter(reserved);
        logging::log_pool_change("join", stats.live, stats.idle);

        self.looper.set(true);
        self.write(if is_main {
            Command::EnterLooper
        } else {
            Command::RegisterLooper
        });

        let id = std::thread::current().id();
        let retired = loop {
            match self.get_and_execute_command() {
                Ok(()) => {}
                Err(LoopExit::Timeout) => {
                    if !is_main && pool.try_retire(id, min_threads) {
                        break true;
                    }
                }
                Err(LoopExit::Closed) => break false,
            }
        };
        let stats = if retired { pool.stats() } else { pool.leave() };

        self.looper.set(false);
        self.write(Command::ExitLooper);
        if let Err(e) = self.talk_with_transport(false, None) {
            tracing::trace!(target: "bindery::pool", error = %e, "exit not delivered");
        }
        logging::log_pool_change(if retired { "retire" } else { "exit" }, stats.live, stats.idle);
    }

    /// One pool loop iteration: block for work, then drain it
    fn get_and_execute_command(&self) -> Result<(), LoopExit> {
        let pool = self.process.pool();
        let id = std::thread::current().id();

        self.state.set(ThreadState::Idle);
        pool.set_idle(id, true);
        let exchanged = self.talk_with_transport(true, Some(self.process.config().idle_timeout()));
        pool.set_idle(id, false);
        if let Err(e) = exchanged {
            match e {
                TransportError::Closed => tracing::debug!(target: "bindery::pool", "transport closed"),
                other => tracing::warn!(target: "bindery::pool", error = %other, "pool thread leaving"),
            }
            self.drop_keepalives();
            self.process_pending_derefs();
            return Err(LoopExit::Closed);
        }

        self.state.set(ThreadState::Draining);
        let mut timed_out = false;
        while let Some(ret) = self.next_return() {
            if matches!(ret, Return::Timeout) {
                timed_out = true;
                continue;
            }
            self.execute_command(ret);
        }
        self.process_pending_derefs();
        self.process.maybe_grow_pool();
        self.state.set(ThreadState::Idle);

        if timed_out {
            Err(LoopExit::Timeout)
        } else {
            Ok(())
        }
    }

    /// Hand queued commands to the transport without reading
    pub fn flush_commands(&self) -> Result<(), IpcError> {
        if self.flushing.replace(true) {
            return Ok(());
        }
        let result = self.talk_with_transport(false, None);
        self.flushing.set(false);
        result.map_err(IpcError::from)
    }

    /// Threads outside the dispatch loop flush right away; loop threads
    /// write with their next exchange
    fn flush_if_needed(&self) {
        if self.looper.get() || self.serving.get() > 0 {
            return;
        }
        if let Err(e) = self.flush_commands() {
            tracing::debug!(target: "bindery::dispatch", error = %e, "flush failed");
        }
    }

    /// Ask the owner of `handle` whether its object can take another strong
    /// reference, executing unrelated inbound work while waiting
    pub fn attempt_acquire_handle(&self, handle: Handle) -> bool {
        self.write(Command::AttemptAcquire(handle));
        let timeout = self.process.config().reply_timeout();
        loop {
            if let Err(e) = self.talk_with_transport(true, Some(timeout)) {
                tracing::debug!(target: "bindery::dispatch", handle, error = %e, "attempt acquire failed");
                return false;
            }
            while let Some(ret) = self.next_return() {
                match ret {
                    Return::AcquireResult(success) => return success,
                    Return::Timeout => {}
                    other => self.execute_command(other),
                }
            }
            self.process_pending_derefs();
        }
    }

    pub(crate) fn register_context_manager(&self) -> Result<(), IpcError> {
        self.write(Command::RegisterContextManager);
        self.talk_with_transport(true, Some(Duration::ZERO))?;
        let mut result = Ok(());
        while let Some(ret) = self.next_return() {
            match ret {
                Return::Error(code) => result = Err(IpcError::from_code(code)),
                Return::Timeout => {}
                other => self.execute_command(other),
            }
        }
        self.process_pending_derefs();
        result
    }

    pub fn inc_strong_handle(&self, handle: Handle) {
        self.write(Command::Acquire(handle));
        self.flush_if_needed();
    }

    pub fn dec_strong_handle(&self, handle: Handle) {
        self.write(Command::Release(handle));
        self.flush_if_needed();
    }

    pub fn inc_weak_handle(&self, handle: Handle) {
        self.write(Command::IncRefs(handle));
        self.flush_if_needed();
    }

    pub fn dec_weak_handle(&self, handle: Handle) {
        self.write(Command::DecRefs(handle));
        self.flush_if_needed();
    }

    pub(crate) fn free_buffer(&self, id: u64) {
        self.write(Command::FreeBuffer(id));
        self.flush_if_needed();
    }
}

impl Drop for DispatchThread {
    fn drop(&mut self) {
        self.process_pending_derefs();
        self.drop_keepalives();
        if let Err(e) = self.talk_with_transport(false, None) {
            tracing::trace!(target: "bindery::dispatch", error = %e, "final flush failed");
        }
        self.process.transport().thread_exit();
    }
}

impl fmt::Debug for DispatchThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchThread")
            .field("process", &self.process.id())
            .field("state", &self.state.get())
            .field("looper", &self.looper.get())
            .field("serving", &self.serving.get())
            .field("pending_commands", &self.out.borrow().len())
            .finish()
    }
}
