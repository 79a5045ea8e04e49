//! In-process transport
//!
//! Design: models the kernel side of the protocol for any number of
//! connected processes living in one address space.
//! - Nodes: one per published local object, counting the references other
//!   processes hold. The owner is told to take (`Acquire`/`IncRefs`) or drop
//!   (`Release`/`DecRefs`) its own transport reference on transitions, and
//!   drops are held back until the matching acknowledgement arrives.
//! - Refs: per-process handle table, lowest free handle reused first, handle
//!   0 reserved for the context manager.
//! - Routing: process-wide queues for pool threads, per-thread queues for
//!   replies, call-backs into a waiting thread, and refcount work caused by
//!   the thread's own sends.
//! - Buffers: every delivered payload pins the references it carries until
//!   the receiver frees the buffer.
//!
//! All state sits behind one mutex; blocked readers wait on one condvar.

use super::{ReadMode, Transport, WriteRead};
use crate::error::{IpcError, TransportError};
use crate::protocol::{
    self, Command, FlatObject, Handle, NodeAddr, ReplyData, Return, Target, Transaction,
    WirePayload, CONTEXT_MANAGER_HANDLE,
};
use parking_lot::{Condvar, Mutex};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Instant;

/// Returns handed out per exchange at most
const MAX_BATCH: usize = 16;

type ProcId = usize;
type ThreadKey = (ProcId, ThreadId);
type NodeKey = (ProcId, NodeAddr);

#[derive(Debug, Default)]
struct Node {
    strong: usize,
    weak: usize,
    /// The owner holds a strong transport reference (or has been asked to)
    has_strong: bool,
    has_weak: bool,
    strong_ack_pending: bool,
    weak_ack_pending: bool,
}

#[derive(Debug)]
struct Ref {
    node: NodeKey,
    strong: usize,
    weak: usize,
}

#[derive(Debug)]
enum TempRef {
    Handle(Handle),
    Node(NodeKey),
}

#[derive(Debug)]
enum Work {
    Return(Return),
    Transaction {
        tx: Transaction,
        reply_to: Option<ThreadKey>,
    },
}

#[derive(Debug, Default)]
struct ThreadState {
    todo: VecDeque<Work>,
    /// Callers waiting on this thread, innermost last
    incoming: Vec<ThreadKey>,
    awaiting_reply: usize,
    looper: bool,
}

#[derive(Debug)]
struct Attempt {
    node: NodeAddr,
    requester: ThreadKey,
    handle: Handle,
}

#[derive(Debug)]
struct ProcState {
    pid: u32,
    euid: u32,
    closed: bool,
    nodes: HashMap<NodeAddr, Node>,
    refs: BTreeMap<Handle, Ref>,
    handle_of: HashMap<NodeKey, Handle>,
    threads: HashMap<ThreadId, ThreadState>,
    todo: VecDeque<Work>,
    buffers: HashMap<u64, Vec<TempRef>>,
    wakeups: BinaryHeap<Reverse<Instant>>,
    attempts: VecDeque<Attempt>,
    waiting_loopers: usize,
    spawn_requested: bool,
}

impl ProcState {
    fn new(pid: u32, euid: u32) -> Self {
        ProcState {
            pid,
            euid,
            closed: false,
            nodes: HashMap::new(),
            refs: BTreeMap::new(),
            handle_of: HashMap::new(),
            threads: HashMap::new(),
            todo: VecDeque::new(),
            buffers: HashMap::new(),
            wakeups: BinaryHeap::new(),
            attempts: VecDeque::new(),
            waiting_loopers: 0,
            spawn_requested: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum RefOp {
    IncRefs,
    Acquire,
    Release,
    DecRefs,
}

#[derive(Debug, Default)]
struct DriverState {
    procs: Vec<ProcState>,
    context_manager: Option<ProcId>,
    next_buffer: u64,
}

/// Shared kernel model; hand one [`LoopbackTransport`] to each process
#[derive(Debug, Default)]
pub struct LoopbackDriver {
    state: Mutex<DriverState>,
    wake: Condvar,
}

/// Per-connection counters, for diagnostics and tests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Handles this process holds
    pub handles: usize,
    /// Local objects other processes know about
    pub nodes: usize,
    /// Delivered payloads not yet freed
    pub buffers: usize,
}

impl LoopbackDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open a connection for a new process
    pub fn connect(self: &Arc<Self>, pid: u32, euid: u32) -> Arc<LoopbackTransport> {
        let mut state = self.state.lock();
        state.procs.push(ProcState::new(pid, euid));
        let proc = state.procs.len() - 1;
        tracing::debug!(target: "bindery::transport", proc, pid, "loopback connection opened");
        Arc::new(LoopbackTransport {
            driver: Arc::clone(self),
            proc,
            pid,
            euid,
        })
    }

    fn exchange(&self, me: ThreadKey, exchange: &mut WriteRead) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.procs[me.0].closed {
            return Err(TransportError::Closed);
        }

        let mut wrote = false;
        loop {
            let mut pos = exchange.write_consumed;
            let Some(command) = protocol::read_frame::<Command>(&exchange.write, &mut pos)? else {
                break;
            };
            exchange.write_consumed = pos;
            state.handle_command(me, command);
            wrote = true;
        }
        if wrote {
            self.wake.notify_all();
        }

        let timeout = match exchange.read_mode {
            ReadMode::Skip => return Ok(()),
            ReadMode::Block { timeout } => timeout,
        };
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            if state.procs[me.0].closed {
                return Err(TransportError::Closed);
            }
            if state.fill(me, &mut exchange.read)? {
                return Ok(());
            }

            let now = Instant::now();
            if state.take_due_wakeup(me, now) {
                protocol::write_frame(&mut exchange.read, &Return::EventOccurred)?;
                return Ok(());
            }
            if deadline.map_or(false, |d| now >= d) {
                protocol::write_frame(&mut exchange.read, &Return::Timeout)?;
                return Ok(());
            }

            let wake_at = match (deadline, state.next_wakeup(me)) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            let looper = state.eligible_for_proc_work(me);
            if looper {
                state.procs[me.0].waiting_loopers += 1;
            }
            match wake_at {
                Some(at) => {
                    self.wake.wait_until(&mut state, at);
                }
                None => self.wake.wait(&mut state),
            }
            if looper {
                state.procs[me.0].waiting_loopers -= 1;
            }
        }
    }

    fn request_wakeup(&self, proc: ProcId, at: Instant) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let target = &mut state.procs[proc];
        if target.closed {
            return Err(TransportError::Closed);
        }
        target.wakeups.push(Reverse(at));
        self.wake.notify_all();
        Ok(())
    }

    fn thread_exit(&self, me: ThreadKey) {
        let mut state = self.state.lock();
        let proc = &mut state.procs[me.0];
        let idle = proc.threads.get(&me.1).map_or(false, |t| {
            t.todo.is_empty() && t.incoming.is_empty() && t.awaiting_reply == 0
        });
        if idle {
            proc.threads.remove(&me.1);
        }
    }

    fn close(&self, proc: ProcId) {
        let mut state = self.state.lock();
        if state.procs[proc].closed {
            return;
        }
        state.close_proc(proc);
        tracing::debug!(target: "bindery::transport", proc, "loopback connection closed");
        self.wake.notify_all();
    }

    fn stats(&self, proc: ProcId) -> ConnectionStats {
        let state = self.state.lock();
        let target = &state.procs[proc];
        ConnectionStats {
            handles: target.refs.len(),
            nodes: target.nodes.len(),
            buffers: target.buffers.len(),
        }
    }
}

impl DriverState {
    fn thread(&mut self, key: ThreadKey) -> &mut ThreadState {
        self.procs[key.0].threads.entry(key.1).or_default()
    }

    fn push_thread(&mut self, key: ThreadKey, work: Work) {
        let proc = &mut self.procs[key.0];
        if !proc.closed {
            proc.threads.entry(key.1).or_default().todo.push_back(work);
        }
    }

    fn push_proc(&mut self, proc: ProcId, work: Work) {
        let target = &mut self.procs[proc];
        if !target.closed {
            target.todo.push_back(work);
        }
    }

    fn reply(&mut self, key: ThreadKey, ret: Return) {
        self.push_thread(key, Work::Return(ret));
    }

    /// Refcount work for a node owner: on the sending thread when the owner's
    /// own send caused it, otherwise on the process queue
    fn notify_owner(&mut self, key: NodeKey, ret: Return, via: Option<ThreadKey>) {
        match via {
            Some(thread) if thread.0 == key.0 => self.push_thread(thread, Work::Return(ret)),
            _ => self.push_proc(key.0, Work::Return(ret)),
        }
    }

    fn handle_command(&mut self, me: ThreadKey, command: Command) {
        tracing::trace!(target: "bindery::transport", proc = me.0, command = command.name(), "command");
        match command {
            Command::IncRefs(handle) => self.ref_command(me, handle, RefOp::IncRefs),
            Command::Acquire(handle) => self.ref_command(me, handle, RefOp::Acquire),
            Command::Release(handle) => self.ref_command(me, handle, RefOp::Release),
            Command::DecRefs(handle) => self.ref_command(me, handle, RefOp::DecRefs),
            Command::IncRefsDone(addr) => self.ack(me.0, addr, false),
            Command::AcquireDone(addr) => self.ack(me.0, addr, true),
            Command::AttemptAcquire(handle) => self.attempt_acquire(me, handle),
            Command::AcquireResult { node, success } => self.finish_attempt(me.0, node, success),
            Command::Transaction(tx) => self.send_transaction(me, tx),
            Command::Reply(reply) => self.send_reply(me, reply),
            Command::FreeBuffer(id) => self.free_buffer(me, id),
            Command::EnterLooper | Command::RegisterLooper => {
                self.thread(me).looper = true;
                self.procs[me.0].spawn_requested = false;
            }
            Command::ExitLooper => {
                self.thread(me).looper = false;
                self.procs[me.0].spawn_requested = false;
            }
            Command::RegisterContextManager => match self.context_manager {
                Some(current) if current != me.0 && !self.procs[current].closed => {
                    tracing::warn!(target: "bindery::transport", proc = me.0, "context manager already registered");
                    self.reply(me, Return::Error(IpcError::AlreadyRegistered.code()));
                }
                _ => self.context_manager = Some(me.0),
            },
        }
    }

    // ------------------------------------------------------------------
    // Reference bookkeeping
    // ------------------------------------------------------------------

    fn ref_command(&mut self, me: ThreadKey, handle: Handle, op: RefOp) {
        if handle == CONTEXT_MANAGER_HANDLE {
            return;
        }
        if let Err(err) = self.update_ref(me.0, handle, op) {
            tracing::warn!(
                target: "bindery::transport",
                proc = me.0,
                handle,
                op = ?op,
                "refcount command rejected: {}",
                err
            );
            self.reply(me, Return::Error(err.code()));
        }
    }

    fn update_ref(&mut self, proc: ProcId, handle: Handle, op: RefOp) -> Result<(), IpcError> {
        let (key, strong, weak) = self
            .procs[proc]
            .refs
            .get(&handle)
            .map(|r| (r.node, r.strong, r.weak))
            .ok_or_else(|| IpcError::BadValue(format!("no reference for handle {}", handle)))?;

        let (strong, weak) = match op {
            RefOp::IncRefs => (strong, weak + 1),
            RefOp::Acquire => {
                if strong == 0 && self.node_strong(key) == 0 {
                    return Err(IpcError::BadValue(format!(
                        "handle {} names an object without strong references",
                        handle
                    )));
                }
                (strong + 1, weak)
            }
            RefOp::Release if strong == 0 => {
                return Err(IpcError::BadValue(format!("unbalanced release of handle {}", handle)))
            }
            RefOp::Release => (strong - 1, weak),
            RefOp::DecRefs if weak == 0 => {
                return Err(IpcError::BadValue(format!("unbalanced decrefs of handle {}", handle)))
            }
            RefOp::DecRefs => (strong, weak - 1),
        };
        self.set_ref(proc, handle, strong, weak, None);
        Ok(())
    }

    fn ref_counts(&self, proc: ProcId, handle: Handle) -> Option<(usize, usize)> {
        self.procs[proc].refs.get(&handle).map(|r| (r.strong, r.weak))
    }

    /// Store new counts for a reference and carry the transitions to its node
    fn set_ref(
        &mut self,
        proc: ProcId,
        handle: Handle,
        strong: usize,
        weak: usize,
        via: Option<ThreadKey>,
    ) {
        let Some(r) = self.procs[proc].refs.get_mut(&handle) else {
            return;
        };
        let key = r.node;
        let old_strong = r.strong;
        r.strong = strong;
        r.weak = weak;

        if old_strong == 0 && strong > 0 {
            self.inc_node(key, true, via);
        }
        let gone = strong == 0 && weak == 0;
        if gone {
            self.procs[proc].refs.remove(&handle);
            self.procs[proc].handle_of.remove(&key);
        }
        if old_strong > 0 && strong == 0 {
            self.dec_node(key, true);
        }
        if gone {
            self.dec_node(key, false);
        }
    }

    /// The receiving process's handle for a node, created with no counts
    fn ref_for(&mut self, proc: ProcId, key: NodeKey, via: Option<ThreadKey>) -> Handle {
        if let Some(&handle) = self.procs[proc].handle_of.get(&key) {
            return handle;
        }
        let mut handle: Handle = CONTEXT_MANAGER_HANDLE + 1;
        for &used in self.procs[proc].refs.keys() {
            if used == handle {
                handle += 1;
            } else if used > handle {
                break;
            }
        }
        let target = &mut self.procs[proc];
        target.refs.insert(
            handle,
            Ref {
                node: key,
                strong: 0,
                weak: 0,
            },
        );
        target.handle_of.insert(key, handle);
        self.inc_node(key, false, via);
        handle
    }

    fn node_strong(&self, key: NodeKey) -> usize {
        self.procs[key.0].nodes.get(&key.1).map_or(0, |n| n.strong)
    }

    fn inc_node(&mut self, key: NodeKey, strong: bool, via: Option<ThreadKey>) {
        let owner_alive = !self.procs[key.0].closed;
        let node = self.procs[key.0].nodes.entry(key.1).or_default();
        let notify = if strong {
            node.strong += 1;
            if node.has_strong {
                None
            } else {
                node.has_strong = true;
                node.strong_ack_pending = owner_alive;
                Some(Return::Acquire(key.1))
            }
        } else {
            node.weak += 1;
            if node.has_weak {
                None
            } else {
                node.has_weak = true;
                node.weak_ack_pending = owner_alive;
                Some(Return::IncRefs(key.1))
            }
        };
        if let Some(ret) = notify {
            self.notify_owner(key, ret, via);
        }
    }

    fn dec_node(&mut self, key: NodeKey, strong: bool) {
        if let Some(node) = self.procs[key.0].nodes.get_mut(&key.1) {
            if strong {
                node.strong = node.strong.saturating_sub(1);
            } else {
                node.weak = node.weak.saturating_sub(1);
            }
        }
        self.maybe_release(key);
    }

    fn ack(&mut self, proc: ProcId, addr: NodeAddr, strong: bool) {
        if let Some(node) = self.procs[proc].nodes.get_mut(&addr) {
            if strong {
                node.strong_ack_pending = false;
            } else {
                node.weak_ack_pending = false;
            }
        }
        self.maybe_release((proc, addr));
    }

    /// Tell the owner to drop its transport references once nothing needs
    /// them and every earlier take has been acknowledged
    fn maybe_release(&mut self, key: NodeKey) {
        let nodes = &mut self.procs[key.0].nodes;
        let Some(node) = nodes.get_mut(&key.1) else {
            return;
        };

        let release = node.strong == 0 && node.has_strong && !node.strong_ack_pending;
        if release {
            node.has_strong = false;
        }
        let idle = node.strong == 0
            && node.weak == 0
            && !node.has_strong
            && !node.strong_ack_pending
            && !node.weak_ack_pending;
        let decrefs = idle && node.has_weak;
        if idle {
            nodes.remove(&key.1);
        }

        if release {
            self.notify_owner(key, Return::Release(key.1), None);
        }
        if decrefs {
            self.notify_owner(key, Return::DecRefs(key.1), None);
        }
    }

    fn attempt_acquire(&mut self, me: ThreadKey, handle: Handle) {
        let Some((key, strong, weak)) = self.procs[me.0]
            .refs
            .get(&handle)
            .map(|r| (r.node, r.strong, r.weak))
        else {
            self.reply(me, Return::AcquireResult(false));
            return;
        };

        if self.node_strong(key) > 0 {
            self.set_ref(me.0, handle, strong + 1, weak, None);
            self.reply(me, Return::AcquireResult(true));
        } else if self.procs[key.0].closed {
            self.reply(me, Return::AcquireResult(false));
        } else {
            self.procs[key.0].attempts.push_back(Attempt {
                node: key.1,
                requester: me,
                handle,
            });
            self.push_proc(key.0, Work::Return(Return::AttemptAcquire(key.1)));
        }
    }

    fn finish_attempt(&mut self, owner: ProcId, addr: NodeAddr, success: bool) {
        let attempts = &mut self.procs[owner].attempts;
        let Some(attempt) = attempts
            .iter()
            .position(|a| a.node == addr)
            .and_then(|index| attempts.remove(index))
        else {
            tracing::warn!(target: "bindery::transport", proc = owner, node = ?addr, "unsolicited acquire result");
            return;
        };

        if success {
            let key = (owner, addr);
            let node = self.procs[owner].nodes.entry(addr).or_default();
            let duplicate = node.has_strong;
            node.has_strong = true;
            if duplicate {
                // The owner already held one for us.
                self.notify_owner(key, Return::Release(addr), None);
            }
            let requester = attempt.requester;
            match self.ref_counts(requester.0, attempt.handle) {
                Some((strong, weak)) if !self.procs[requester.0].closed => {
                    self.set_ref(requester.0, attempt.handle, strong + 1, weak, None)
                }
                _ => self.maybe_release(key),
            }
        }
        self.reply(attempt.requester, Return::AcquireResult(success));
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Translate the sender's object references into the receiver's view,
    /// pinning each one until the receiver frees the buffer
    fn translate(
        &mut self,
        me: ThreadKey,
        to: ProcId,
        objects: &[FlatObject],
        temps: &mut Vec<TempRef>,
    ) -> Result<Vec<FlatObject>, IpcError> {
        let mut translated = Vec::with_capacity(objects.len());
        for object in objects {
            let (key, from_owner) = match *object {
                FlatObject::Node(addr) => ((me.0, addr), true),
                FlatObject::Handle(handle) => {
                    let r = self.procs[me.0].refs.get(&handle).ok_or_else(|| {
                        IpcError::BadValue(format!("payload names unknown handle {}", handle))
                    })?;
                    (r.node, false)
                }
            };
            if !from_owner && self.node_strong(key) == 0 {
                return Err(IpcError::DeadObject);
            }
            let via = from_owner.then_some(me);

            if key.0 == to {
                self.inc_node(key, true, via);
                temps.push(TempRef::Node(key));
                translated.push(FlatObject::Node(key.1));
            } else {
                let handle = self.ref_for(to, key, via);
                let (strong, weak) = self.ref_counts(to, handle).unwrap_or((0, 0));
                self.set_ref(to, handle, strong + 1, weak, via);
                temps.push(TempRef::Handle(handle));
                translated.push(FlatObject::Handle(handle));
            }
        }
        Ok(translated)
    }

    fn release_temps(&mut self, proc: ProcId, temps: Vec<TempRef>) {
        for temp in temps {
            match temp {
                TempRef::Handle(handle) => {
                    if let Some((strong, weak)) = self.ref_counts(proc, handle) {
                        self.set_ref(proc, handle, strong.saturating_sub(1), weak, None);
                    }
                }
                TempRef::Node(key) => self.dec_node(key, true),
            }
        }
    }

    fn alloc_buffer(&mut self, proc: ProcId, temps: Vec<TempRef>) -> u64 {
        self.next_buffer += 1;
        let id = self.next_buffer;
        self.procs[proc].buffers.insert(id, temps);
        id
    }

    fn free_buffer(&mut self, me: ThreadKey, id: u64) {
        match self.procs[me.0].buffers.remove(&id) {
            Some(temps) => self.release_temps(me.0, temps),
            None => {
                tracing::warn!(target: "bindery::transport", proc = me.0, buffer = id, "free of unknown buffer");
                self.reply(me, Return::Error(IpcError::BadValue(String::new()).code()));
            }
        }
    }

    /// Destination process, delivered target and (for call-backs) the
    /// specific thread to run on
    fn route(
        &self,
        me: ThreadKey,
        target: Target,
        oneway: bool,
    ) -> Result<(ProcId, Target, Option<ThreadId>), Return> {
        let (dest, delivered) = match target {
            Target::Handle(CONTEXT_MANAGER_HANDLE) => match self.context_manager {
                Some(cm) if !self.procs[cm].closed => (cm, Target::Context),
                _ => return Err(Return::DeadReply),
            },
            Target::Handle(handle) => {
                let r = self.procs[me.0].refs.get(&handle).ok_or(Return::FailedReply)?;
                if self.procs[r.node.0].closed {
                    return Err(Return::DeadReply);
                }
                (r.node.0, Target::Node(r.node.1))
            }
            Target::Node(_) | Target::Context => return Err(Return::FailedReply),
        };

        // A thread serving a call from `dest` sends its own calls back to
        // the thread waiting on it.
        let thread = if oneway {
            None
        } else {
            self.procs[me.0].threads.get(&me.1).and_then(|t| {
                t.incoming
                    .iter()
                    .rev()
                    .find(|caller| caller.0 == dest)
                    .map(|caller| caller.1)
            })
        };
        Ok((dest, delivered, thread))
    }

    fn send_transaction(&mut self, me: ThreadKey, tx: Transaction) {
        let oneway = tx.is_oneway();
        let Transaction {
            target,
            code,
            flags,
            priority,
            payload,
            ..
        } = tx;

        let (dest, delivered, thread) = match self.route(me, target, oneway) {
            Ok(route) => route,
            Err(failure) => return self.fail_transaction(me, oneway, failure),
        };

        let mut temps = Vec::new();
        let objects = match self.translate(me, dest, &payload.objects, &mut temps) {
            Ok(objects) => objects,
            Err(err) => {
                self.release_temps(dest, temps);
                let failure = if err.is_dead() {
                    Return::DeadReply
                } else {
                    Return::FailedReply
                };
                return self.fail_transaction(me, oneway, failure);
            }
        };
        let buffer = self.alloc_buffer(dest, temps);
        let sender = &self.procs[me.0];
        let work = Work::Transaction {
            tx: Transaction {
                target: delivered,
                code,
                flags,
                sender_pid: sender.pid,
                sender_euid: sender.euid,
                priority,
                payload: WirePayload {
                    data: payload.data,
                    objects,
                    buffer,
                },
            },
            reply_to: (!oneway).then_some(me),
        };
        match thread {
            Some(thread) => self.push_thread((dest, thread), work),
            None => self.push_proc(dest, work),
        }
        if !oneway {
            self.thread(me).awaiting_reply += 1;
        }
        self.reply(me, Return::TransactionComplete);
    }

    /// One-way sends to a dead or unknown target are dropped silently;
    /// synchronous ones complete and then fail
    fn fail_transaction(&mut self, me: ThreadKey, oneway: bool, failure: Return) {
        tracing::debug!(
            target: "bindery::transport",
            proc = me.0,
            oneway,
            failure = failure.name(),
            "transaction not delivered"
        );
        self.reply(me, Return::TransactionComplete);
        if !oneway {
            self.reply(me, failure);
        }
    }

    fn send_reply(&mut self, me: ThreadKey, reply: ReplyData) {
        let Some(caller) = self.thread(me).incoming.pop() else {
            tracing::warn!(target: "bindery::transport", proc = me.0, "reply without a pending call");
            self.reply(me, Return::TransactionComplete);
            return;
        };
        let caller_alive = !self.procs[caller.0].closed
            && self.procs[caller.0].threads.contains_key(&caller.1);
        if !caller_alive {
            tracing::debug!(target: "bindery::transport", proc = me.0, "caller gone, reply dropped");
            self.reply(me, Return::TransactionComplete);
            return;
        }

        let ReplyData { status, payload } = reply;
        let mut temps = Vec::new();
        let delivered = match self.translate(me, caller.0, &payload.objects, &mut temps) {
            Ok(objects) => {
                let buffer = self.alloc_buffer(caller.0, temps);
                Return::Reply(ReplyData {
                    status,
                    payload: WirePayload {
                        data: payload.data,
                        objects,
                        buffer,
                    },
                })
            }
            Err(_) => {
                self.release_temps(caller.0, temps);
                Return::FailedReply
            }
        };
        // After translation, so refcount work caused by the reply precedes it.
        self.reply(me, Return::TransactionComplete);

        let waiting = self.thread(caller);
        waiting.awaiting_reply = waiting.awaiting_reply.saturating_sub(1);
        self.reply(caller, delivered);
    }

    fn dead_reply(&mut self, caller: ThreadKey) {
        if self.procs[caller.0].closed {
            return;
        }
        let waiting = self.thread(caller);
        waiting.awaiting_reply = waiting.awaiting_reply.saturating_sub(1);
        self.reply(caller, Return::DeadReply);
    }

    // ------------------------------------------------------------------
    // Reading
    // ------------------------------------------------------------------

    fn eligible_for_proc_work(&self, me: ThreadKey) -> bool {
        self.procs[me.0]
            .threads
            .get(&me.1)
            .map_or(false, |t| t.looper && t.incoming.is_empty() && t.awaiting_reply == 0)
    }

    fn next_work(&mut self, me: ThreadKey) -> Option<(Return, bool)> {
        let ProcState { threads, todo, .. } = &mut self.procs[me.0];
        let thread = threads.entry(me.1).or_default();
        let (work, shared) = if let Some(work) = thread.todo.pop_front() {
            (work, false)
        } else if thread.looper && thread.incoming.is_empty() && thread.awaiting_reply == 0 {
            (todo.pop_front()?, true)
        } else {
            return None;
        };

        let ret = match work {
            Work::Return(ret) => ret,
            Work::Transaction { tx, reply_to } => {
                if let Some(caller) = reply_to {
                    thread.incoming.push(caller);
                }
                Return::Transaction(tx)
            }
        };
        Some((ret, shared))
    }

    fn fill(&mut self, me: ThreadKey, read: &mut Vec<u8>) -> Result<bool, TransportError> {
        let mut delivered = 0;
        while delivered < MAX_BATCH {
            let Some((ret, shared)) = self.next_work(me) else {
                break;
            };
            protocol::write_frame(read, &ret)?;
            delivered += 1;

            // Last idle pool thread just took shared work: ask for another.
            let proc = &mut self.procs[me.0];
            if shared && proc.waiting_loopers == 0 && !proc.spawn_requested {
                proc.spawn_requested = true;
                protocol::write_frame(read, &Return::SpawnLooper)?;
            }
            if ret.ends_batch() {
                break;
            }
        }
        Ok(delivered > 0)
    }

    fn take_due_wakeup(&mut self, me: ThreadKey, now: Instant) -> bool {
        if !self.eligible_for_proc_work(me) {
            return false;
        }
        let wakeups = &mut self.procs[me.0].wakeups;
        match wakeups.peek() {
            Some(Reverse(at)) if *at <= now => {
                wakeups.pop();
                true
            }
            _ => false,
        }
    }

    fn next_wakeup(&self, me: ThreadKey) -> Option<Instant> {
        if !self.eligible_for_proc_work(me) {
            return None;
        }
        self.procs[me.0].wakeups.peek().map(|Reverse(at)| *at)
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    fn close_proc(&mut self, proc: ProcId) {
        if self.context_manager == Some(proc) {
            self.context_manager = None;
        }
        let target = &mut self.procs[proc];
        target.closed = true;

        let mut pending: Vec<Work> = target.todo.drain(..).collect();
        let mut serving = Vec::new();
        for thread in target.threads.values_mut() {
            pending.extend(thread.todo.drain(..));
            serving.append(&mut thread.incoming);
        }
        target.threads.clear();
        target.wakeups.clear();
        target.handle_of.clear();
        for node in target.nodes.values_mut() {
            node.strong_ack_pending = false;
            node.weak_ack_pending = false;
        }
        let refs = std::mem::take(&mut target.refs);
        let buffers = std::mem::take(&mut target.buffers);
        let attempts = std::mem::take(&mut target.attempts);

        for work in pending {
            if let Work::Transaction {
                reply_to: Some(caller),
                ..
            } = work
            {
                self.dead_reply(caller);
            }
        }
        for caller in serving {
            self.dead_reply(caller);
        }
        for attempt in attempts {
            self.reply(attempt.requester, Return::AcquireResult(false));
        }
        // Handle pins are covered by dropping the refs below.
        for temps in buffers.into_values() {
            for temp in temps {
                if let TempRef::Node(key) = temp {
                    self.dec_node(key, true);
                }
            }
        }
        for r in refs.into_values() {
            if r.strong > 0 {
                self.dec_node(r.node, true);
            }
            self.dec_node(r.node, false);
        }
    }
}

/// One process's connection to a [`LoopbackDriver`]; closes on drop
#[derive(Debug)]
pub struct LoopbackTransport {
    driver: Arc<LoopbackDriver>,
    proc: ProcId,
    pid: u32,
    euid: u32,
}

impl LoopbackTransport {
    pub fn stats(&self) -> ConnectionStats {
        self.driver.stats(self.proc)
    }

    fn me(&self) -> ThreadKey {
        (self.proc, thread::current().id())
    }
}

impl Transport for LoopbackTransport {
    fn write_read(&self, exchange: &mut WriteRead) -> Result<(), TransportError> {
        self.driver.exchange(self.me(), exchange)
    }

    fn request_wakeup(&self, at: Instant) -> Result<(), TransportError> {
        self.driver.request_wakeup(self.proc, at)
    }

    fn thread_exit(&self) {
        self.driver.thread_exit(self.me());
    }

    fn close(&self) {
        self.driver.close(self.proc);
    }

    fn pid(&self) -> u32 {
        self.pid
    }

    fn euid(&self) -> u32 {
        self.euid
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.driver.close(self.proc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FLAG_ONEWAY;
    use std::time::Duration;

    fn exchange(transport: &LoopbackTransport, commands: &[Command], read: bool) -> Vec<Return> {
        let mut write = Vec::new();
        for command in commands {
            protocol::write_frame(&mut write, command).unwrap();
        }
        let mode = if read {
            ReadMode::Block {
                timeout: Some(Duration::from_millis(50)),
            }
        } else {
            ReadMode::Skip
        };
        let mut wr = WriteRead::new(write, mode);
        transport.write_read(&mut wr).unwrap();
        assert!(wr.unconsumed().is_empty());

        let mut pos = 0;
        let mut returns = Vec::new();
        while let Some(ret) = protocol::read_frame::<Return>(&wr.read, &mut pos).unwrap() {
            if ret != Return::SpawnLooper {
                returns.push(ret);
            }
        }
        returns
    }

    fn send(target: Handle, flags: u32, objects: Vec<FlatObject>) -> Command {
        Command::Transaction(Transaction {
            target: Target::Handle(target),
            code: 1,
            flags,
            sender_pid: 0,
            sender_euid: 0,
            priority: 0,
            payload: WirePayload {
                data: Vec::new(),
                objects,
                buffer: 0,
            },
        })
    }

    fn received(returns: &[Return]) -> &Transaction {
        match returns.first() {
            Some(Return::Transaction(tx)) => tx,
            other => panic!("expected a transaction, got {:?}", other),
        }
    }

    #[test]
    fn test_node_lifecycle_across_processes() {
        let driver = LoopbackDriver::new();
        let client = driver.connect(100, 0);
        let server = driver.connect(200, 0);
        exchange(&server, &[Command::RegisterContextManager, Command::EnterLooper], false);

        let node = NodeAddr(0x10);
        let returns = exchange(&client, &[send(0, FLAG_ONEWAY, vec![FlatObject::Node(node)])], true);
        assert_eq!(
            returns,
            vec![Return::IncRefs(node), Return::Acquire(node), Return::TransactionComplete]
        );
        exchange(&client, &[Command::IncRefsDone(node), Command::AcquireDone(node)], false);

        let returns = exchange(&server, &[], true);
        let tx = received(&returns);
        assert_eq!(tx.target, Target::Context);
        assert_eq!(tx.sender_pid, 100);
        assert_eq!(tx.payload.objects, vec![FlatObject::Handle(1)]);

        exchange(&server, &[Command::IncRefs(1), Command::FreeBuffer(tx.payload.buffer)], false);
        assert_eq!(server.stats().handles, 1);
        assert_eq!(server.stats().buffers, 0);
        assert_eq!(client.stats().nodes, 1);

        exchange(&server, &[Command::DecRefs(1)], false);
        assert_eq!(server.stats().handles, 0);

        let returns = exchange(&client, &[Command::EnterLooper], true);
        assert_eq!(returns, vec![Return::Release(node), Return::DecRefs(node)]);
        assert_eq!(client.stats().nodes, 0);
    }

    #[test]
    fn test_lowest_free_handle_is_reused() {
        let driver = LoopbackDriver::new();
        let client = driver.connect(1, 0);
        let server = driver.connect(2, 0);
        exchange(&server, &[Command::RegisterContextManager, Command::EnterLooper], false);

        let objects = vec![FlatObject::Node(NodeAddr(0x10)), FlatObject::Node(NodeAddr(0x20))];
        exchange(&client, &[send(0, FLAG_ONEWAY, objects)], true);
        let returns = exchange(&server, &[], true);
        let tx = received(&returns);
        assert_eq!(tx.payload.objects, vec![FlatObject::Handle(1), FlatObject::Handle(2)]);

        // Keep handle 2, let handle 1 go.
        exchange(&server, &[Command::IncRefs(2), Command::FreeBuffer(tx.payload.buffer)], false);
        assert_eq!(server.stats().handles, 1);

        exchange(&client, &[send(0, FLAG_ONEWAY, vec![FlatObject::Node(NodeAddr(0x30))])], true);
        let returns = exchange(&server, &[], true);
        assert_eq!(received(&returns).payload.objects, vec![FlatObject::Handle(1)]);
    }

    #[test]
    fn test_call_to_missing_context_manager_is_dead() {
        let driver = LoopbackDriver::new();
        let client = driver.connect(1, 0);
        assert_eq!(exchange(&client, &[send(0, 0, vec![])], true), vec![Return::TransactionComplete]);
        assert_eq!(exchange(&client, &[], true), vec![Return::DeadReply]);
    }

    #[test]
    fn test_closing_the_server_fails_pending_calls() {
        let driver = LoopbackDriver::new();
        let client = driver.connect(1, 0);
        let server = driver.connect(2, 0);
        exchange(&server, &[Command::RegisterContextManager, Command::EnterLooper], false);

        assert_eq!(exchange(&client, &[send(0, 0, vec![])], true), vec![Return::TransactionComplete]);
        server.close();
        assert_eq!(exchange(&client, &[], true), vec![Return::DeadReply]);
    }

    #[test]
    fn test_second_context_manager_is_rejected() {
        let driver = LoopbackDriver::new();
        let first = driver.connect(1, 0);
        let second = driver.connect(2, 0);
        exchange(&first, &[Command::RegisterContextManager], false);
        let returns = exchange(&second, &[Command::RegisterContextManager], true);
        assert_eq!(returns, vec![Return::Error(IpcError::AlreadyRegistered.code())]);
    }

    #[test]
    fn test_idle_read_times_out_and_wakeups_fire() {
        let driver = LoopbackDriver::new();
        let proc = driver.connect(1, 0);
        assert_eq!(exchange(&proc, &[Command::EnterLooper], true), vec![Return::Timeout]);

        proc.request_wakeup(Instant::now()).unwrap();
        assert_eq!(exchange(&proc, &[], true), vec![Return::EventOccurred]);
    }

    #[test]
    fn test_acquire_without_strong_references_is_rejected() {
        let driver = LoopbackDriver::new();
        let client = driver.connect(1, 0);
        let server = driver.connect(2, 0);
        exchange(&server, &[Command::RegisterContextManager, Command::EnterLooper], false);
        exchange(&client, &[send(0, FLAG_ONEWAY, vec![FlatObject::Node(NodeAddr(0x10))])], true);
        exchange(&client, &[Command::IncRefsDone(NodeAddr(0x10)), Command::AcquireDone(NodeAddr(0x10))], false);

        let returns = exchange(&server, &[], true);
        let buffer = received(&returns).payload.buffer;
        // Weak only, then the pin goes away.
        exchange(&server, &[Command::IncRefs(1), Command::FreeBuffer(buffer)], false);
        let returns = exchange(&server, &[Command::Acquire(1)], true);
        assert!(matches!(returns.as_slice(), [Return::Error(_)]));
    }
}
