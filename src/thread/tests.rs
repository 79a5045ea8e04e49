use super::*;
use crate::binder::{Binder, BinderObject, StrongBinder, FIRST_CALL_TRANSACTION};
use crate::config::ProcessConfig;
use crate::protocol::{self, FlatObject};
use crate::refbase::Sp;
use crate::transport::Transport;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Transport that records every command and answers reads from a script.
/// A read with nothing scripted fails as if the connection closed.
#[derive(Default)]
struct ScriptedTransport {
    written: Mutex<Vec<Command>>,
    script: Mutex<VecDeque<Vec<Return>>>,
    garbled: AtomicBool,
}

impl ScriptedTransport {
    fn push(&self, batch: Vec<Return>) {
        self.script.lock().push_back(batch);
    }

    fn written(&self) -> Vec<Command> {
        self.written.lock().clone()
    }
}

impl Transport for ScriptedTransport {
    fn write_read(&self, exchange: &mut WriteRead) -> Result<(), TransportError> {
        if self.garbled.load(Ordering::SeqCst) {
            return Err(TransportError::Protocol("garbled frame".into()));
        }
        let mut pos = 0;
        while let Some(command) = protocol::read_frame::<Command>(&exchange.write, &mut pos)? {
            self.written.lock().push(command);
        }
        exchange.write_consumed = pos;
        if exchange.read_mode == ReadMode::Skip {
            return Ok(());
        }
        let batch = self.script.lock().pop_front().ok_or(TransportError::Closed)?;
        for ret in &batch {
            protocol::write_frame(&mut exchange.read, ret)?;
        }
        Ok(())
    }

    fn request_wakeup(&self, _at: Instant) -> Result<(), TransportError> {
        Ok(())
    }

    fn thread_exit(&self) {}
}

struct Echo {
    last_caller: Arc<AtomicU32>,
}

impl Binder for Echo {
    fn descriptor(&self) -> &str {
        "test.Echo"
    }

    fn on_transact(
        &self,
        _code: u32,
        data: &Payload,
        reply: &mut Payload,
        caller: &CallerInfo,
    ) -> Result<(), IpcError> {
        self.last_caller.store(caller.pid, Ordering::SeqCst);
        reply.write_bytes(data.data());
        Ok(())
    }
}

fn setup() -> (Arc<ScriptedTransport>, Arc<Process>) {
    let transport = Arc::new(ScriptedTransport::default());
    let process = Process::new(ProcessConfig::default(), transport.clone()).unwrap();
    (transport, process)
}

fn echo() -> (StrongBinder, Arc<AtomicU32>) {
    let last_caller = Arc::new(AtomicU32::new(0));
    let binder = BinderObject::local(Echo {
        last_caller: last_caller.clone(),
    });
    (binder, last_caller)
}

#[test]
fn test_oneway_returns_at_transaction_complete() {
    let (transport, process) = setup();
    transport.push(vec![Return::TransactionComplete]);

    let reply = process
        .with_thread(|t| {
            let data = Payload::from_bytes(b"ping".to_vec());
            t.transact(4, FIRST_CALL_TRANSACTION, &data, FLAG_ONEWAY)
        })
        .unwrap();
    assert!(reply.is_empty());

    let written = transport.written();
    assert!(matches!(
        &written[0],
        Command::Transaction(tx) if tx.target == Target::Handle(4)
            && tx.code == FIRST_CALL_TRANSACTION
            && tx.payload.data == b"ping"
    ));
    process.release_current_thread();
}

#[test]
fn test_error_status_frees_the_reply_buffer() {
    let (transport, process) = setup();
    transport.push(vec![Return::TransactionComplete]);
    transport.push(vec![Return::Reply(ReplyData {
        status: IpcError::PermissionDenied.code(),
        payload: WirePayload {
            buffer: 7,
            ..WirePayload::default()
        },
    })]);

    let err = process
        .with_thread(|t| t.transact(4, FIRST_CALL_TRANSACTION, &Payload::new(), 0))
        .unwrap_err();
    assert_eq!(err, IpcError::PermissionDenied);
    assert!(transport.written().contains(&Command::FreeBuffer(7)));
    process.release_current_thread();
}

#[test]
fn test_dead_reply_and_closed_transport_are_dead_object() {
    let (transport, process) = setup();
    transport.push(vec![Return::TransactionComplete, Return::DeadReply]);
    let err = process
        .with_thread(|t| t.transact(4, FIRST_CALL_TRANSACTION, &Payload::new(), 0))
        .unwrap_err();
    assert_eq!(err, IpcError::DeadObject);

    // Nothing scripted: the read fails like a closed connection.
    let err = process
        .with_thread(|t| t.transact(4, FIRST_CALL_TRANSACTION, &Payload::new(), 0))
        .unwrap_err();
    assert!(err.is_dead());
    process.release_current_thread();
}

#[test]
fn test_reference_commands_flush_outside_the_loop() {
    let (transport, process) = setup();
    process.with_thread(|t| {
        t.inc_strong_handle(3);
        assert_eq!(t.pending_commands(), 0);
        assert_eq!(t.state(), ThreadState::Idle);
        assert!(!t.is_looper());
    });
    assert_eq!(transport.written(), vec![Command::Acquire(3)]);
    process.release_current_thread();
}

#[test]
fn test_pool_loop_serves_published_object() {
    let (transport, process) = setup();
    let (binder, last_caller) = echo();
    let node = NodeAddr::from_addr(Sp::addr(&binder));

    // Publish the object by sending it; the transport takes its references.
    let mut carrier = Payload::new();
    carrier.write_binder(&binder);
    transport.push(vec![
        Return::IncRefs(node),
        Return::Acquire(node),
        Return::TransactionComplete,
    ]);
    process
        .with_thread(|t| t.transact(1, FIRST_CALL_TRANSACTION, &carrier, FLAG_ONEWAY))
        .unwrap();
    drop(carrier);
    assert_eq!(process.published_count(), 1);
    assert_eq!(Sp::strong_count(&binder), 2);

    // An inbound call, its reply's completion, then the references go away.
    transport.push(vec![Return::Transaction(Transaction {
        target: Target::Node(node),
        code: FIRST_CALL_TRANSACTION,
        flags: 0,
        sender_pid: 55,
        sender_euid: 1000,
        priority: 3,
        payload: WirePayload {
            data: b"hi".to_vec(),
            objects: Vec::new(),
            buffer: 9,
        },
    })]);
    transport.push(vec![Return::TransactionComplete]);
    transport.push(vec![Return::Release(node), Return::DecRefs(node)]);
    process.with_thread(|t| t.join_thread_pool(false, false));

    assert_eq!(last_caller.load(Ordering::SeqCst), 55);
    assert_eq!(Sp::strong_count(&binder), 1);
    assert_eq!(process.published_count(), 0);
    assert_eq!(process.pool_stats().live, 0);

    let written = transport.written();
    assert!(written.contains(&Command::IncRefsDone(node)));
    assert!(written.contains(&Command::AcquireDone(node)));
    assert!(written.contains(&Command::RegisterLooper));
    assert!(written.contains(&Command::FreeBuffer(9)));
    assert!(written.contains(&Command::ExitLooper));
    assert!(written.iter().any(|c| matches!(
        c,
        Command::Reply(reply) if reply.status == 0 && reply.payload.data == b"hi"
    )));
    assert!(matches!(
        &written[0],
        Command::Transaction(tx) if tx.payload.objects == vec![FlatObject::Node(node)]
    ));
    process.release_current_thread();
}

#[test]
fn test_attempt_acquire_waits_for_result() {
    let (transport, process) = setup();
    transport.push(vec![Return::Noop, Return::AcquireResult(true)]);
    assert!(process.with_thread(|t| t.attempt_acquire_handle(2)));
    assert_eq!(transport.written(), vec![Command::AttemptAcquire(2)]);

    // No answer at all counts as refused.
    assert!(!process.with_thread(|t| t.attempt_acquire_handle(2)));
    process.release_current_thread();
}

#[test]
fn test_transport_failure_during_call_is_dead_object() {
    let (transport, process) = setup();
    transport.garbled.store(true, Ordering::SeqCst);
    let err = process
        .with_thread(|t| t.transact(4, FIRST_CALL_TRANSACTION, &Payload::new(), 0))
        .unwrap_err();
    assert_eq!(err, IpcError::DeadObject);
    transport.garbled.store(false, Ordering::SeqCst);
    process.release_current_thread();
}

#[test]
fn test_zero_handler_status_is_sent_as_failure() {
    let (transport, process) = setup();
    transport.push(vec![Return::TransactionComplete]);
    process.with_thread(|t| t.send_reply(Err(IpcError::Remote(0))));

    assert!(transport.written().iter().any(|c| matches!(
        c,
        Command::Reply(reply) if reply.status == IpcError::UNKNOWN
    )));
    process.release_current_thread();
}
