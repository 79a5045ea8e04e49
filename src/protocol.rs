//! Commands exchanged between a process and its transport
//!
//! Every frame is a `bincode` encoding of [`Command`] or [`Return`]: a
//! little-endian `u32` opcode (the variant index), the fixed fields, then any
//! length-prefixed payload bytes. Frames are packed back to back in the
//! write and read buffers of one exchange.

use crate::error::TransportError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Process-scoped reference to a remote object
pub type Handle = u32;

/// Handle of the context manager in every process
pub const CONTEXT_MANAGER_HANDLE: Handle = 0;

/// One-way call: no reply, the caller only waits for delivery
pub const FLAG_ONEWAY: u32 = 0x01;

/// Address of a locally hosted object, as published to the transport
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeAddr(pub u64);

impl NodeAddr {
    pub fn from_addr(addr: usize) -> Self {
        NodeAddr(addr as u64)
    }

    pub fn addr(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeAddr({:#x})", self.0)
    }
}

/// Object reference carried inside a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlatObject {
    /// Remote object, by the receiving process's handle
    Handle(Handle),
    /// Object hosted by the receiving process itself
    Node(NodeAddr),
}

/// Addressee of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Target {
    /// Outbound: the sender's handle
    Handle(Handle),
    /// Inbound: a local object
    Node(NodeAddr),
    /// Inbound: a context-object lookup sent to the context manager
    Context,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WirePayload {
    pub data: Vec<u8>,
    pub objects: Vec<FlatObject>,
    /// Transport buffer backing an inbound payload; zero outbound
    pub buffer: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub target: Target,
    pub code: u32,
    pub flags: u32,
    /// Filled in by the transport
    pub sender_pid: u32,
    pub sender_euid: u32,
    pub priority: i32,
    pub payload: WirePayload,
}

impl Transaction {
    pub fn is_oneway(&self) -> bool {
        self.flags & FLAG_ONEWAY != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyData {
    /// Zero on success, otherwise an [`crate::IpcError`] status code
    pub status: i32,
    pub payload: WirePayload,
}

/// Process to transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    IncRefs(Handle),
    Acquire(Handle),
    Release(Handle),
    DecRefs(Handle),
    IncRefsDone(NodeAddr),
    AcquireDone(NodeAddr),
    AttemptAcquire(Handle),
    AcquireResult { node: NodeAddr, success: bool },
    Transaction(Transaction),
    Reply(ReplyData),
    FreeBuffer(u64),
    EnterLooper,
    RegisterLooper,
    ExitLooper,
    RegisterContextManager,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::IncRefs(_) => "IncRefs",
            Self::Acquire(_) => "Acquire",
            Self::Release(_) => "Release",
            Self::DecRefs(_) => "DecRefs",
            Self::IncRefsDone(_) => "IncRefsDone",
            Self::AcquireDone(_) => "AcquireDone",
            Self::AttemptAcquire(_) => "AttemptAcquire",
            Self::AcquireResult { .. } => "AcquireResult",
            Self::Transaction(_) => "Transaction",
            Self::Reply(_) => "Reply",
            Self::FreeBuffer(_) => "FreeBuffer",
            Self::EnterLooper => "EnterLooper",
            Self::RegisterLooper => "RegisterLooper",
            Self::ExitLooper => "ExitLooper",
            Self::RegisterContextManager => "RegisterContextManager",
        }
    }
}

/// Transport to process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Return {
    Noop,
    Timeout,
    Error(i32),
    SpawnLooper,
    TransactionComplete,
    Transaction(Transaction),
    Reply(ReplyData),
    DeadReply,
    FailedReply,
    IncRefs(NodeAddr),
    Acquire(NodeAddr),
    Release(NodeAddr),
    DecRefs(NodeAddr),
    AttemptAcquire(NodeAddr),
    AcquireResult(bool),
    EventOccurred,
}

impl Return {
    /// Ends a read batch: the reader has something to act on before
    /// anything queued behind it
    pub fn ends_batch(&self) -> bool {
        matches!(
            self,
            Self::TransactionComplete
                | Self::Transaction(_)
                | Self::Reply(_)
                | Self::DeadReply
                | Self::FailedReply
                | Self::AcquireResult(_)
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Noop => "Noop",
            Self::Timeout => "Timeout",
            Self::Error(_) => "Error",
            Self::SpawnLooper => "SpawnLooper",
            Self::TransactionComplete => "TransactionComplete",
            Self::Transaction(_) => "Transaction",
            Self::Reply(_) => "Reply",
            Self::DeadReply => "DeadReply",
            Self::FailedReply => "FailedReply",
            Self::IncRefs(_) => "IncRefs",
            Self::Acquire(_) => "Acquire",
            Self::Release(_) => "Release",
            Self::DecRefs(_) => "DecRefs",
            Self::AttemptAcquire(_) => "AttemptAcquire",
            Self::AcquireResult(_) => "AcquireResult",
            Self::EventOccurred => "EventOccurred",
        }
    }
}

/// Append one frame to a buffer
pub fn write_frame<T: Serialize>(buf: &mut Vec<u8>, frame: &T) -> Result<(), TransportError> {
    bincode::serialize_into(buf, frame).map_err(|e| TransportError::Protocol(e.to_string()))
}

/// Decode the frame starting at `*pos`, advancing `pos` past it.
///
/// Returns `Ok(None)` at the end of the buffer.
pub fn read_frame<T: DeserializeOwned>(
    buf: &[u8],
    pos: &mut usize,
) -> Result<Option<T>, TransportError> {
    if *pos >= buf.len() {
        return Ok(None);
    }
    let mut rest = &buf[*pos..];
    let before = rest.len();
    let frame = bincode::deserialize_from(&mut rest)
        .map_err(|e| TransportError::Protocol(e.to_string()))?;
    *pos += before - rest.len();
    Ok(Some(frame))
}

/// Outbound command buffer of one thread
#[derive(Debug, Default)]
pub struct CommandWriter {
    buf: Vec<u8>,
    count: usize,
}

impl CommandWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: &Command) {
        // Serializing into a Vec cannot fail for these types.
        if let Err(e) = write_frame(&mut self.buf, command) {
            crate::error::protocol_violation(&format!(
                "failed to encode {}: {}",
                command.name(),
                e
            ));
        }
        self.count += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Commands queued since the last exchange
    pub fn len(&self) -> usize {
        self.count
    }

    /// Hand the pending bytes to an exchange
    pub fn take(&mut self) -> Vec<u8> {
        self.count = 0;
        std::mem::take(&mut self.buf)
    }

    /// Put back bytes the transport did not consume, ahead of anything
    /// queued since
    pub fn restore(&mut self, mut unconsumed: Vec<u8>) {
        if unconsumed.is_empty() {
            return;
        }
        unconsumed.extend_from_slice(&self.buf);
        self.buf = unconsumed;
        self.count = self.count.max(1);
    }
}

/// Inbound command buffer of one thread
#[derive(Debug, Default)]
pub struct ReturnReader {
    buf: Vec<u8>,
    pos: usize,
}

impl ReturnReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_drained(&self) -> bool {
        self.pos >= self.buf.len()
    }

    pub fn refill(&mut self, buf: Vec<u8>) {
        self.buf = buf;
        self.pos = 0;
    }

    pub fn next_return(&mut self) -> Result<Option<Return>, TransportError> {
        read_frame(&self.buf, &mut self.pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_is_variant_index() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Command::Acquire(7)).unwrap();
        assert_eq!(&buf[..4], &1u32.to_le_bytes());
        assert_eq!(&buf[4..8], &7u32.to_le_bytes());
    }

    #[test]
    fn test_frames_pack_back_to_back() {
        let mut writer = CommandWriter::new();
        writer.push(&Command::IncRefs(3));
        writer.push(&Command::Transaction(Transaction {
            target: Target::Handle(3),
            code: 42,
            flags: FLAG_ONEWAY,
            sender_pid: 0,
            sender_euid: 0,
            priority: 0,
            payload: WirePayload {
                data: vec![1, 2, 3],
                objects: vec![FlatObject::Node(NodeAddr(0x1000))],
                buffer: 0,
            },
        }));
        writer.push(&Command::ExitLooper);
        assert_eq!(writer.len(), 3);

        let bytes = writer.take();
        assert!(writer.is_empty());
        let mut pos = 0;
        let first: Command = read_frame(&bytes, &mut pos).unwrap().unwrap();
        assert_eq!(first, Command::IncRefs(3));
        let second: Command = read_frame(&bytes, &mut pos).unwrap().unwrap();
        assert!(matches!(second, Command::Transaction(ref tx) if tx.is_oneway() && tx.code == 42));
        let third: Command = read_frame(&bytes, &mut pos).unwrap().unwrap();
        assert_eq!(third, Command::ExitLooper);
        assert!(read_frame::<Command>(&bytes, &mut pos).unwrap().is_none());
    }

    #[test]
    fn test_unknown_opcode_is_a_protocol_error() {
        let bytes = 999u32.to_le_bytes();
        let mut reader = ReturnReader::new();
        reader.refill(bytes.to_vec());
        assert!(matches!(reader.next_return(), Err(TransportError::Protocol(_))));
    }

    #[test]
    fn test_restore_keeps_order() {
        let mut writer = CommandWriter::new();
        writer.push(&Command::Acquire(1));
        let taken = writer.take();
        writer.push(&Command::Release(1));
        writer.restore(taken);

        let bytes = writer.take();
        let mut pos = 0;
        assert_eq!(read_frame::<Command>(&bytes, &mut pos).unwrap(), Some(Command::Acquire(1)));
        assert_eq!(read_frame::<Command>(&bytes, &mut pos).unwrap(), Some(Command::Release(1)));
    }
}
