//! Transport boundary
//!
//! The dispatch loop only ever talks to the transport through one combined
//! write-then-read exchange per call. How commands reach the other process
//! is the transport's business: a kernel driver, or the in-process
//! [`LoopbackDriver`] used by tests and single-binary deployments.

mod loopback;

pub use loopback::{ConnectionStats, LoopbackDriver, LoopbackTransport};

use crate::error::TransportError;
use std::time::{Duration, Instant};

/// What the exchange should do after writing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Write only
    Skip,
    /// Block until at least one return is available. When the timeout passes
    /// first the transport answers [`crate::protocol::Return::Timeout`].
    Block { timeout: Option<Duration> },
}

/// Buffers of one exchange
#[derive(Debug)]
pub struct WriteRead {
    /// Encoded [`crate::protocol::Command`] frames
    pub write: Vec<u8>,
    /// Bytes of `write` the transport accepted
    pub write_consumed: usize,
    /// Encoded [`crate::protocol::Return`] frames, filled by the transport
    pub read: Vec<u8>,
    pub read_mode: ReadMode,
}

impl WriteRead {
    pub fn new(write: Vec<u8>, read_mode: ReadMode) -> Self {
        WriteRead {
            write,
            write_consumed: 0,
            read: Vec::new(),
            read_mode,
        }
    }

    /// Bytes the transport did not accept
    pub fn unconsumed(&self) -> &[u8] {
        &self.write[self.write_consumed.min(self.write.len())..]
    }
}

/// One process's connection to the transport.
///
/// Exchanges are made on behalf of the calling OS thread; the transport keys
/// its per-thread state (queues, call stacks) on it.
pub trait Transport: Send + Sync {
    fn write_read(&self, exchange: &mut WriteRead) -> Result<(), TransportError>;

    /// Deliver `EventOccurred` to a pool thread at (or after) `at`
    fn request_wakeup(&self, at: Instant) -> Result<(), TransportError>;

    /// The calling thread will not exchange again
    fn thread_exit(&self);

    /// Tear the connection down; peers see the process as dead
    fn close(&self) {}

    /// Process id reported to peers as the sender of our calls
    fn pid(&self) -> u32 {
        std::process::id()
    }

    fn euid(&self) -> u32 {
        0
    }
}
