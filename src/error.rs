//! Error taxonomy for the IPC core
//!
//! Recoverable failures (dead peers, transport I/O, resource exhaustion) are
//! values of [`IpcError`] and travel back to the caller, including across the
//! transport inside reply commands. Broken reference-graph contracts and
//! protocol desync are not recoverable and go through [`contract_violation`].

use std::fmt;

/// Recoverable error surfaced to callers of the IPC core
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpcError {
    /// The remote peer (or the object it hosted) is gone
    DeadObject,
    /// The transport refused or could not deliver the call
    FailedTransaction,
    /// The target object does not understand the transaction code
    UnknownTransaction,
    /// The caller was refused by a permission check
    PermissionDenied,
    /// No context object is registered under the requested name
    NameNotFound,
    /// Malformed arguments
    BadValue(String),
    /// A pool thread could not be started
    ThreadSpawn(String),
    /// A once-per-process registration was attempted twice
    AlreadyRegistered,
    /// Transport failure outside of a blocking call
    Transport(String),
    /// Application-defined status code returned by a remote handler.
    /// Zero means success on the wire and is sent as [`IpcError::UNKNOWN`].
    Remote(i32),
}

impl IpcError {
    /// Status sent for a handler failure with no usable code
    pub const UNKNOWN: i32 = i32::MIN;

    /// Stable status code carried on the wire. Never zero.
    pub fn code(&self) -> i32 {
        match self {
            Self::DeadObject => -32,
            Self::FailedTransaction => -2_147_483_646,
            Self::UnknownTransaction => -74,
            Self::PermissionDenied => -1,
            Self::NameNotFound => -2,
            Self::BadValue(_) => -22,
            Self::ThreadSpawn(_) => -11,
            Self::AlreadyRegistered => -17,
            Self::Transport(_) => -5,
            Self::Remote(0) => Self::UNKNOWN,
            Self::Remote(code) => *code,
        }
    }

    /// Rebuild an error from a wire status code
    pub fn from_code(code: i32) -> Self {
        match code {
            -32 => Self::DeadObject,
            -2_147_483_646 => Self::FailedTransaction,
            -74 => Self::UnknownTransaction,
            -1 => Self::PermissionDenied,
            -2 => Self::NameNotFound,
            -22 => Self::BadValue(String::from("remote rejected arguments")),
            -11 => Self::ThreadSpawn(String::from("remote could not spawn")),
            -17 => Self::AlreadyRegistered,
            -5 => Self::Transport(String::from("remote transport failure")),
            other => Self::Remote(other),
        }
    }

    /// True for failures that mean the peer can no longer be reached
    pub fn is_dead(&self) -> bool {
        matches!(self, Self::DeadObject)
    }
}

impl fmt::Display for IpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeadObject => write!(f, "dead object"),
            Self::FailedTransaction => write!(f, "transaction failed"),
            Self::UnknownTransaction => write!(f, "unknown transaction code"),
            Self::PermissionDenied => write!(f, "permission denied"),
            Self::NameNotFound => write!(f, "name not found"),
            Self::BadValue(msg) => write!(f, "bad value: {}", msg),
            Self::ThreadSpawn(msg) => write!(f, "failed to spawn pool thread: {}", msg),
            Self::AlreadyRegistered => write!(f, "already registered"),
            Self::Transport(msg) => write!(f, "transport error: {}", msg),
            Self::Remote(code) => write!(f, "remote error status {}", code),
        }
    }
}

impl std::error::Error for IpcError {}

/// Failure reported by a [`crate::transport::Transport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The exchange was interrupted before doing any work; retry
    Interrupted,
    /// The connection is closed
    Closed,
    /// I/O failure
    Io(String),
    /// The transport could not parse what it was given
    Protocol(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupted => write!(f, "exchange interrupted"),
            Self::Closed => write!(f, "transport closed"),
            Self::Io(msg) => write!(f, "transport I/O error: {}", msg),
            Self::Protocol(msg) => write!(f, "transport protocol error: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<TransportError> for IpcError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Closed | TransportError::Io(_) => IpcError::DeadObject,
            TransportError::Interrupted => IpcError::FailedTransaction,
            TransportError::Protocol(msg) => IpcError::Transport(msg),
        }
    }
}

/// Configuration loading failure
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(String),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "failed to read config: {}", e),
            Self::Parse(msg) => write!(f, "failed to parse config: {}", msg),
            Self::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

/// Report a broken reference-counting or protocol contract and stop.
///
/// The reference graph is already inconsistent when this runs, so nothing is
/// unwound into a recoverable error. Release builds abort (`panic = "abort"`).
#[cold]
#[inline(never)]
#[track_caller]
pub fn contract_violation(object: usize, what: &str, strong: i32, weak: i32) -> ! {
    tracing::error!(
        target: "bindery::refbase",
        object = format_args!("{:#x}", object),
        strong,
        weak,
        "contract violation: {}",
        what
    );
    panic!(
        "contract violation on object {:#x}: {} (strong={}, weak={})",
        object, what, strong, weak
    );
}

/// Report an inbound command the dispatch loop cannot make sense of and stop.
#[cold]
#[inline(never)]
#[track_caller]
pub fn protocol_violation(detail: &str) -> ! {
    tracing::error!(target: "bindery::dispatch", detail, "protocol violation");
    panic!("protocol violation: {}", detail);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_survive_the_wire() {
        for err in [
            IpcError::DeadObject,
            IpcError::FailedTransaction,
            IpcError::UnknownTransaction,
            IpcError::PermissionDenied,
            IpcError::NameNotFound,
            IpcError::AlreadyRegistered,
            IpcError::Remote(42),
        ] {
            assert_eq!(IpcError::from_code(err.code()), err);
        }
    }

    #[test]
    fn test_zero_remote_status_is_not_success() {
        let code = IpcError::Remote(0).code();
        assert_ne!(code, 0);
        assert_eq!(IpcError::from_code(code), IpcError::Remote(IpcError::UNKNOWN));
    }

    #[test]
    fn test_transport_errors_become_dead_object() {
        assert_eq!(IpcError::from(TransportError::Closed), IpcError::DeadObject);
        assert_eq!(
            IpcError::from(TransportError::Io("broken pipe".into())),
            IpcError::DeadObject
        );
        assert!(IpcError::from(TransportError::Closed).is_dead());
    }

    #[test]
    #[should_panic(expected = "contract violation")]
    fn test_contract_violation_panics() {
        contract_violation(0x10, "double release", 0, 0);
    }
}
