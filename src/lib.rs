//! Object-capability IPC core
//!
//! Objects live in one process and are called from others through handles.
//! This crate holds the process-local half of that arrangement:
//!
//! - [`refbase`]: dual strong/weak reference counting with lifecycle hooks,
//!   revival, and deferred destruction
//! - [`light`]: strong-only counting for helpers that never cross processes
//! - [`process`]: per-process handle registry, context objects, pool threads
//! - [`thread`]: the per-thread command loop that talks to the transport
//! - [`transport`]: the transport boundary and an in-process loopback driver

// Core modules
pub mod binder;
pub mod config;
pub mod error;
pub mod instrument;
pub mod light;
pub mod logging;
pub mod payload;
pub mod process;
pub mod protocol;
pub mod refbase;
pub mod thread;
pub mod transport;

// Re-export commonly used items
pub use binder::{
    Binder, BinderObject, CallerInfo, Proxy, StrongBinder, WeakBinder, FIRST_CALL_TRANSACTION,
    GET_CONTEXT_OBJECT, INTERFACE_TRANSACTION, PING_TRANSACTION,
};
pub use config::ProcessConfig;
pub use error::{ConfigError, IpcError, TransportError};
pub use instrument::{install_tracker, Owner, RefKind, RefTracker};
pub use light::{LightHooks, LightRc};
pub use payload::Payload;
pub use process::{PoolStats, Process};
pub use protocol::{Handle, CONTEXT_MANAGER_HANDLE, FLAG_ONEWAY};
pub use refbase::{Finish, RefBox, RefHooks, Sp, Wp};
pub use thread::{DispatchThread, ThreadState};
pub use transport::{LoopbackDriver, LoopbackTransport, Transport};
