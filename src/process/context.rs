//! Named objects served when this process is the context manager

use crate::binder::{CallerInfo, StrongBinder};
use crate::error::IpcError;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Decides whether a caller may look up a context object by name
pub type PermissionCheck = dyn Fn(&str, &CallerInfo) -> bool + Send + Sync;

#[derive(Default)]
pub(crate) struct ContextObjects {
    objects: RwLock<HashMap<String, StrongBinder>>,
    permission: OnceCell<Box<PermissionCheck>>,
}

impl ContextObjects {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `binder` under `name`, returning the object it replaced
    pub fn set(&self, name: &str, binder: StrongBinder) -> Option<StrongBinder> {
        self.objects.write().insert(name.to_string(), binder)
    }

    pub fn remove(&self, name: &str) -> Option<StrongBinder> {
        self.objects.write().remove(name)
    }

    pub fn get(&self, name: &str, caller: &CallerInfo) -> Result<StrongBinder, IpcError> {
        if let Some(check) = self.permission.get() {
            if !check(name, caller) {
                tracing::debug!(
                    target: "bindery::context",
                    name,
                    pid = caller.pid,
                    euid = caller.euid,
                    "context lookup denied"
                );
                return Err(IpcError::PermissionDenied);
            }
        }
        self.objects
            .read()
            .get(name)
            .cloned()
            .ok_or(IpcError::NameNotFound)
    }

    pub fn set_permission_check(&self, check: Box<PermissionCheck>) -> Result<(), IpcError> {
        self.permission
            .set(check)
            .map_err(|_| IpcError::AlreadyRegistered)
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }
}
