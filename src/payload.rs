//! Opaque transaction payload
//!
//! Bytes plus an ordered list of object references. The byte layout belongs
//! to the application; the dispatch core only moves it and translates the
//! object references on the way through the transport.

use crate::binder::{BinderObject, StrongBinder};
use crate::error::IpcError;
use crate::process::Process;
use crate::protocol::{FlatObject, WirePayload};
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

/// Objects kept alive until the transport has taken its own references
pub(crate) type Keepalive = SmallVec<[StrongBinder; 2]>;

enum PayloadObject {
    Binder(StrongBinder),
    Flat(FlatObject),
}

/// Transport buffer backing an inbound payload, returned on drop
struct InboundBuffer {
    id: u64,
    process: Arc<Process>,
}

impl Drop for InboundBuffer {
    fn drop(&mut self) {
        let id = self.id;
        self.process.with_thread(|thread| thread.free_buffer(id));
    }
}

#[derive(Default)]
pub struct Payload {
    data: Vec<u8>,
    objects: Vec<PayloadObject>,
    buffer: Option<InboundBuffer>,
}

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        Payload {
            data: data.into(),
            ..Self::default()
        }
    }

    pub(crate) fn inbound(process: &Arc<Process>, wire: WirePayload) -> Self {
        Payload {
            data: wire.data,
            objects: wire.objects.into_iter().map(PayloadObject::Flat).collect(),
            buffer: Some(InboundBuffer {
                id: wire.buffer,
                process: Arc::clone(process),
            }),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.objects.is_empty()
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Data interpreted as UTF-8 text
    pub fn as_str(&self) -> Result<&str, IpcError> {
        std::str::from_utf8(&self.data).map_err(|e| IpcError::BadValue(e.to_string()))
    }

    pub fn write_binder(&mut self, binder: &StrongBinder) {
        self.objects.push(PayloadObject::Binder(binder.clone()));
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Strong reference to the `index`-th object, resolving inbound handles
    /// through the receiving process
    pub fn read_binder(&self, index: usize) -> Result<StrongBinder, IpcError> {
        match self.objects.get(index) {
            Some(PayloadObject::Binder(binder)) => Ok(binder.clone()),
            Some(PayloadObject::Flat(flat)) => {
                let process = self
                    .buffer
                    .as_ref()
                    .map(|buffer| &buffer.process)
                    .ok_or_else(|| IpcError::BadValue("flat object without a process".into()))?;
                process.resolve_flat(*flat)
            }
            None => Err(IpcError::BadValue(format!("no object at index {}", index))),
        }
    }

    /// Wire form of the object list for `process`, plus the references that
    /// must outlive the send
    pub(crate) fn flatten(
        &self,
        process: &Arc<Process>,
    ) -> Result<(Vec<FlatObject>, Keepalive), IpcError> {
        let mut flat = Vec::with_capacity(self.objects.len());
        let mut keep = Keepalive::new();
        for index in 0..self.objects.len() {
            let binder = self.read_binder(index)?;
            match &*binder {
                BinderObject::Local(_) => {
                    let addr = StrongBinder::addr(&binder);
                    process.nodes().retain(addr);
                    flat.push(FlatObject::Node(crate::protocol::NodeAddr::from_addr(addr)));
                }
                BinderObject::Remote(proxy) => {
                    if !Arc::ptr_eq(proxy.process(), process) {
                        return Err(IpcError::BadValue(
                            "proxy belongs to another process connection".into(),
                        ));
                    }
                    flat.push(FlatObject::Handle(proxy.handle()));
                }
            }
            keep.push(binder);
        }
        Ok((flat, keep))
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("bytes", &self.data.len())
            .field("objects", &self.objects.len())
            .field("buffer", &self.buffer.as_ref().map(|b| b.id))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_and_text() {
        let mut payload = Payload::from_bytes(b"hello".to_vec());
        payload.write_bytes(b" world");
        assert_eq!(payload.len(), 11);
        assert_eq!(payload.as_str().unwrap(), "hello world");
        assert!(!payload.is_empty());

        let invalid = Payload::from_bytes(vec![0xff, 0xfe]);
        assert!(matches!(invalid.as_str(), Err(IpcError::BadValue(_))));
    }

    #[test]
    fn test_missing_object_is_bad_value() {
        let payload = Payload::new();
        assert!(payload.is_empty());
        assert!(matches!(payload.read_binder(0), Err(IpcError::BadValue(_))));
    }
}
