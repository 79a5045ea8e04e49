//! Local objects currently published to the transport
//!
//! An address is published while a payload carrying it is in flight or while
//! the transport holds a weak reference to it. Only published addresses may
//! be turned back into objects.

use crate::binder::BinderObject;
use crate::error::protocol_violation;
use crate::protocol::NodeAddr;
use crate::refbase::RefBox;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::ptr::NonNull;

#[derive(Debug, Default)]
pub(crate) struct NodeTable {
    /// Address to publication count
    nodes: DashMap<usize, usize>,
}

impl NodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retain(&self, addr: usize) {
        *self.nodes.entry(addr).or_insert(0) += 1;
    }

    pub fn release(&self, addr: usize) {
        match self.nodes.entry(addr) {
            Entry::Occupied(mut entry) => {
                *entry.get_mut() -= 1;
                if *entry.get() == 0 {
                    entry.remove();
                }
            }
            Entry::Vacant(_) => {
                protocol_violation(&format!("release of unpublished node {:#x}", addr))
            }
        }
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.nodes.contains_key(&addr)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Counter block behind a node the transport named
    pub fn resolve(&self, node: NodeAddr) -> NonNull<RefBox<BinderObject>> {
        if !self.contains(node.addr()) {
            protocol_violation(&format!("transport named unknown node {:?}", node));
        }
        // Safety: published addresses come from live blocks kept allocated by
        // the weak reference backing the publication.
        NonNull::from(unsafe { RefBox::<BinderObject>::from_addr(node.addr()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publication_is_counted() {
        let table = NodeTable::new();
        table.retain(0x1000);
        table.retain(0x1000);
        table.release(0x1000);
        assert!(table.contains(0x1000));
        table.release(0x1000);
        assert!(!table.contains(0x1000));
        assert_eq!(table.len(), 0);
    }

    #[test]
    #[should_panic(expected = "protocol violation")]
    fn test_unknown_node_is_fatal() {
        NodeTable::new().resolve(NodeAddr(0x2000));
    }
}
