//! PDU forwarding table.
//!
//! Maps a destination address to the lower flow that reaches it. Every
//! entry is owned by its lower flow: when the flow goes away, all entries
//! pointing at it are removed in one sweep. A single table-wide lock
//! serialises all operations; lookups clone an `Arc` and never allocate.

use crate::pci::Address;
use crate::rmt::LowerFlow;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct PduftInner {
    by_addr: FxHashMap<Address, Arc<LowerFlow>>,
    /// Addresses owned by each lower flow, keyed by its local port id.
    owned: FxHashMap<u32, FxHashSet<Address>>,
}

#[derive(Default)]
pub struct Pduft {
    inner: Mutex<PduftInner>,
}

impl Pduft {
    pub fn new() -> Pduft {
        Pduft::default()
    }

    /// Upserts the entry for `addr`. If another flow owned the entry, it is
    /// transferred. Idempotent for the same (address, flow) pair.
    pub fn set(&self, addr: Address, flow: &Arc<LowerFlow>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(prev) = inner.by_addr.insert(addr, flow.clone()) {
            if prev.port_id() != flow.port_id() {
                if let Some(owned) = inner.owned.get_mut(&prev.port_id()) {
                    owned.remove(&addr);
                }
            }
        }
        inner.owned.entry(flow.port_id()).or_default().insert(addr);
    }

    pub fn lookup(&self, addr: Address) -> Option<Arc<LowerFlow>> {
        self.inner.lock().unwrap().by_addr.get(&addr).cloned()
    }

    /// Removes the entry for `addr`. Returns whether one existed.
    pub fn del(&self, addr: Address) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.by_addr.remove(&addr) {
            Some(flow) => {
                if let Some(owned) = inner.owned.get_mut(&flow.port_id()) {
                    owned.remove(&addr);
                }
                true
            }
            None => false,
        }
    }

    pub fn flush(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.by_addr.clear();
        inner.owned.clear();
    }

    /// Removes every entry owned by the lower flow on `port_id`.
    pub fn remove_flow(&self, port_id: u32) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(owned) = inner.owned.remove(&port_id) {
            for addr in owned {
                inner.by_addr.remove(&addr);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().by_addr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rmt::{LowerIpcp, MockLowerFlowIo};

    fn lower_flow(port_id: u32) -> Arc<LowerFlow> {
        LowerFlow::new(
            port_id,
            LowerIpcp::new("eth0"),
            Arc::new(MockLowerFlowIo::new()),
        )
    }

    #[test]
    fn test_set_lookup_round_trip() {
        let pduft = Pduft::new();
        let flow = lower_flow(1);

        pduft.set(42, &flow);
        let found = pduft.lookup(42).unwrap();
        assert_eq!(found.port_id(), 1);
        assert!(pduft.lookup(43).is_none());
    }

    #[test]
    fn test_set_is_idempotent() {
        let pduft = Pduft::new();
        let flow = lower_flow(1);

        pduft.set(42, &flow);
        pduft.set(42, &flow);
        assert_eq!(pduft.len(), 1);

        pduft.remove_flow(1);
        assert!(pduft.is_empty());
    }

    #[test]
    fn test_set_transfers_ownership() {
        let pduft = Pduft::new();
        let old = lower_flow(1);
        let new = lower_flow(2);

        pduft.set(42, &old);
        pduft.set(42, &new);
        assert_eq!(pduft.lookup(42).unwrap().port_id(), 2);

        // the old flow no longer owns the entry
        pduft.remove_flow(1);
        assert_eq!(pduft.lookup(42).unwrap().port_id(), 2);

        pduft.remove_flow(2);
        assert!(pduft.lookup(42).is_none());
    }

    #[test]
    fn test_del() {
        let pduft = Pduft::new();
        let flow = lower_flow(1);

        pduft.set(42, &flow);
        assert!(pduft.del(42));
        assert!(pduft.lookup(42).is_none());
        assert!(!pduft.del(42));
    }

    #[test]
    fn test_flush() {
        let pduft = Pduft::new();
        let flow = lower_flow(1);

        pduft.set(42, &flow);
        pduft.set(43, &flow);
        pduft.flush();
        assert!(pduft.is_empty());
        assert!(pduft.lookup(42).is_none());
    }

    #[test]
    fn test_remove_flow_leaves_other_flows_alone() {
        let pduft = Pduft::new();
        let a = lower_flow(1);
        let b = lower_flow(2);

        pduft.set(42, &a);
        pduft.set(43, &a);
        pduft.set(44, &b);

        pduft.remove_flow(1);
        assert!(pduft.lookup(42).is_none());
        assert!(pduft.lookup(43).is_none());
        assert_eq!(pduft.lookup(44).unwrap().port_id(), 2);
    }
}
