use std::net::IpAddr;

use npl_core::{Protocol, Result};

use crate::slot::{ProtocolSlot, SlotState};

/// Groups the slots for every supported protocol sharing one node port,
/// plus the endpoint it forwards to (§3). Referenced by exactly one key
/// in each of the table's two indices whenever at least one slot is
/// `InUse` (invariant 1/2) — the table, not the entry, owns that
/// bookkeeping; the entry itself only knows its own slots.
pub struct NodePortEntry {
    pub node_port: u16,
    pub pod_ip: IpAddr,
    pub pod_port: u16,
    pub protocols: Vec<ProtocolSlot>,
}

impl NodePortEntry {
    pub fn new(node_port: u16, pod_ip: IpAddr, pod_port: u16, protocols: Vec<ProtocolSlot>) -> Self {
        Self {
            node_port,
            pod_ip,
            pod_port,
            protocols,
        }
    }

    pub fn find_slot(&self, protocol: Protocol) -> Option<&ProtocolSlot> {
        self.protocols.iter().find(|slot| slot.protocol == protocol)
    }

    pub fn find_slot_mut(&mut self, protocol: Protocol) -> Option<&mut ProtocolSlot> {
        self.protocols
            .iter_mut()
            .find(|slot| slot.protocol == protocol)
    }

    pub fn protocol_in_use(&self, protocol: Protocol) -> bool {
        self.find_slot(protocol)
            .is_some_and(|slot| slot.state == SlotState::InUse)
    }

    pub fn in_use_count(&self) -> usize {
        self.protocols
            .iter()
            .filter(|slot| slot.state == SlotState::InUse)
            .count()
    }

    /// Protocols currently `InUse`, in `Protocol::SUPPORTED` order. Used by
    /// the restore sync path to compute the bulk `AddAllRules` payload.
    pub fn in_use_protocols(&self) -> Vec<Protocol> {
        self.protocols
            .iter()
            .filter(|slot| slot.state == SlotState::InUse)
            .map(|slot| slot.protocol)
            .collect()
    }

    /// Releases every `Open` slot's OS reservation (§4.2's `ReleaseAllOpen`).
    /// Called once an entry's last `InUse` slot has transitioned away,
    /// since an entry with no installed rules has no further use for its
    /// reserved-but-unused protocol slots either.
    pub fn close_open_slots(&mut self) -> Result<()> {
        for slot in &mut self.protocols {
            slot.close(self.node_port)?;
        }
        Ok(())
    }

    pub fn snapshot(&self) -> NodePortEntrySnapshot {
        NodePortEntrySnapshot {
            node_port: self.node_port,
            pod_ip: self.pod_ip,
            pod_port: self.pod_port,
            protocols: self
                .protocols
                .iter()
                .map(|slot| (slot.protocol, slot.state))
                .collect(),
        }
    }
}

/// Immutable, caller-owned copy of an entry's externally visible state;
/// returned by `GetEntry`/`GetDataForPodIP` so callers cannot reach back
/// into the table's internals (§4.1).
#[derive(Debug, Clone)]
pub struct NodePortEntrySnapshot {
    pub node_port: u16,
    pub pod_ip: IpAddr,
    pub pod_port: u16,
    pub protocols: Vec<(Protocol, SlotState)>,
}

impl NodePortEntrySnapshot {
    pub fn protocol_in_use(&self, protocol: Protocol) -> bool {
        self.protocols
            .iter()
            .any(|(p, state)| *p == protocol && *state == SlotState::InUse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opener::tests::FakeReservation;
    use std::net::Ipv4Addr;

    fn entry() -> NodePortEntry {
        NodePortEntry::new(
            61000,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            8080,
            vec![
                ProtocolSlot::reserved(Protocol::Tcp, Box::new(FakeReservation::ok())),
                ProtocolSlot::reserved(Protocol::Udp, Box::new(FakeReservation::ok())),
            ],
        )
    }

    #[test]
    fn find_slot_locates_each_protocol() {
        let e = entry();
        assert_eq!(e.find_slot(Protocol::Tcp).unwrap().protocol, Protocol::Tcp);
        assert_eq!(e.find_slot(Protocol::Udp).unwrap().protocol, Protocol::Udp);
    }

    #[test]
    fn in_use_accounting_tracks_transitions() {
        let mut e = entry();
        assert_eq!(e.in_use_count(), 0);
        e.find_slot_mut(Protocol::Tcp).unwrap().mark_in_use();
        assert_eq!(e.in_use_count(), 1);
        assert_eq!(e.in_use_protocols(), vec![Protocol::Tcp]);
        assert!(e.protocol_in_use(Protocol::Tcp));
        assert!(!e.protocol_in_use(Protocol::Udp));
    }

    #[test]
    fn close_open_slots_closes_every_open_slot() {
        let mut e = entry();
        e.close_open_slots().unwrap();
        for slot in &e.protocols {
            assert_eq!(slot.state, SlotState::Closed);
        }
    }

    #[test]
    fn close_open_slots_rejects_when_one_slot_is_in_use() {
        let mut e = entry();
        e.find_slot_mut(Protocol::Tcp).unwrap().mark_in_use();
        assert!(e.close_open_slots().is_err());
    }

    #[test]
    fn snapshot_reflects_current_state_and_is_detached() {
        let mut e = entry();
        e.find_slot_mut(Protocol::Tcp).unwrap().mark_in_use();
        let snap = e.snapshot();
        assert!(snap.protocol_in_use(Protocol::Tcp));
        assert!(!snap.protocol_in_use(Protocol::Udp));
    }
}
