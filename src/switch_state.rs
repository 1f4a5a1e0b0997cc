//! The switch state tree this core consumes (but does not own).
//!
//! Modeled as an immutable, copy-on-write tree behind a single [`ArcSwap`],
//! mutated only by a single-writer update queue that serializes publishers —
//! the same shape the teacher crate uses for its `AppState`
//! (`Arc<RwLock<AppState>>`, swapped wholesale per netlink event), adapted
//! here to an atomic pointer swap so consumers never block a writer and
//! always see a fully-formed snapshot.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::{broadcast, mpsc};

use crate::ids::{InterfaceId, PrefixAddr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortId(pub i32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VlanId(pub i32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAddr(pub [u8; 6]);

impl std::fmt::Display for MacAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Port {
    pub id: PortId,
    pub up: bool,
}

/// A logical L3 interface in the agent's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub id: InterfaceId,
    pub mac: Option<MacAddr>,
    pub mtu: u32,
    pub addrs: HashSet<PrefixAddr>,
    pub vlan: Option<VlanId>,
    pub member_ports: Vec<PortId>,
    /// Virtual interfaces (and interfaces with sync disabled) are always
    /// treated as UP regardless of member port state.
    pub always_up: bool,
}

impl Interface {
    pub fn new(id: InterfaceId, mtu: u32) -> Self {
        Self {
            id,
            mac: None,
            mtu,
            addrs: HashSet::new(),
            vlan: None,
            member_ports: Vec::new(),
            always_up: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeighborEntry {
    pub mac: MacAddr,
    pub port: Option<PortId>,
    pub interface_id: InterfaceId,
    pub pending: bool,
}

/// ARP (v4) / NDP (v6) table, keyed by neighbor IP.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NeighborTable {
    pub entries: HashMap<std::net::IpAddr, NeighborEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct Vlan {
    pub id: VlanId,
    pub neighbors: NeighborTable,
}

/// A route the kernel learned on a tap (e.g. via DHCP, or installed by some
/// other host-side agent) and the event handler fed back up for visibility.
/// Distinct from the routes the syncer installs: this is one-directional,
/// kernel-to-state, and never replayed back onto the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelRoute {
    pub dest: IpAddr,
    pub prefix_len: u8,
    pub gateway: Option<IpAddr>,
}

/// The immutable snapshot consumers of this core read. Cloning is shallow
/// for unchanged subtrees in spirit (structural sharing is left to the
/// agent's real tree implementation); here we clone eagerly since this
/// crate only needs correctness, not the agent's full COW machinery.
#[derive(Debug, Clone, Default)]
pub struct SwitchState {
    pub interfaces: HashMap<InterfaceId, Interface>,
    pub ports: HashMap<PortId, Port>,
    pub vlans: HashMap<VlanId, Vlan>,
    /// Used only in the deployment where neighbor tables live per-interface
    /// rather than per-VLAN.
    pub interface_neighbors: HashMap<InterfaceId, NeighborTable>,
    /// Routes observed arriving on a tap from the kernel side, keyed by the
    /// owning interface.
    pub kernel_routes: HashMap<InterfaceId, HashSet<KernelRoute>>,
}

impl SwitchState {
    /// UP iff any member port is UP, else DOWN; virtual or sync-disabled
    /// interfaces are always UP.
    pub fn interface_up(&self, ifid: InterfaceId) -> bool {
        let Some(intf) = self.interfaces.get(&ifid) else {
            return false;
        };
        if intf.always_up {
            return true;
        }
        intf.member_ports
            .iter()
            .any(|p| self.ports.get(p).is_some_and(|port| port.up))
    }
}

/// Emitted whenever the update queue swaps in a new root.
#[derive(Debug, Clone)]
pub struct StateDelta {
    pub old: Arc<SwitchState>,
    pub new: Arc<SwitchState>,
}

type UpdateFn = Box<dyn FnOnce(&SwitchState) -> Option<SwitchState> + Send>;

/// Single-writer update queue: publishers submit pure `fn(old) -> new?`
/// closures; a dedicated task applies them in submission order and performs
/// the atomic swap, so there is never a lost-update race between two
/// concurrent publishers.
pub struct UpdateQueue {
    tx: mpsc::UnboundedSender<UpdateFn>,
    state: Arc<ArcSwap<SwitchState>>,
    deltas: broadcast::Sender<StateDelta>,
}

impl UpdateQueue {
    pub fn new(initial: SwitchState) -> Self {
        let state = Arc::new(ArcSwap::from_pointee(initial));
        let (tx, mut rx) = mpsc::unbounded_channel::<UpdateFn>();
        let (deltas, _) = broadcast::channel(256);

        let worker_state = state.clone();
        let worker_deltas = deltas.clone();
        tokio::spawn(async move {
            while let Some(f) = rx.recv().await {
                let old = worker_state.load_full();
                let Some(new_state) = f(&old) else {
                    continue;
                };
                let new = Arc::new(new_state);
                worker_state.store(new.clone());
                // A lagging or absent subscriber must never stall the writer.
                let _ = worker_deltas.send(StateDelta { old, new });
            }
        });

        Self { tx, state, deltas }
    }

    /// Current snapshot. Cheap: an `Arc` clone under the swap's load path.
    pub fn current(&self) -> Arc<SwitchState> {
        self.state.load_full()
    }

    /// Enqueue a pure update function. Never blocks on the state lock.
    pub fn publish(&self, f: impl FnOnce(&SwitchState) -> Option<SwitchState> + Send + 'static) {
        // The channel has no backpressure by design: publishers must never
        // block, per the spec's "no blocking calls from callbacks" redesign.
        let _ = self.tx.send(Box::new(f));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateDelta> {
        self.deltas.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_applies_in_order_and_broadcasts() {
        let queue = UpdateQueue::new(SwitchState::default());
        let mut rx = queue.subscribe();

        queue.publish(|s| {
            let mut s = s.clone();
            s.ports.insert(PortId(1), Port { id: PortId(1), up: true });
            Some(s)
        });
        queue.publish(|s| {
            let mut s = s.clone();
            s.ports.insert(PortId(2), Port { id: PortId(2), up: false });
            Some(s)
        });

        let d1 = rx.recv().await.unwrap();
        assert_eq!(d1.new.ports.len(), 1);
        let d2 = rx.recv().await.unwrap();
        assert_eq!(d2.new.ports.len(), 2);
        assert_eq!(queue.current().ports.len(), 2);
    }

    #[test]
    fn interface_up_true_for_always_up() {
        let mut state = SwitchState::default();
        let mut intf = Interface::new(InterfaceId(1), 1500);
        intf.always_up = true;
        state.interfaces.insert(InterfaceId(1), intf);
        assert!(state.interface_up(InterfaceId(1)));
    }

    #[test]
    fn interface_up_follows_member_ports() {
        let mut state = SwitchState::default();
        let mut intf = Interface::new(InterfaceId(1), 1500);
        intf.member_ports = vec![PortId(1), PortId(2)];
        state.interfaces.insert(InterfaceId(1), intf);
        state.ports.insert(PortId(1), Port { id: PortId(1), up: false });
        state.ports.insert(PortId(2), Port { id: PortId(2), up: false });
        assert!(!state.interface_up(InterfaceId(1)));

        state.ports.insert(PortId(2), Port { id: PortId(2), up: true });
        assert!(state.interface_up(InterfaceId(1)));
    }
}
