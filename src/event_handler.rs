//! Translates kernel-observed events back into switch-state updates.
//! Every translation is a pure `fn(old_state) -> new_state?` handed to the
//! agent's update queue — the handler itself never touches the state
//! directly, only through [`crate::switch_state::UpdateQueue::publish`].
//!
//! Non-unicast routes are filtered out upstream by the observer's
//! classifier; an event whose `ifindex` is not a core-owned tap is
//! silently dropped here, at the one place that already needs the
//! registry lookup to resolve an `InterfaceID` in the first place.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::config::NeighborTableScope;
use crate::ids::InterfaceId;
use crate::netlink::observer::KernelEvent;
use crate::registry::TapRegistry;
use crate::switch_state::{KernelRoute, NeighborEntry, NeighborTable, UpdateQueue, Vlan};

pub struct KernelEventHandler {
    registry: TapRegistry,
    scope: NeighborTableScope,
}

impl KernelEventHandler {
    pub fn new(registry: TapRegistry, scope: NeighborTableScope) -> Self {
        Self { registry, scope }
    }

    pub async fn run(
        &self,
        mut events: mpsc::UnboundedReceiver<KernelEvent>,
        queue: Arc<UpdateQueue>,
        mut cancel: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                biased;
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        debug!("kernel event handler cancelled");
                        return;
                    }
                }
                event = events.recv() => {
                    let Some(event) = event else { return };
                    self.handle(event, &queue).await;
                }
            }
        }
    }

    async fn resolve(&self, ifindex: i32) -> Option<InterfaceId> {
        self.registry.read().await.get(&ifindex).copied()
    }

    async fn handle(&self, event: KernelEvent, queue: &UpdateQueue) {
        match event {
            KernelEvent::LinkChanged { interface_id, mac, mtu, .. } => {
                queue.publish(move |state| {
                    let intf = state.interfaces.get(&interface_id)?;
                    let new_mac = mac.or(intf.mac);
                    let new_mtu = mtu.unwrap_or(intf.mtu);
                    if new_mac == intf.mac && new_mtu == intf.mtu {
                        return None;
                    }
                    let mut state = state.clone();
                    let intf = state.interfaces.get_mut(&interface_id).expect("checked above");
                    intf.mac = new_mac;
                    intf.mtu = new_mtu;
                    Some(state)
                });
            }

            KernelEvent::AddrAdded { interface_id, addr, .. } => {
                queue.publish(move |state| {
                    let intf = state.interfaces.get(&interface_id)?;
                    if intf.addrs.contains(&addr) {
                        return None;
                    }
                    let mut state = state.clone();
                    state
                        .interfaces
                        .get_mut(&interface_id)
                        .expect("checked above")
                        .addrs
                        .insert(addr);
                    Some(state)
                });
            }

            KernelEvent::AddrRemoved { interface_id, addr, .. } => {
                queue.publish(move |state| {
                    let intf = state.interfaces.get(&interface_id)?;
                    if !intf.addrs.contains(&addr) {
                        return None;
                    }
                    let mut state = state.clone();
                    state
                        .interfaces
                        .get_mut(&interface_id)
                        .expect("checked above")
                        .addrs
                        .remove(&addr);
                    Some(state)
                });
            }

            KernelEvent::NeighborAdded { ifindex, ip, mac } => {
                let Some(interface_id) = self.resolve(ifindex).await else { return };
                let scope = self.scope;
                queue.publish(move |state| match scope {
                    NeighborTableScope::Interface => {
                        if let Some(existing) = state
                            .interface_neighbors
                            .get(&interface_id)
                            .and_then(|t| t.entries.get(&ip))
                        {
                            if !existing.pending && existing.mac == mac {
                                return None;
                            }
                        }
                        let port = state.interfaces.get(&interface_id)?.member_ports.first().copied();
                        let mut state = state.clone();
                        state
                            .interface_neighbors
                            .entry(interface_id)
                            .or_default()
                            .entries
                            .insert(ip, NeighborEntry { mac, port, interface_id, pending: false });
                        Some(state)
                    }
                    NeighborTableScope::Vlan => {
                        let vlan_id = state.interfaces.get(&interface_id)?.vlan?;
                        if let Some(existing) =
                            state.vlans.get(&vlan_id).and_then(|v| v.neighbors.entries.get(&ip))
                        {
                            if !existing.pending && existing.mac == mac {
                                return None;
                            }
                        }
                        let port = state.interfaces.get(&interface_id)?.member_ports.first().copied();
                        let mut state = state.clone();
                        let vlan = state
                            .vlans
                            .entry(vlan_id)
                            .or_insert_with(|| Vlan { id: vlan_id, neighbors: NeighborTable::default() });
                        vlan.neighbors
                            .entries
                            .insert(ip, NeighborEntry { mac, port, interface_id, pending: false });
                        Some(state)
                    }
                });
            }

            KernelEvent::NeighborRemoved { ifindex, ip } => {
                let Some(interface_id) = self.resolve(ifindex).await else { return };
                let scope = self.scope;
                queue.publish(move |state| match scope {
                    NeighborTableScope::Interface => {
                        let present = state
                            .interface_neighbors
                            .get(&interface_id)
                            .is_some_and(|t| t.entries.contains_key(&ip));
                        if !present {
                            return None;
                        }
                        let mut state = state.clone();
                        if let Some(t) = state.interface_neighbors.get_mut(&interface_id) {
                            t.entries.remove(&ip);
                        }
                        Some(state)
                    }
                    NeighborTableScope::Vlan => {
                        let vlan_id = state.interfaces.get(&interface_id)?.vlan?;
                        let present = state.vlans.get(&vlan_id).is_some_and(|v| v.neighbors.entries.contains_key(&ip));
                        if !present {
                            return None;
                        }
                        let mut state = state.clone();
                        if let Some(v) = state.vlans.get_mut(&vlan_id) {
                            v.neighbors.entries.remove(&ip);
                        }
                        Some(state)
                    }
                });
            }

            KernelEvent::RouteAdded { dest, prefix_len, ifindex, gateway, .. } => {
                let Some(interface_id) = self.resolve(ifindex).await else { return };
                queue.publish(move |state| {
                    let route = KernelRoute { dest, prefix_len, gateway };
                    if state.kernel_routes.get(&interface_id).is_some_and(|r| r.contains(&route)) {
                        return None;
                    }
                    let mut state = state.clone();
                    state.kernel_routes.entry(interface_id).or_default().insert(route);
                    Some(state)
                });
            }

            KernelEvent::RouteRemoved { dest, prefix_len, ifindex, gateway, .. } => {
                let Some(interface_id) = self.resolve(ifindex).await else { return };
                queue.publish(move |state| {
                    let route = KernelRoute { dest, prefix_len, gateway };
                    if !state.kernel_routes.get(&interface_id).is_some_and(|r| r.contains(&route)) {
                        return None;
                    }
                    let mut state = state.clone();
                    if let Some(set) = state.kernel_routes.get_mut(&interface_id) {
                        set.remove(&route);
                    }
                    Some(state)
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::PrefixAddr;
    use crate::switch_state::{Interface, MacAddr, SwitchState};
    use std::net::Ipv4Addr;
    use std::time::Duration;

    async fn handler_with_registry(ifindex: i32, id: InterfaceId) -> KernelEventHandler {
        let registry = crate::registry::new_registry();
        registry.write().await.insert(ifindex, id);
        KernelEventHandler::new(registry, NeighborTableScope::Interface)
    }

    #[tokio::test]
    async fn neighbor_added_twice_only_updates_once() {
        let id = InterfaceId(2001);
        let handler = handler_with_registry(42, id).await;
        let mut state = SwitchState::default();
        state.interfaces.insert(id, Interface::new(id, 9000));
        let queue = Arc::new(UpdateQueue::new(state));
        let mut deltas = queue.subscribe();

        let ip: std::net::IpAddr = Ipv4Addr::new(10, 0, 0, 2).into();
        let mac = MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);

        handler
            .handle(KernelEvent::NeighborAdded { ifindex: 42, ip, mac }, &queue)
            .await;
        let delta = tokio::time::timeout(Duration::from_secs(1), deltas.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(delta.new.interface_neighbors[&id].entries.contains_key(&ip));

        handler
            .handle(KernelEvent::NeighborAdded { ifindex: 42, ip, mac }, &queue)
            .await;
        let second = tokio::time::timeout(Duration::from_millis(200), deltas.recv()).await;
        assert!(second.is_err(), "identical neighbor add produced a second update");
    }

    #[tokio::test]
    async fn addr_added_is_idempotent() {
        let id = InterfaceId(2001);
        let handler = handler_with_registry(42, id).await;
        let mut state = SwitchState::default();
        state.interfaces.insert(id, Interface::new(id, 9000));
        let queue = Arc::new(UpdateQueue::new(state));
        let mut deltas = queue.subscribe();

        let addr = PrefixAddr::new(Ipv4Addr::new(10, 0, 0, 5).into(), 31);
        handler
            .handle(KernelEvent::AddrAdded { interface_id: id, ifindex: 42, addr }, &queue)
            .await;
        deltas.recv().await.unwrap();

        handler
            .handle(KernelEvent::AddrAdded { interface_id: id, ifindex: 42, addr }, &queue)
            .await;
        let second = tokio::time::timeout(Duration::from_millis(200), deltas.recv()).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn unknown_ifindex_produces_no_update() {
        let handler = handler_with_registry(42, InterfaceId(2001)).await;
        let state = SwitchState::default();
        let queue = Arc::new(UpdateQueue::new(state));
        let mut deltas = queue.subscribe();

        let ip: std::net::IpAddr = Ipv4Addr::new(10, 0, 0, 9).into();
        handler.handle(KernelEvent::NeighborRemoved { ifindex: 999, ip }, &queue).await;
        let result = tokio::time::timeout(Duration::from_millis(200), deltas.recv()).await;
        assert!(result.is_err());
    }
}
