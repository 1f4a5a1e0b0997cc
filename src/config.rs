use std::time::Duration;

/// Selects which of the two deployments' ARP/NDP table placement this
/// process's switch state uses, as a runtime parameter of
/// [`crate::event_handler::KernelEventHandler`] rather than a compile-time
/// guess.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighborTableScope {
    /// ARP/NDP tables live under the VLAN of the tap's switch interface.
    Vlan,
    /// ARP/NDP tables live under the interface itself.
    Interface,
}

/// Environment/config surface this crate consumes but does not parse itself
/// (config parsing is an out-of-scope collaborator per the design).
#[derive(Debug, Clone)]
pub struct Config {
    /// Master switch: if false, [`crate::syncer::InterfaceSyncer::sync`]
    /// is a no-op (no bootstrap probe, no tap creation/removal) while the
    /// kernel observer, state-delta subscription, and packet pump still
    /// run — they simply have no core-owned tap devices to act on.
    pub tun_intf_enabled: bool,
    /// Name of the host's management interface, which owns the kernel's
    /// main-table default route. Not read by this crate: every mutation
    /// this core performs is scoped to tap devices named `fboss<ID>` and
    /// their own derived per-interface tables (§3), so the management
    /// interface is never a candidate for mutation regardless of its name.
    /// Kept here as context for the embedding agent/operator, not as an
    /// enforced check.
    pub mgmt_intf_name: String,
    /// Selects the VoQ table-id strategy over the NPU one.
    pub voq_mode: bool,
    /// For VoQ deployments, the first switch's minimum system-port-range id,
    /// used as the table-id offset (single-router assumption; see DESIGN.md).
    pub voq_system_port_min: u32,
    /// Where ARP/NDP tables live for this deployment.
    pub neighbor_table_scope: NeighborTableScope,
    /// Cache-manager poll interval for the [`crate::netlink::observer::KernelObserver`].
    pub poll_interval: Duration,
}

/// MTU applied when a switch interface doesn't carry an explicit one.
pub const DEFAULT_MTU: u32 = 9000;

/// Netlink protocol id stamped on every route/rule this core installs
/// (vendor-assigned, >= static) so operators can filter `ip route show
/// table all` by origin.
pub const ROUTE_PROTOCOL_ID: u8 = 80;

/// Maximum packets drained from a single tap fd per readiness wakeup in L3
/// mode, bounding how long one device can monopolize the pump.
pub const PUMP_MAX_BATCH: usize = 16;

impl Default for Config {
    fn default() -> Self {
        Self {
            tun_intf_enabled: true,
            mgmt_intf_name: "eth0".to_string(),
            voq_mode: false,
            voq_system_port_min: 0,
            neighbor_table_scope: NeighborTableScope::Interface,
            poll_interval: Duration::from_millis(250),
        }
    }
}
