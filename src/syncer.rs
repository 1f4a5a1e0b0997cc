//! Single-writer reconciler: the core of the core. Diffs desired switch
//! state against the locally observed tap map and issues the minimal
//! netlink/ioctl mutation sequence to close the gap.
//!
//! Runs exclusively on one dedicated executor — every `sync()` call and
//! every startup probe is serialized through `&mut self`, which is what
//! rules out lost-update races against netlink without any additional
//! locking on the syncer's own logic. The `taps` map is the one piece of
//! state shared outside this executor (the packet pump's send path reads
//! it), so it alone is behind a mutex.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use tokio::sync::mpsc;

use crate::ids::{InterfaceId, PrefixAddr};
use crate::netlink::NetlinkPort;
use crate::netlink::prober::TapProbe;
use crate::policy::PolicyRouter;
use crate::pump::PumpCommand;
use crate::registry::TapRegistry;
use crate::switch_state::SwitchState;
use crate::tap::{TapDevice, TapFactory};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredInterface {
    pub status: bool,
    pub mtu: u32,
    pub addrs: HashSet<PrefixAddr>,
}

/// Pure projection of the switch state this syncer cares about. Kept
/// separate from `sync()` itself so the diffing logic is testable without
/// any I/O at all.
pub fn derive_desired(state: &SwitchState) -> HashMap<InterfaceId, DesiredInterface> {
    state
        .interfaces
        .iter()
        .map(|(id, intf)| {
            (
                *id,
                DesiredInterface {
                    status: state.interface_up(*id),
                    mtu: intf.mtu,
                    addrs: intf.addrs.clone(),
                },
            )
        })
        .collect()
}

fn addr_by_ip(addrs: &HashSet<PrefixAddr>) -> HashMap<IpAddr, u8> {
    addrs.iter().map(|a| (a.addr, a.prefix_len)).collect()
}

pub struct InterfaceSyncer<N, T, P> {
    netlink: N,
    tap_factory: T,
    probe: P,
    policy: PolicyRouter,
    taps: Arc<Mutex<HashMap<InterfaceId, TapDevice>>>,
    registry: TapRegistry,
    probed: bool,
    syncs_performed: u64,
    pump_commands: Option<mpsc::UnboundedSender<PumpCommand>>,
    enabled: bool,
}

impl<N: NetlinkPort, T: TapFactory, P: TapProbe> InterfaceSyncer<N, T, P> {
    pub fn new(netlink: N, tap_factory: T, probe: P, policy: PolicyRouter, registry: TapRegistry) -> Self {
        Self {
            netlink,
            tap_factory,
            probe,
            policy,
            taps: Arc::new(Mutex::new(HashMap::new())),
            registry,
            probed: false,
            syncs_performed: 0,
            pump_commands: None,
            enabled: true,
        }
    }

    /// Registers a channel the syncer notifies whenever a tap's fd becomes
    /// available or goes away, so [`crate::pump::PacketPump`] stays in sync
    /// with the devices this executor owns.
    pub fn with_pump_commands(mut self, tx: mpsc::UnboundedSender<PumpCommand>) -> Self {
        self.pump_commands = Some(tx);
        self
    }

    /// Wires [`crate::config::Config::tun_intf_enabled`] into the syncer:
    /// when `false`, [`Self::sync`] becomes a no-op.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Shared handle the packet pump reads device pointers from. Readers
    /// must hold the lock only long enough to clone what they need.
    pub fn taps(&self) -> Arc<Mutex<HashMap<InterfaceId, TapDevice>>> {
        self.taps.clone()
    }

    pub fn syncs_performed(&self) -> u64 {
        self.syncs_performed
    }

    /// Reconcile the tap map with `state`. Safe to call repeatedly with an
    /// unchanged state: no mutation on this path issues a netlink write
    /// unless something actually differs.
    pub async fn sync(&mut self, state: &SwitchState) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let desired = derive_desired(state);

        if !self.probed {
            self.bootstrap_probe(&desired).await?;
        }

        self.reconcile_mtu(&desired);

        let mut current_ids: Vec<InterfaceId> = {
            self.taps.lock().expect("tap map poisoned").keys().copied().collect()
        };
        current_ids.sort();
        let mut desired_ids: Vec<InterfaceId> = desired.keys().copied().collect();
        desired_ids.sort();

        let mut ci = current_ids.into_iter().peekable();
        let mut di = desired_ids.into_iter().peekable();
        loop {
            match (ci.peek().copied(), di.peek().copied()) {
                (Some(c), Some(d)) if c < d => {
                    self.remove_interface(c).await;
                    ci.next();
                }
                (Some(c), Some(d)) if c > d => {
                    self.add_new_interface(d, &desired[&d]).await;
                    di.next();
                }
                (Some(c), Some(_d)) => {
                    self.apply_existing(c, &desired[&c]).await;
                    ci.next();
                    di.next();
                }
                (Some(c), None) => {
                    self.remove_interface(c).await;
                    ci.next();
                }
                (None, Some(d)) => {
                    self.add_new_interface(d, &desired[&d]).await;
                    di.next();
                }
                (None, None) => break,
            }
        }

        self.syncs_performed += 1;
        Ok(())
    }

    /// One-shot merge of whatever the kernel already has for interfaces
    /// the switch state still wants, so a process restart does not
    /// recreate tap devices that already exist. An `fboss`-named link
    /// probed for an `InterfaceID` the switch state no longer knows about
    /// is left untouched entirely — neither adopted nor removed.
    async fn bootstrap_probe(&mut self, desired: &HashMap<InterfaceId, DesiredInterface>) -> Result<()> {
        let (probed_taps, probed_addrs) = self.probe.probe().await?;
        {
            let mut taps = self.taps.lock().expect("tap map poisoned");
            for pt in probed_taps {
                if !desired.contains_key(&pt.interface_id) || taps.contains_key(&pt.interface_id) {
                    continue;
                }
                let mut dev = TapDevice::adopt(pt.interface_id, pt.ifindex);
                for pa in probed_addrs.iter().filter(|a| a.ifindex == pt.ifindex) {
                    dev.add_addr(PrefixAddr::new(pa.addr, pa.prefix_len));
                }
                taps.insert(pt.interface_id, dev);
            }
        }

        let mut reg = self.registry.write().await;
        for (id, dev) in self.taps.lock().expect("tap map poisoned").iter() {
            if let Some(ifindex) = dev.ifindex {
                reg.insert(ifindex, *id);
            }
        }
        drop(reg);

        self.probed = true;
        Ok(())
    }

    fn reconcile_mtu(&self, desired: &HashMap<InterfaceId, DesiredInterface>) {
        let mut taps = self.taps.lock().expect("tap map poisoned");
        for (id, dev) in taps.iter_mut() {
            let Some(want) = desired.get(id) else { continue };
            if dev.mtu != want.mtu {
                match dev.set_mtu(want.mtu) {
                    Ok(()) => {
                        if let (Some(tx), Some(raw_fd)) = (&self.pump_commands, dev.raw_fd()) {
                            let _ = tx.send(PumpCommand::Register { id: *id, fd: raw_fd, mtu: dev.mtu });
                        }
                    }
                    Err(e) => warn!(interface = %id, "failed to update MTU: {e}"),
                }
            }
        }
    }

    /// Add sequence: create, bring up iff desired UP, install default
    /// routes, then per-address rule-then-address.
    async fn add_new_interface(&mut self, id: InterfaceId, desired: &DesiredInterface) {
        let mut dev = match self.tap_factory.create(id, desired.mtu) {
            Ok(dev) => dev,
            Err(e) => {
                // The corresponding switch interface is still programmed
                // into the ASIC; it just has no kernel mirror.
                warn!(interface = %id, "failed to create tap device: {e}");
                return;
            }
        };

        if let Some(ifindex) = dev.ifindex {
            self.registry.write().await.insert(ifindex, id);
            self.netlink.disable_ipv6_addr_gen_mode(ifindex as u32).await;
        }

        if desired.status {
            if let Err(e) = dev.set_admin_status(true) {
                warn!(interface = %id, "failed to bring tap up: {e}");
            }
        }

        let table_id = self.policy.table_id(id);
        if let Some(ifindex) = dev.ifindex {
            if let Err(e) = self.netlink.install_default_routes(table_id, ifindex as u32).await {
                warn!(interface = %id, "failed to install default routes: {e}");
            }
        }

        if let Some(ifindex) = dev.ifindex {
            for addr in &desired.addrs {
                self.install_address_netlink(id, ifindex, *addr).await;
                dev.add_addr(*addr);
            }
        }

        if let (Some(tx), Some(raw_fd)) = (&self.pump_commands, dev.raw_fd()) {
            let _ = tx.send(PumpCommand::Register { id, fd: raw_fd, mtu: dev.mtu });
        }

        info!(interface = %id, name = %dev.host_name, "tap device created");
        self.taps.lock().expect("tap map poisoned").insert(id, dev);
    }

    /// Remove sequence: per-address rule delete, then default-route
    /// delete, then tear the device down. Addresses themselves are not
    /// explicitly deleted — they disappear with the link.
    async fn remove_interface(&mut self, id: InterfaceId) {
        let Some(mut dev) = self.taps.lock().expect("tap map poisoned").remove(&id) else {
            return;
        };

        let table_id = self.policy.table_id(id);
        let addrs: Vec<PrefixAddr> = dev.addrs.iter().copied().collect();
        for addr in addrs {
            if let Some(rule) = self.policy.rule_for(id, addr) {
                if let Err(e) = self.netlink.rule_del(rule).await {
                    if !e.is_not_found() {
                        warn!(interface = %id, %addr, "rule delete failed: {e}");
                    }
                }
            }
        }

        if let Some(ifindex) = dev.ifindex {
            if let Err(e) = self.netlink.remove_default_routes(table_id, ifindex as u32).await {
                if !e.is_not_found() {
                    warn!(interface = %id, "default route removal failed: {e}");
                }
            }
            self.registry.write().await.remove(&ifindex);
        }

        if let Some(tx) = &self.pump_commands {
            let _ = tx.send(PumpCommand::Unregister { id });
        }

        dev.to_delete = true;
        dev.close();
        debug!(interface = %id, "tap device removed");
    }

    /// Status change, then address diff, then per-address adds/removes
    /// (§4.E step 5, "both" case).
    async fn apply_existing(&mut self, id: InterfaceId, desired: &DesiredInterface) {
        let table_id = self.policy.table_id(id);
        let (was_up, ifindex) = {
            let taps = self.taps.lock().expect("tap map poisoned");
            let dev = taps.get(&id);
            (dev.map(|d| d.admin_up).unwrap_or(false), dev.and_then(|d| d.ifindex))
        };

        if was_up != desired.status {
            let mut taps = self.taps.lock().expect("tap map poisoned");
            if let Some(dev) = taps.get_mut(&id) {
                if let Err(e) = dev.set_admin_status(desired.status) {
                    warn!(interface = %id, "failed to set admin status: {e}");
                }
            }
        }

        // A DOWN→UP transition reinstalls the table and every address, but
        // never rules: the kernel silently duplicates a rule re-add, and
        // they were never removed while the link was merely down.
        if !was_up && desired.status {
            if let Some(ifindex) = ifindex {
                if let Err(e) = self.netlink.install_default_routes(table_id, ifindex as u32).await {
                    warn!(interface = %id, "failed to reinstall default routes: {e}");
                }
                for addr in &desired.addrs {
                    if let Err(e) = self.netlink.address_replace(ifindex as u32, *addr).await {
                        warn!(interface = %id, %addr, "failed to reinstall address: {e}");
                    }
                }
            }
            let mut taps = self.taps.lock().expect("tap map poisoned");
            if let Some(dev) = taps.get_mut(&id) {
                dev.set_addrs(desired.addrs.clone());
            }
            return;
        }

        let current_by_ip = {
            let taps = self.taps.lock().expect("tap map poisoned");
            taps.get(&id).map(|d| addr_by_ip(&d.addrs)).unwrap_or_default()
        };
        let desired_by_ip = addr_by_ip(&desired.addrs);

        let mut all_ips: Vec<IpAddr> = current_by_ip.keys().chain(desired_by_ip.keys()).copied().collect();
        all_ips.sort();
        all_ips.dedup();

        let Some(ifindex) = ifindex else { return };
        let mut added = Vec::new();
        let mut removed = Vec::new();

        for ip in all_ips {
            match (current_by_ip.get(&ip), desired_by_ip.get(&ip)) {
                (Some(cp), Some(wp)) if cp == wp => {}
                (Some(cp), Some(wp)) => {
                    // Same key, different prefix length: remove then add.
                    let old = PrefixAddr::new(ip, *cp);
                    let new = PrefixAddr::new(ip, *wp);
                    self.uninstall_address_netlink(id, ifindex, old).await;
                    removed.push(old);
                    if desired.status {
                        self.install_address_netlink(id, ifindex, new).await;
                        added.push(new);
                    }
                }
                (Some(cp), None) => {
                    let old = PrefixAddr::new(ip, *cp);
                    self.uninstall_address_netlink(id, ifindex, old).await;
                    removed.push(old);
                }
                (None, Some(wp)) => {
                    // New addresses are only installed while the link is UP.
                    if desired.status {
                        let new = PrefixAddr::new(ip, *wp);
                        self.install_address_netlink(id, ifindex, new).await;
                        added.push(new);
                    }
                }
                (None, None) => unreachable!("ip present in neither map"),
            }
        }

        let mut taps = self.taps.lock().expect("tap map poisoned");
        if let Some(dev) = taps.get_mut(&id) {
            for a in &removed {
                dev.remove_addr(a);
            }
            for a in &added {
                dev.add_addr(*a);
            }
        }
    }

    /// Installs rule-then-address. If the address install fails after the
    /// rule succeeded, the rule is rolled back so a half-installed address
    /// never leaves a dangling source-routing rule pointing at nothing.
    async fn install_address_netlink(&self, id: InterfaceId, ifindex: i32, addr: PrefixAddr) {
        let rule = self.policy.rule_for(id, addr);
        if let Some(rule) = rule {
            if let Err(e) = self.netlink.rule_add(rule).await {
                warn!(interface = %id, %addr, "rule add failed: {e}");
            }
        }
        if let Err(e) = self.netlink.address_replace(ifindex as u32, addr).await {
            warn!(interface = %id, %addr, "address add failed: {e}");
            if let Some(rule) = rule {
                if let Err(e) = self.netlink.rule_del(rule).await {
                    if !e.is_not_found() {
                        warn!(interface = %id, %addr, "rule rollback after failed address add failed: {e}");
                    }
                }
            }
        }
    }

    async fn uninstall_address_netlink(&self, id: InterfaceId, ifindex: i32, addr: PrefixAddr) {
        if let Some(rule) = self.policy.rule_for(id, addr) {
            if let Err(e) = self.netlink.rule_del(rule).await {
                if !e.is_not_found() {
                    warn!(interface = %id, %addr, "rule delete failed: {e}");
                }
            }
        }
        if let Err(e) = self.netlink.address_del(ifindex as u32, addr).await {
            if !e.is_not_found() {
                warn!(interface = %id, %addr, "address delete failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::ids::InterfaceId;
    use crate::netlink::prober::{ProbedAddress, ProbedTap};
    use crate::switch_state::Interface;
    use std::sync::atomic::{AtomicI32, Ordering};
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Default)]
    struct FakeNetlink {
        calls: AsyncMutex<Vec<String>>,
    }

    impl FakeNetlink {
        async fn calls(&self) -> Vec<String> {
            self.calls.lock().await.clone()
        }
    }

    impl NetlinkPort for FakeNetlink {
        async fn disable_ipv6_addr_gen_mode(&self, ifindex: u32) {
            self.calls.lock().await.push(format!("addr_gen_mode({ifindex})"));
        }
        async fn address_replace(&self, ifindex: u32, addr: PrefixAddr) -> Result<()> {
            self.calls.lock().await.push(format!("addr_replace({ifindex},{addr})"));
            Ok(())
        }
        async fn address_del(&self, ifindex: u32, addr: PrefixAddr) -> Result<()> {
            self.calls.lock().await.push(format!("addr_del({ifindex},{addr})"));
            Ok(())
        }
        async fn install_default_routes(&self, table_id: i32, ifindex: u32) -> Result<()> {
            self.calls.lock().await.push(format!("routes_install({table_id},{ifindex})"));
            Ok(())
        }
        async fn remove_default_routes(&self, table_id: i32, ifindex: u32) -> Result<()> {
            self.calls.lock().await.push(format!("routes_remove({table_id},{ifindex})"));
            Ok(())
        }
        async fn rule_add(&self, rule: crate::policy::RuleSpec) -> Result<()> {
            self.calls.lock().await.push(format!("rule_add({},{})", rule.addr, rule.table_id));
            Ok(())
        }
        async fn rule_del(&self, rule: crate::policy::RuleSpec) -> Result<()> {
            self.calls.lock().await.push(format!("rule_del({},{})", rule.addr, rule.table_id));
            Ok(())
        }
    }

    struct FakeTapFactory {
        next_ifindex: AtomicI32,
    }

    impl Default for FakeTapFactory {
        fn default() -> Self {
            Self { next_ifindex: AtomicI32::new(100) }
        }
    }

    impl TapFactory for FakeTapFactory {
        fn create(&self, interface_id: InterfaceId, _mtu: u32) -> Result<TapDevice> {
            let ifindex = self.next_ifindex.fetch_add(1, Ordering::SeqCst);
            Ok(TapDevice::adopt(interface_id, ifindex))
        }
    }

    struct EmptyProbe;

    impl TapProbe for EmptyProbe {
        async fn probe(&self) -> Result<(Vec<ProbedTap>, Vec<ProbedAddress>)> {
            Ok((Vec::new(), Vec::new()))
        }
    }

    fn state_with_interface(id: InterfaceId, addrs: &[(&str, u8)], up: bool) -> SwitchState {
        let mut state = SwitchState::default();
        let mut intf = Interface::new(id, 9000);
        intf.always_up = up;
        for (addr, prefix_len) in addrs {
            let ip: IpAddr = addr.parse().unwrap();
            intf.addrs.insert(PrefixAddr::new(ip, *prefix_len));
        }
        state.interfaces.insert(id, intf);
        state
    }

    fn test_syncer() -> InterfaceSyncer<FakeNetlink, FakeTapFactory, EmptyProbe> {
        InterfaceSyncer::new(
            FakeNetlink::default(),
            FakeTapFactory::default(),
            EmptyProbe,
            PolicyRouter::from_config(&Config::default()),
            crate::registry::new_registry(),
        )
    }

    #[tokio::test]
    async fn bring_up_one_interface_installs_routes_rules_and_addresses() {
        let id = InterfaceId(2001);
        let state = state_with_interface(id, &[("10.0.0.1", 31)], true);
        let mut syncer = test_syncer();
        syncer.sync(&state).await.unwrap();

        let calls = syncer.netlink.calls().await;
        assert!(calls.iter().any(|c| c.starts_with("routes_install")));
        assert!(calls.iter().any(|c| c.contains("rule_add(10.0.0.1/31")));
        assert!(calls.iter().any(|c| c.contains("addr_replace")));
        assert!(syncer.taps.lock().unwrap().contains_key(&id));
    }

    #[tokio::test]
    async fn idempotent_resync_issues_no_further_mutations() {
        let id = InterfaceId(2001);
        let state = state_with_interface(id, &[("10.0.0.1", 31)], true);
        let mut syncer = test_syncer();
        syncer.sync(&state).await.unwrap();
        let after_first = syncer.netlink.calls().await.len();

        syncer.sync(&state).await.unwrap();
        let after_second = syncer.netlink.calls().await.len();
        assert_eq!(after_first, after_second, "second sync issued new netlink calls");
    }

    #[tokio::test]
    async fn address_change_removes_old_rule_then_installs_new() {
        let id = InterfaceId(2001);
        let mut syncer = test_syncer();
        syncer.sync(&state_with_interface(id, &[("10.0.0.1", 31)], true)).await.unwrap();

        syncer.sync(&state_with_interface(id, &[("10.0.0.3", 31)], true)).await.unwrap();
        let calls = syncer.netlink.calls().await;
        let rule_del_idx = calls.iter().position(|c| c.contains("rule_del(10.0.0.1")).unwrap();
        let rule_add_idx = calls.iter().position(|c| c.contains("rule_add(10.0.0.3")).unwrap();
        assert!(rule_del_idx < rule_add_idx);
        assert!(!calls.iter().any(|c| c.starts_with("routes_install") && calls.iter().filter(|c2| c2.starts_with("routes_install")).count() > 1));
    }

    #[tokio::test]
    async fn down_then_up_reinstalls_routes_and_addresses_but_not_rules() {
        let id = InterfaceId(2001);
        let mut syncer = test_syncer();
        let addrs = &[("10.0.0.1", 31)];

        syncer.sync(&state_with_interface(id, addrs, true)).await.unwrap();
        syncer.sync(&state_with_interface(id, addrs, false)).await.unwrap();
        syncer.sync(&state_with_interface(id, addrs, true)).await.unwrap();

        let calls = syncer.netlink.calls().await;
        let rule_adds = calls.iter().filter(|c| c.starts_with("rule_add")).count();
        let routes_installs = calls.iter().filter(|c| c.starts_with("routes_install")).count();
        let addr_replaces = calls.iter().filter(|c| c.starts_with("addr_replace")).count();

        assert_eq!(rule_adds, 1, "DOWN->UP must not re-issue the source-routing rule");
        assert_eq!(routes_installs, 2, "DOWN->UP must reinstall the per-table default routes");
        assert_eq!(addr_replaces, 2, "DOWN->UP must reinstall the address");
    }

    #[tokio::test]
    async fn removal_tolerates_not_found_and_drops_tap() {
        let id = InterfaceId(2001);
        let mut syncer = test_syncer();
        syncer.sync(&state_with_interface(id, &[("10.0.0.1", 31)], true)).await.unwrap();

        let empty = SwitchState::default();
        syncer.sync(&empty).await.unwrap();
        assert!(!syncer.taps.lock().unwrap().contains_key(&id));
    }

    #[tokio::test]
    async fn bootstrap_probe_ignores_taps_for_unknown_interfaces() {
        struct OneStaleTap;
        impl TapProbe for OneStaleTap {
            async fn probe(&self) -> Result<(Vec<ProbedTap>, Vec<ProbedAddress>)> {
                Ok((vec![ProbedTap { interface_id: InterfaceId(9999), ifindex: 55 }], Vec::new()))
            }
        }
        let mut syncer = InterfaceSyncer::new(
            FakeNetlink::default(),
            FakeTapFactory::default(),
            OneStaleTap,
            PolicyRouter::from_config(&Config::default()),
            crate::registry::new_registry(),
        );
        syncer.sync(&SwitchState::default()).await.unwrap();
        assert!(!syncer.taps.lock().unwrap().contains_key(&InterfaceId(9999)));
    }
}
