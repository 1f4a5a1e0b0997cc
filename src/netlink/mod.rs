//! Thin transactional wrapper over the route/addr/rule netlink families
//! (§4.B). Owned and exclusively called from the syncer's single-threaded
//! executor (§5) — the socket itself is not `Sync`-shared with any other
//! component.

pub mod observer;
pub mod prober;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use futures::TryStreamExt;
use netlink_packet_route::address::AddressAttribute;
use netlink_packet_route::route::{RouteAttribute, RouteMessage};
use rtnetlink::{Handle, LinkUnspec, RouteMessageBuilder};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::ids::PrefixAddr;
use crate::policy::RuleSpec;

pub fn format_mac(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Wraps the `rtnetlink` handle with the mutators the syncer needs, and
/// downgrades the races a single-writer reconciler always has to tolerate
/// (§7: `NotFound` on delete is a warning, not a sweep-aborting error).
#[derive(Clone)]
pub struct NetlinkClient {
    handle: Handle,
}

impl NetlinkClient {
    /// Open a fresh `NETLINK_ROUTE` socket and spawn its driving connection
    /// task. Failure here is `Fatal` per §7: a process with no netlink
    /// socket cannot do anything else useful.
    pub async fn connect() -> Result<Self> {
        let (conn, handle, _) = rtnetlink::new_connection()
            .map_err(|e| Error::Fatal(format!("failed to open netlink socket: {e}")))?;
        tokio::spawn(conn);
        Ok(Self { handle })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Disable IPv6 autoconf link-local generation on a freshly created
    /// tap. Not fatal if the kernel doesn't support `addr_gen_mode` — just
    /// logged and skipped, per §4.A.
    pub async fn disable_ipv6_addr_gen_mode(&self, ifindex: u32) {
        const IN6_ADDR_GEN_MODE_NONE: u8 = 1;
        let msg = rtnetlink::LinkMessageBuilder::<LinkUnspec>::new()
            .index(ifindex)
            .set_link_af_spec_inet6_addr_gen_mode(IN6_ADDR_GEN_MODE_NONE)
            .build();
        if let Err(e) = self.handle.link().set(msg).execute().await {
            debug!(ifindex, "addr_gen_mode unsupported by kernel, skipping: {e}");
        }
    }

    /// Idempotent address install (`NLM_F_REPLACE`): the kernel silently
    /// de-duplicates, unlike rules.
    pub async fn address_replace(&self, ifindex: u32, addr: PrefixAddr) -> Result<()> {
        self.handle
            .address()
            .add(ifindex, addr.addr, addr.prefix_len)
            .replace()
            .execute()
            .await?;
        Ok(())
    }

    pub async fn address_del(&self, ifindex: u32, addr: PrefixAddr) -> Result<()> {
        let mut addrs = self
            .handle
            .address()
            .get()
            .set_link_index_filter(ifindex)
            .execute();
        while let Some(msg) = addrs.try_next().await? {
            if msg.header.prefix_len != addr.prefix_len {
                continue;
            }
            let matches = msg.attributes.iter().any(|a| {
                matches!(a, AddressAttribute::Address(a) if *a == addr.addr)
            });
            if matches {
                match self.handle.address().del(msg).execute().await {
                    Ok(()) => return Ok(()),
                    Err(e) => return Err(downgrade_not_found(e.into())),
                }
            }
        }
        // Already gone — races with a link removal are expected (§8 S6).
        Ok(())
    }

    /// Install the two per-table default routes (`0.0.0.0/0`, `::/0`) with
    /// the tap as nexthop, stamped with the agent's route protocol id.
    pub async fn install_default_routes(&self, table_id: i32, ifindex: u32) -> Result<()> {
        self.route_default(table_id, ifindex, true, true).await?;
        self.route_default(table_id, ifindex, false, true).await
    }

    pub async fn remove_default_routes(&self, table_id: i32, ifindex: u32) -> Result<()> {
        // The kernel auto-purges routes when the link is deleted, but the
        // syncer still issues an explicit delete on a normal teardown path
        // so a "remove" against a still-live link is correct too.
        let v4 = self.route_default(table_id, ifindex, true, false).await;
        let v6 = self.route_default(table_id, ifindex, false, false).await;
        v4.and(v6)
    }

    async fn route_default(&self, table_id: i32, ifindex: u32, v4: bool, add: bool) -> Result<()> {
        let result = if v4 {
            let msg = RouteMessageBuilder::<Ipv4Addr>::new()
                .table_id(table_id as u32)
                .output_interface(ifindex)
                .protocol(crate::config::ROUTE_PROTOCOL_ID as u8)
                .build();
            if add {
                self.handle.route().add(msg).replace().execute().await
            } else {
                self.handle.route().del(msg).execute().await
            }
        } else {
            let msg = RouteMessageBuilder::<Ipv6Addr>::new()
                .table_id(table_id as u32)
                .output_interface(ifindex)
                .protocol(crate::config::ROUTE_PROTOCOL_ID as u8)
                .build();
            if add {
                self.handle.route().add(msg).replace().execute().await
            } else {
                self.handle.route().del(msg).execute().await
            }
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                let err = downgrade_not_found(e.into());
                if !add && err.is_not_found() {
                    warn!(table_id, ifindex, "default route already absent on remove");
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }

    /// `from <addr> lookup <table>`. Rule adds never use `NLM_F_REPLACE`:
    /// the kernel accumulates duplicate rules instead of merging them, so
    /// the syncer (not the kernel) is the source of truth for presence.
    pub async fn rule_add(&self, rule: RuleSpec) -> Result<()> {
        let result = match rule.addr.addr {
            IpAddr::V4(v4) => {
                self.handle
                    .rule()
                    .add()
                    .v4()
                    .source_prefix(v4, rule.addr.prefix_len)
                    .table_id(rule.table_id as u32)
                    .action(rtnetlink::packet_route::rule::RuleAction::ToTable)
                    .execute()
                    .await
            }
            IpAddr::V6(v6) => {
                self.handle
                    .rule()
                    .add()
                    .v6()
                    .source_prefix(v6, rule.addr.prefix_len)
                    .table_id(rule.table_id as u32)
                    .action(rtnetlink::packet_route::rule::RuleAction::ToTable)
                    .execute()
                    .await
            }
        };
        result.map_err(Error::from)
    }

    pub async fn rule_del(&self, rule: RuleSpec) -> Result<()> {
        let result = match rule.addr.addr {
            IpAddr::V4(v4) => {
                self.handle
                    .rule()
                    .del()
                    .v4()
                    .source_prefix(v4, rule.addr.prefix_len)
                    .table_id(rule.table_id as u32)
                    .execute()
                    .await
            }
            IpAddr::V6(v6) => {
                self.handle
                    .rule()
                    .del()
                    .v6()
                    .source_prefix(v6, rule.addr.prefix_len)
                    .table_id(rule.table_id as u32)
                    .execute()
                    .await
            }
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                let err = downgrade_not_found(e.into());
                if err.is_not_found() {
                    warn!(
                        addr = %rule.addr,
                        table_id = rule.table_id,
                        "rule already absent on remove"
                    );
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }
}

/// The netlink surface the syncer (§4.E) depends on, pulled out of the
/// inherent [`NetlinkClient`] impl so tests can substitute a fake that
/// records calls instead of touching a real `NETLINK_ROUTE` socket —
/// mirroring how the teacher crate keeps `AppState`'s `rtnetlink::Handle`
/// behind a narrow surface the D-Bus layer calls through.
pub trait NetlinkPort: Send + Sync {
    async fn disable_ipv6_addr_gen_mode(&self, ifindex: u32);
    async fn address_replace(&self, ifindex: u32, addr: PrefixAddr) -> Result<()>;
    async fn address_del(&self, ifindex: u32, addr: PrefixAddr) -> Result<()>;
    async fn install_default_routes(&self, table_id: i32, ifindex: u32) -> Result<()>;
    async fn remove_default_routes(&self, table_id: i32, ifindex: u32) -> Result<()>;
    async fn rule_add(&self, rule: RuleSpec) -> Result<()>;
    async fn rule_del(&self, rule: RuleSpec) -> Result<()>;
}

impl NetlinkPort for NetlinkClient {
    async fn disable_ipv6_addr_gen_mode(&self, ifindex: u32) {
        NetlinkClient::disable_ipv6_addr_gen_mode(self, ifindex).await
    }

    async fn address_replace(&self, ifindex: u32, addr: PrefixAddr) -> Result<()> {
        NetlinkClient::address_replace(self, ifindex, addr).await
    }

    async fn address_del(&self, ifindex: u32, addr: PrefixAddr) -> Result<()> {
        NetlinkClient::address_del(self, ifindex, addr).await
    }

    async fn install_default_routes(&self, table_id: i32, ifindex: u32) -> Result<()> {
        NetlinkClient::install_default_routes(self, table_id, ifindex).await
    }

    async fn remove_default_routes(&self, table_id: i32, ifindex: u32) -> Result<()> {
        NetlinkClient::remove_default_routes(self, table_id, ifindex).await
    }

    async fn rule_add(&self, rule: RuleSpec) -> Result<()> {
        NetlinkClient::rule_add(self, rule).await
    }

    async fn rule_del(&self, rule: RuleSpec) -> Result<()> {
        NetlinkClient::rule_del(self, rule).await
    }
}

fn downgrade_not_found(e: Error) -> Error {
    if e.is_not_found() {
        Error::NotFound(e.to_string())
    } else {
        e
    }
}

/// Parse `(gateway, oif)` out of a unicast route's attributes, used by both
/// the prober's gateway scan and the observer's route-event classifier.
pub fn route_gateway(msg: &RouteMessage) -> Option<(IpAddr, u32)> {
    use netlink_packet_route::route::RouteAddress;

    let mut gateway = None;
    let mut oif = None;
    for attr in &msg.attributes {
        match attr {
            RouteAttribute::Gateway(RouteAddress::Inet(ip)) => gateway = Some(IpAddr::V4(*ip)),
            RouteAttribute::Gateway(RouteAddress::Inet6(ip)) => gateway = Some(IpAddr::V6(*ip)),
            RouteAttribute::Oif(idx) => oif = Some(*idx),
            _ => {}
        }
    }
    gateway.zip(oif)
}
