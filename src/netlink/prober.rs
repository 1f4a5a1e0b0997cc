//! One-shot kernel enumeration of existing tap interfaces and addresses
//! (§4.C). Called once at startup under the syncer's mutex; all
//! reconciliation after that is event-driven.

use std::net::IpAddr;

use futures::TryStreamExt;
use netlink_packet_route::address::AddressAttribute;
use netlink_packet_route::link::LinkAttribute;

use crate::error::Result;
use crate::ids::InterfaceId;
use crate::netlink::NetlinkClient;

#[derive(Debug, Clone)]
pub struct ProbedTap {
    pub interface_id: InterfaceId,
    pub ifindex: i32,
}

#[derive(Debug, Clone, Copy)]
pub struct ProbedAddress {
    pub ifindex: i32,
    pub addr: IpAddr,
    pub prefix_len: u8,
}

pub struct KernelProber<'a> {
    client: &'a NetlinkClient,
}

impl<'a> KernelProber<'a> {
    pub fn new(client: &'a NetlinkClient) -> Self {
        Self { client }
    }

    /// Iterate the link cache for links matching the deterministic tap-name
    /// pattern, then the address cache for v4/v6 addresses on any ifindex
    /// (callers filter down to the ones that matched a probed tap).
    pub async fn probe(&self) -> Result<(Vec<ProbedTap>, Vec<ProbedAddress>)> {
        let mut taps = Vec::new();
        let mut links = self.client.handle().link().get().execute();
        while let Some(msg) = links.try_next().await? {
            let Some(LinkAttribute::IfName(name)) = msg
                .attributes
                .iter()
                .find(|a| matches!(a, LinkAttribute::IfName(_)))
            else {
                continue;
            };
            if let Some(interface_id) = InterfaceId::from_tap_name(name) {
                taps.push(ProbedTap {
                    interface_id,
                    ifindex: msg.header.index as i32,
                });
            }
        }

        let mut addrs = Vec::new();
        let mut addr_stream = self.client.handle().address().get().execute();
        while let Some(msg) = addr_stream.try_next().await? {
            let ifindex = msg.header.index as i32;
            let prefix_len = msg.header.prefix_len;
            for attr in &msg.attributes {
                if let AddressAttribute::Address(ip) = attr {
                    addrs.push(ProbedAddress {
                        ifindex,
                        addr: *ip,
                        prefix_len,
                    });
                }
            }
        }

        Ok((taps, addrs))
    }
}

/// The one-shot probe surface the syncer's bootstrap step (§4.E step 3)
/// depends on, pulled out so tests can substitute an empty fake instead of
/// walking a real link/address cache.
pub trait TapProbe: Send + Sync {
    async fn probe(&self) -> Result<(Vec<ProbedTap>, Vec<ProbedAddress>)>;
}

impl TapProbe for crate::netlink::NetlinkClient {
    async fn probe(&self) -> Result<(Vec<ProbedTap>, Vec<ProbedAddress>)> {
        KernelProber::new(self).probe().await
    }
}
