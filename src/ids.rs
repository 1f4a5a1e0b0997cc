use std::fmt;
use std::net::IpAddr;

/// Stable integer identity of a logical switch interface.
///
/// `InterfaceID` in spec terms. The host-side tap device name is derived
/// deterministically from this via [`InterfaceId::tap_name`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InterfaceId(pub i32);

/// Prefix every core-owned tap device carries; how the prober recognizes
/// which kernel links belong to this process.
pub const TAP_NAME_PREFIX: &str = "fboss";

impl InterfaceId {
    pub fn tap_name(self) -> String {
        format!("{TAP_NAME_PREFIX}{}", self.0)
    }

    /// Parse an `InterfaceId` back out of a host tap name, returning `None`
    /// if the name isn't one of ours.
    pub fn from_tap_name(name: &str) -> Option<Self> {
        name.strip_prefix(TAP_NAME_PREFIX)
            .and_then(|rest| rest.parse().ok())
            .map(InterfaceId)
    }
}

impl fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An `(IP, prefix length)` pair, as carried on an interface or installed as
/// a kernel address/source-routing rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PrefixAddr {
    pub addr: IpAddr,
    pub prefix_len: u8,
}

impl PrefixAddr {
    pub fn new(addr: IpAddr, prefix_len: u8) -> Self {
        Self { addr, prefix_len }
    }

    pub fn is_link_local(&self) -> bool {
        match self.addr {
            IpAddr::V4(v4) => v4.is_link_local(),
            IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
        }
    }
}

impl fmt::Display for PrefixAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}
