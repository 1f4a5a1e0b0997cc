//! Per-interface tap device: a kernel virtual network device through which
//! the agent exchanges packets with the host stack.
//!
//! Link-level mutation (MTU, admin up/down) goes through socket ioctls
//! rather than netlink: some kernel versions reject the `RTM_NEWLINK`
//! message form for these attributes. Address and route/rule mutation
//! still goes through [`crate::netlink::NetlinkClient`], owned by the
//! syncer.

use std::collections::HashSet;
use std::ffi::{c_int, c_short, c_uchar};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use tracing::warn;

use crate::error::{Error, Result};
use crate::ids::{InterfaceId, PrefixAddr};

const TUN_FILE: &[u8] = b"/dev/net/tun\0";
const IFNAMSIZ: usize = 16;

// ioctl request numbers, from linux/if_tun.h and linux/sockios.h. Issued
// directly via libc, matching how the original C++ talks to the kernel.
const TUNSETIFF: u64 = 0x4004_54ca;
const TUNSETPERSIST: u64 = 0x4004_54cb;
const SIOCGIFFLAGS: u64 = 0x8913;
const SIOCSIFFLAGS: u64 = 0x8914;
const SIOCSIFMTU: u64 = 0x8922;
const SIOCGIFINDEX: u64 = 0x8933;

const IFF_TUN: c_short = 0x0001;
const IFF_NO_PI: c_short = 0x1000;
const IFF_UP: c_short = 0x1;

#[repr(C)]
union IfrIfru {
    ifru_flags: c_short,
    ifru_mtu: c_int,
    ifru_ivalue: c_int,
}

#[repr(C)]
struct Ifreq {
    ifr_name: [c_uchar; IFNAMSIZ],
    ifr_ifru: IfrIfru,
}

impl Ifreq {
    fn named(name: &str) -> Self {
        let mut ifr_name = [0u8; IFNAMSIZ];
        let bytes = name.as_bytes();
        debug_assert!(bytes.len() < IFNAMSIZ, "tap name too long: {name}");
        ifr_name[..bytes.len()].copy_from_slice(bytes);
        Ifreq {
            ifr_name,
            ifr_ifru: IfrIfru { ifru_ivalue: 0 },
        }
    }
}

fn last_os_error() -> Error {
    Error::Io(std::io::Error::last_os_error())
}

/// Short-lived `AF_INET`/`SOCK_DGRAM` socket used only as a handle for the
/// `SIOC*` family of ioctls, which require a socket fd regardless of family.
fn ioctl_socket() -> Result<OwnedFd> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn set_nonblocking_cloexec(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(last_os_error());
    }
    let fdflags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if fdflags < 0 {
        return Err(last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, fdflags | libc::FD_CLOEXEC) } < 0 {
        return Err(last_os_error());
    }
    Ok(())
}

/// One per active switch interface; exclusively owned by the
/// [`crate::syncer::InterfaceSyncer`] — no other component holds the fd.
#[derive(Debug)]
pub struct TapDevice {
    pub interface_id: InterfaceId,
    pub host_name: String,
    /// Valid iff the device has been created in the kernel.
    pub ifindex: Option<i32>,
    pub addrs: HashSet<PrefixAddr>,
    pub admin_up: bool,
    pub mtu: u32,
    pub persist: bool,
    pub to_delete: bool,
    fd: Option<OwnedFd>,
}

impl TapDevice {
    /// Open `/dev/net/tun` in L3 mode (`IFF_TUN|IFF_NO_PI`), set MTU before
    /// any packet can be read, and resolve the kernel-assigned ifindex.
    ///
    /// On any failure after the fd is opened, the fd is closed before
    /// returning (a scope guard, in spirit) so a half-created device never
    /// leaks a descriptor.
    pub fn create(interface_id: InterfaceId, mtu: u32) -> Result<Self> {
        let host_name = interface_id.tap_name();

        let raw_fd = unsafe { libc::open(TUN_FILE.as_ptr() as *const _, libc::O_RDWR) };
        if raw_fd < 0 {
            return Err(last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw_fd) };

        let result = Self::finish_create(&fd, &host_name, mtu);
        match result {
            Ok(ifindex) => Ok(Self {
                interface_id,
                host_name,
                ifindex: Some(ifindex),
                addrs: HashSet::new(),
                admin_up: false,
                mtu,
                persist: false,
                to_delete: false,
                fd: Some(fd),
            }),
            Err(e) => {
                // `fd` drops here, closing the partially-created device.
                Err(e)
            }
        }
    }

    fn finish_create(fd: &OwnedFd, host_name: &str, mtu: u32) -> Result<i32> {
        let mut ifr = Ifreq::named(host_name);
        ifr.ifr_ifru.ifru_flags = IFF_TUN | IFF_NO_PI;
        if unsafe { libc::ioctl(fd.as_raw_fd(), TUNSETIFF, &ifr) } < 0 {
            return Err(last_os_error());
        }

        set_nonblocking_cloexec(fd.as_raw_fd())?;
        Self::set_mtu_by_name(host_name, mtu)?;
        Self::ifindex_by_name(host_name)
    }

    fn ifindex_by_name(name: &str) -> Result<i32> {
        let sock = ioctl_socket()?;
        let mut ifr = Ifreq::named(name);
        if unsafe { libc::ioctl(sock.as_raw_fd(), SIOCGIFINDEX, &mut ifr) } < 0 {
            return Err(last_os_error());
        }
        Ok(unsafe { ifr.ifr_ifru.ifru_ivalue })
    }

    fn set_mtu_by_name(name: &str, mtu: u32) -> Result<()> {
        let sock = ioctl_socket()?;
        let mut ifr = Ifreq::named(name);
        ifr.ifr_ifru.ifru_mtu = mtu as c_int;
        if unsafe { libc::ioctl(sock.as_raw_fd(), SIOCSIFMTU, &ifr) } < 0 {
            return Err(last_os_error());
        }
        Ok(())
    }

    pub fn set_mtu(&mut self, mtu: u32) -> Result<()> {
        Self::set_mtu_by_name(&self.host_name, mtu)?;
        self.mtu = mtu;
        Ok(())
    }

    /// Toggle `TUNSETPERSIST`. When unset, closing the fd deletes the
    /// interface from the kernel; when set, it survives process restarts.
    pub fn set_persist(&mut self, persist: bool) -> Result<()> {
        let Some(fd) = &self.fd else {
            return Err(Error::Invalid("set_persist on closed device".into()));
        };
        let val: c_int = persist.into();
        if unsafe { libc::ioctl(fd.as_raw_fd(), TUNSETPERSIST, val) } < 0 {
            return Err(last_os_error());
        }
        self.persist = persist;
        Ok(())
    }

    pub fn set_admin_status(&mut self, up: bool) -> Result<()> {
        let sock = ioctl_socket()?;
        let mut ifr = Ifreq::named(&self.host_name);
        if unsafe { libc::ioctl(sock.as_raw_fd(), SIOCGIFFLAGS, &mut ifr) } < 0 {
            return Err(last_os_error());
        }
        unsafe {
            if up {
                ifr.ifr_ifru.ifru_flags |= IFF_UP;
            } else {
                ifr.ifr_ifru.ifru_flags &= !IFF_UP;
            }
        }
        if unsafe { libc::ioctl(sock.as_raw_fd(), SIOCSIFFLAGS, &ifr) } < 0 {
            return Err(last_os_error());
        }
        self.admin_up = up;
        Ok(())
    }

    /// Modifies only the in-memory address set; the caller (syncer) is
    /// responsible for the corresponding netlink address/rule mutation.
    pub fn add_addr(&mut self, addr: PrefixAddr) {
        self.addrs.insert(addr);
    }

    pub fn remove_addr(&mut self, addr: &PrefixAddr) {
        self.addrs.remove(addr);
    }

    pub fn set_addrs(&mut self, addrs: HashSet<PrefixAddr>) {
        self.addrs = addrs;
    }

    /// Write raw packet bytes to the tap fd. Partial writes count as a
    /// failure for that packet, not a device fault — the caller just drops
    /// and counts it.
    pub fn write(&self, pkt: &[u8]) -> bool {
        let Some(fd) = &self.fd else {
            return false;
        };
        let n = unsafe { libc::write(fd.as_raw_fd(), pkt.as_ptr() as *const _, pkt.len()) };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::WouldBlock {
                warn!(iface = %self.host_name, "tap write failed: {err}");
            }
            return false;
        }
        if n as usize != pkt.len() {
            warn!(
                iface = %self.host_name,
                wrote = n,
                len = pkt.len(),
                "partial tap write"
            );
            return false;
        }
        true
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(|f| f.as_raw_fd())
    }

    /// Close the fd. If `to_delete` was never set and persist was never
    /// enabled, the kernel removes the interface as soon as the last fd
    /// referencing it closes.
    pub fn close(&mut self) {
        self.fd = None;
        self.ifindex = None;
    }

    /// Adopt a tap this process did not create itself: a device the
    /// one-shot [`crate::netlink::prober::KernelProber`] found already
    /// living in the kernel from a prior run. No fd is held — the syncer
    /// reopening `/dev/net/tun` would steal the existing device's traffic,
    /// so admin/MTU mutations on an adopted device go through ioctl-by-name
    /// the same way they would for a freshly created one.
    ///
    /// `mtu` is set to a sentinel that can never match a real desired MTU,
    /// forcing the next sync to reconcile it explicitly rather than trust
    /// an assumption about what the kernel currently has configured.
    pub(crate) fn adopt(interface_id: InterfaceId, ifindex: i32) -> Self {
        Self {
            interface_id,
            host_name: interface_id.tap_name(),
            ifindex: Some(ifindex),
            addrs: HashSet::new(),
            admin_up: false,
            mtu: u32::MAX,
            persist: false,
            to_delete: false,
            fd: None,
        }
    }

    /// Fd-less device for tests doubling as a [`TapFactory`] without any
    /// real kernel I/O; unlike [`TapDevice::adopt`], `mtu` is the caller's
    /// actual value rather than the force-reconcile sentinel.
    #[cfg(test)]
    pub(crate) fn fake(interface_id: InterfaceId, ifindex: i32, mtu: u32) -> Self {
        let mut dev = Self::adopt(interface_id, ifindex);
        dev.mtu = mtu;
        dev
    }
}

/// Creates [`TapDevice`]s. Pulled out of the inherent `TapDevice::create`
/// constructor so the syncer can be exercised in tests without opening a
/// real `/dev/net/tun`.
pub trait TapFactory: Send + Sync {
    fn create(&self, interface_id: InterfaceId, mtu: u32) -> Result<TapDevice>;
}

pub struct RealTapFactory;

impl TapFactory for RealTapFactory {
    fn create(&self, interface_id: InterfaceId, mtu: u32) -> Result<TapDevice> {
        TapDevice::create(interface_id, mtu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr_bookkeeping_is_local_only() {
        let mut dev = TapDevice::adopt(InterfaceId(2001), 42);
        let a = PrefixAddr::new(std::net::Ipv4Addr::new(10, 0, 0, 1).into(), 31);
        dev.add_addr(a);
        assert!(dev.addrs.contains(&a));
        dev.remove_addr(&a);
        assert!(!dev.addrs.contains(&a));
    }

    #[test]
    fn write_without_fd_fails_closed() {
        let mut dev = TapDevice::adopt(InterfaceId(2001), 42);
        dev.close();
        assert!(!dev.write(&[0u8; 10]));
    }
}
