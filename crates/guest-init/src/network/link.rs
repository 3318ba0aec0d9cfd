//! Link enumeration and activation through the kernel.

use std::io;
use std::os::fd::AsRawFd;

use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;
use nix::sys::socket::{AddressFamily, SockFlag, SockType, socket};

use super::error::{NetworkError, Result};

/// A network link and the capability flags that matter for selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub name: String,
    pub loopback: bool,
    pub broadcast: bool,
    pub multicast: bool,
}

impl Link {
    /// Whether this link can carry DHCP: not loopback, broadcast and
    /// multicast capable.
    pub fn is_primary_candidate(&self) -> bool {
        !self.loopback && self.broadcast && self.multicast
    }
}

/// Link enumeration and activation.
pub trait LinkControl: Send + Sync {
    /// All links, in kernel index order.
    fn links(&self) -> Result<Vec<Link>>;

    /// Set a link administratively up.
    fn set_up(&self, name: &str) -> Result<()>;
}

/// [`LinkControl`] backed by `getifaddrs(3)` and interface ioctls.
#[derive(Debug, Default, Clone, Copy)]
pub struct KernelLinks;

impl LinkControl for KernelLinks {
    fn links(&self) -> Result<Vec<Link>> {
        let mut links: Vec<Link> = Vec::new();
        // One entry per address family per link; keep the first.
        for ifa in getifaddrs().map_err(NetworkError::ListLinks)? {
            if links.iter().any(|l| l.name == ifa.interface_name) {
                continue;
            }
            links.push(Link {
                loopback: ifa.flags.contains(InterfaceFlags::IFF_LOOPBACK),
                broadcast: ifa.flags.contains(InterfaceFlags::IFF_BROADCAST),
                multicast: ifa.flags.contains(InterfaceFlags::IFF_MULTICAST),
                name: ifa.interface_name,
            });
        }
        Ok(links)
    }

    fn set_up(&self, name: &str) -> Result<()> {
        set_link_up(name).map_err(|source| NetworkError::LinkUp {
            link: name.to_string(),
            source,
        })
    }
}

fn ifreq_for(name: &str) -> io::Result<libc::ifreq> {
    if name.is_empty() || name.len() >= libc::IFNAMSIZ {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid interface name {name:?}"),
        ));
    }
    // SAFETY: ifreq is plain old data; all-zero is a valid value.
    let mut req: libc::ifreq = unsafe { std::mem::zeroed() };
    for (dst, src) in req.ifr_name.iter_mut().zip(name.bytes()) {
        *dst = src as libc::c_char;
    }
    Ok(req)
}

fn set_link_up(name: &str) -> io::Result<()> {
    let mut req = ifreq_for(name)?;
    let sock = socket(
        AddressFamily::Inet,
        SockType::Datagram,
        SockFlag::SOCK_CLOEXEC,
        None,
    )
    .map_err(io::Error::from)?;

    // SAFETY: sock is a valid descriptor and req outlives the call.
    if unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCGIFFLAGS as _, &mut req) } < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: SIOCGIFFLAGS filled the flags member of the union.
    let flags = unsafe { req.ifr_ifru.ifru_flags };
    if flags & libc::IFF_UP as libc::c_short != 0 {
        return Ok(());
    }
    req.ifr_ifru.ifru_flags = flags | libc::IFF_UP as libc::c_short;
    // SAFETY: as above.
    if unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCSIFFLAGS as _, &req) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
