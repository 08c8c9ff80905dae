//! CIDR matching.
//!
//! Range data arrives from the network and from disk, so nothing here raises
//! on bad input. A string that does not parse as `address/prefix` is simply a
//! range that never matches.
//!
//! Matching compares the full bytes covered by the prefix first, then masks
//! the one partial byte that remains (if any).

use std::fmt;
use std::net::IpAddr;

use crate::types::normalize_ip;

/// A parsed `network/prefix_len` block.
///
/// Only constructible through [`Cidr::new`] / [`Cidr::parse`], which enforce
/// `prefix_len <= 32` for IPv4 and `<= 128` for IPv6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cidr {
    network: IpAddr,
    prefix_len: u8,
}

impl Cidr {
    pub fn new(network: IpAddr, prefix_len: u8) -> Option<Self> {
        if prefix_len > max_prefix_len(&network) {
            return None;
        }
        Some(Self {
            network,
            prefix_len,
        })
    }

    /// Parse `"a.b.c.d/n"` or `"x:y::/n"`. Whitespace around the string is ignored.
    pub fn parse(s: &str) -> Option<Self> {
        let (addr, len) = s.trim().split_once('/')?;
        let network: IpAddr = addr.parse().ok()?;
        let prefix_len: u8 = len.parse().ok()?;
        Self::new(network, prefix_len)
    }

    pub fn network(&self) -> IpAddr {
        self.network
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn is_ipv4(&self) -> bool {
        self.network.is_ipv4()
    }

    /// True iff the top `prefix_len` bits of `addr` equal those of the network.
    ///
    /// An address of the other family never matches. IPv4-mapped IPv6
    /// addresses are compared as IPv4.
    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self.network, normalize_ip(addr)) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                prefix_eq(&net.octets(), &ip.octets(), self.prefix_len)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                prefix_eq(&net.octets(), &ip.octets(), self.prefix_len)
            }
            _ => false,
        }
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

/// Match `addr` against a textual CIDR. Malformed input returns false.
pub fn matches(addr: IpAddr, cidr: &str) -> bool {
    Cidr::parse(cidr).is_some_and(|c| c.contains(addr))
}

fn max_prefix_len(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

// Callers guarantee equal lengths and prefix_len <= 8 * len.
fn prefix_eq(network: &[u8], addr: &[u8], prefix_len: u8) -> bool {
    let full = usize::from(prefix_len / 8);
    let partial = prefix_len % 8;

    if network[..full] != addr[..full] {
        return false;
    }

    if partial > 0 {
        let mask = 0xffu8 << (8 - partial);
        if network[full] & mask != addr[full] & mask {
            return false;
        }
    }

    true
}
