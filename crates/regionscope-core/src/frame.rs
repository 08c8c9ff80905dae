//! Captured-frame and ICMP layouts.
//!
//! All headers are `#[repr(C, packed)]` with byte-array fields so they can be
//! read straight out of a capture buffer with zerocopy, regardless of
//! alignment. Multi-byte fields are network byte order; use the accessor
//! methods rather than the raw arrays.
//!
//! Nothing here panics on short or garbled input. A frame that does not parse
//! is simply not a UDP datagram.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_IPV6: u16 = 0x86DD;
pub const ETHERTYPE_VLAN: u16 = 0x8100;

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_ICMPV6: u8 = 58;

pub const ICMPV4_ECHO_REPLY: u8 = 0;
pub const ICMPV4_ECHO_REQUEST: u8 = 8;
pub const ICMPV6_ECHO_REQUEST: u8 = 128;
pub const ICMPV6_ECHO_REPLY: u8 = 129;

// ── Link layer ───────────────────────────────────────────────────────────────

/// Wire size: 14 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct EthernetHeader {
    pub dst: [u8; 6],
    pub src: [u8; 6],
    pub ether_type: [u8; 2],
}

assert_eq_size!(EthernetHeader, [u8; 14]);

impl EthernetHeader {
    pub fn ether_type(&self) -> u16 {
        u16::from_be_bytes(self.ether_type)
    }
}

/// 802.1Q tag that follows the source MAC. Wire size: 4 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct VlanTag {
    pub tci: [u8; 2],
    pub ether_type: [u8; 2],
}

assert_eq_size!(VlanTag, [u8; 4]);

// ── Network layer ────────────────────────────────────────────────────────────

/// Fixed part of the IPv4 header. Options follow when IHL > 5.
/// Wire size: 20 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct Ipv4Header {
    pub version_ihl: u8,
    pub dscp_ecn: u8,
    pub total_len: [u8; 2],
    pub ident: [u8; 2],
    /// 3 flag bits, 13 fragment-offset bits.
    pub flags_fragment: [u8; 2],
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: [u8; 2],
    pub src: [u8; 4],
    pub dst: [u8; 4],
}

assert_eq_size!(Ipv4Header, [u8; 20]);

impl Ipv4Header {
    pub fn version(&self) -> u8 {
        self.version_ihl >> 4
    }

    /// Header length in bytes.
    pub fn header_len(&self) -> usize {
        usize::from(self.version_ihl & 0x0f) * 4
    }

    pub fn total_len(&self) -> usize {
        usize::from(u16::from_be_bytes(self.total_len))
    }

    pub fn fragment_offset(&self) -> u16 {
        u16::from_be_bytes(self.flags_fragment) & 0x1fff
    }
}

/// Wire size: 40 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct Ipv6Header {
    pub version_class_flow: [u8; 4],
    pub payload_len: [u8; 2],
    pub next_header: u8,
    pub hop_limit: u8,
    pub src: [u8; 16],
    pub dst: [u8; 16],
}

assert_eq_size!(Ipv6Header, [u8; 40]);

impl Ipv6Header {
    pub fn version(&self) -> u8 {
        self.version_class_flow[0] >> 4
    }

    pub fn payload_len(&self) -> usize {
        usize::from(u16::from_be_bytes(self.payload_len))
    }
}

// ── Transport layer ──────────────────────────────────────────────────────────

/// Wire size: 8 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct UdpHeader {
    pub src_port: [u8; 2],
    pub dst_port: [u8; 2],
    /// Header plus payload.
    pub length: [u8; 2],
    pub checksum: [u8; 2],
}

assert_eq_size!(UdpHeader, [u8; 8]);

/// ICMP / ICMPv6 echo request and reply. Wire size: 8 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct IcmpEchoHeader {
    pub icmp_type: u8,
    pub code: u8,
    pub checksum: [u8; 2],
    pub identifier: [u8; 2],
    pub sequence: [u8; 2],
}

assert_eq_size!(IcmpEchoHeader, [u8; 8]);

// ── Frame parsing ────────────────────────────────────────────────────────────

/// What the capture device hands us at offset 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Ethernet,
    /// No link header; the frame starts with the IP header (tun devices).
    RawIp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpDatagram {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub payload_len: usize,
}

/// IP protocol number of the frame's network payload, if it is IP at all.
///
/// Cheap enough to run on every frame before full parsing.
pub fn ip_protocol(frame: &[u8], link: LinkKind) -> Option<u8> {
    let packet = strip_link(frame, link)?;
    match *packet.first()? >> 4 {
        4 => Ipv4Header::read_from_prefix(packet).map(|h| h.protocol),
        6 => Ipv6Header::read_from_prefix(packet).map(|h| h.next_header),
        _ => None,
    }
}

/// Parse a captured frame down to its UDP header.
///
/// Returns `None` for anything that is not UDP over IPv4 or IPv6, and for
/// IPv4 fragments past the first (they carry no UDP header). IPv6 extension
/// headers are not walked.
pub fn parse_udp(frame: &[u8], link: LinkKind) -> Option<UdpDatagram> {
    let packet = strip_link(frame, link)?;
    let (src, dst, segment) = match *packet.first()? >> 4 {
        4 => parse_ipv4(packet)?,
        6 => parse_ipv6(packet)?,
        _ => return None,
    };

    let udp = UdpHeader::read_from_prefix(segment)?;
    let udp_len = usize::from(u16::from_be_bytes(udp.length));
    if udp_len < 8 {
        return None;
    }
    let available = segment.len() - 8;
    let payload_len = (udp_len - 8).min(available);

    Some(UdpDatagram {
        src: SocketAddr::new(src, u16::from_be_bytes(udp.src_port)),
        dst: SocketAddr::new(dst, u16::from_be_bytes(udp.dst_port)),
        payload_len,
    })
}

fn strip_link(frame: &[u8], link: LinkKind) -> Option<&[u8]> {
    match link {
        LinkKind::RawIp => Some(frame),
        LinkKind::Ethernet => {
            let eth = EthernetHeader::read_from_prefix(frame)?;
            let mut offset = 14;
            let mut ether_type = eth.ether_type();
            if ether_type == ETHERTYPE_VLAN {
                let tag = VlanTag::read_from_prefix(frame.get(offset..)?)?;
                ether_type = u16::from_be_bytes(tag.ether_type);
                offset += 4;
            }
            match ether_type {
                ETHERTYPE_IPV4 | ETHERTYPE_IPV6 => frame.get(offset..),
                _ => None,
            }
        }
    }
}

fn parse_ipv4(packet: &[u8]) -> Option<(IpAddr, IpAddr, &[u8])> {
    let ip = Ipv4Header::read_from_prefix(packet)?;
    let header_len = ip.header_len();
    if ip.version() != 4 || header_len < 20 || packet.len() < header_len {
        return None;
    }
    if ip.protocol != IPPROTO_UDP || ip.fragment_offset() != 0 {
        return None;
    }
    // Trailing Ethernet padding sits past total_len.
    let end = ip.total_len().clamp(header_len, packet.len());
    Some((
        IpAddr::V4(Ipv4Addr::from(ip.src)),
        IpAddr::V4(Ipv4Addr::from(ip.dst)),
        &packet[header_len..end],
    ))
}

fn parse_ipv6(packet: &[u8]) -> Option<(IpAddr, IpAddr, &[u8])> {
    let ip = Ipv6Header::read_from_prefix(packet)?;
    if ip.version() != 6 || ip.next_header != IPPROTO_UDP {
        return None;
    }
    let end = (40 + ip.payload_len()).min(packet.len());
    Some((
        IpAddr::V6(Ipv6Addr::from(ip.src)),
        IpAddr::V6(Ipv6Addr::from(ip.dst)),
        &packet[40..end],
    ))
}

// ── ICMP echo ────────────────────────────────────────────────────────────────

/// RFC 1071 internet checksum.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u32::from(u16::from_be_bytes([pair[0], pair[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Build an echo request. For ICMPv6 the kernel fills in the checksum
/// (it covers a pseudo-header we do not have), so it is left zero.
pub fn echo_request(ipv6: bool, identifier: u16, sequence: u16, payload: &[u8]) -> Vec<u8> {
    let header = IcmpEchoHeader {
        icmp_type: if ipv6 { ICMPV6_ECHO_REQUEST } else { ICMPV4_ECHO_REQUEST },
        code: 0,
        checksum: [0; 2],
        identifier: identifier.to_be_bytes(),
        sequence: sequence.to_be_bytes(),
    };
    let mut packet = Vec::with_capacity(8 + payload.len());
    packet.extend_from_slice(header.as_bytes());
    packet.extend_from_slice(payload);
    if !ipv6 {
        let sum = checksum(&packet);
        packet[2..4].copy_from_slice(&sum.to_be_bytes());
    }
    packet
}

/// Parse an echo reply, returning `(identifier, sequence)`.
///
/// Raw IPv4 sockets deliver the IP header in front of the ICMP message;
/// datagram sockets do not. Both are accepted.
pub fn parse_echo_reply(buf: &[u8], ipv6: bool) -> Option<(u16, u16)> {
    let icmp = if !ipv6 && *buf.first()? >> 4 == 4 {
        let ip = Ipv4Header::read_from_prefix(buf)?;
        if ip.protocol != IPPROTO_ICMP {
            return None;
        }
        buf.get(ip.header_len()..)?
    } else {
        buf
    };

    let header = IcmpEchoHeader::read_from_prefix(icmp)?;
    let expected = if ipv6 { ICMPV6_ECHO_REPLY } else { ICMPV4_ECHO_REPLY };
    if header.icmp_type != expected || header.code != 0 {
        return None;
    }
    Some((
        u16::from_be_bytes(header.identifier),
        u16::from_be_bytes(header.sequence),
    ))
}
