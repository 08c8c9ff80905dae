//! Shared data model: socket records, flow keys and stats, classified targets.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

// ── Timing constants ─────────────────────────────────────────────────────────

/// A flow whose last packet is older than this is ignored.
pub const LIVENESS_WINDOW: Duration = Duration::from_secs(10);

/// Discovery tick cadence. Allowed range is 2-5s.
pub const DISCOVERY_INTERVAL: Duration = Duration::from_secs(2);

/// Latency probe cadence.
pub const PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// Per-probe timeout.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Cadence of the all-regions latency sweep.
pub const REGION_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Port used by the lobby's TLS session traffic.
pub const SECURE_PORT: u16 = 443;

// ── Sockets ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

/// Kernel TCP states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TcpState {
    Established,
    SynSent,
    SynRecv,
    FinWait1,
    FinWait2,
    TimeWait,
    Close,
    CloseWait,
    LastAck,
    Listen,
    Closing,
    NewSynRecv,
}

impl TcpState {
    /// Parse the state column of `ss` output (`ESTAB`, `SYN-SENT`, ...).
    pub fn from_ss(s: &str) -> Option<Self> {
        Some(match s {
            "ESTAB" => TcpState::Established,
            "SYN-SENT" => TcpState::SynSent,
            "SYN-RECV" => TcpState::SynRecv,
            "FIN-WAIT-1" => TcpState::FinWait1,
            "FIN-WAIT-2" => TcpState::FinWait2,
            "TIME-WAIT" => TcpState::TimeWait,
            "UNCONN" | "CLOSE" => TcpState::Close,
            "CLOSE-WAIT" => TcpState::CloseWait,
            "LAST-ACK" => TcpState::LastAck,
            "LISTEN" => TcpState::Listen,
            "CLOSING" => TcpState::Closing,
            _ => return None,
        })
    }
}

/// One socket owned (or possibly owned) by the target process.
///
/// Built fresh on every enumeration and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SocketRecord {
    pub protocol: Protocol,
    pub local: SocketAddr,
    /// `None` for unconnected UDP sockets.
    pub remote: Option<SocketAddr>,
    /// `None` when the owning process could not be determined.
    pub pid: Option<u32>,
    pub tcp_state: Option<TcpState>,
}

impl SocketRecord {
    /// The remote peer, if the socket has a real one.
    ///
    /// The kernel reports unconnected sockets with a wildcard remote
    /// (`0.0.0.0:0` / `[::]:0`); those count as having no peer.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.remote
            .filter(|r| !r.ip().is_unspecified() && r.port() != 0)
    }

    pub fn is_established(&self) -> bool {
        self.tcp_state == Some(TcpState::Established)
    }
}

// ── Flows ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FlowKey {
    pub remote: IpAddr,
    pub remote_port: u16,
    pub local_port: u16,
}

impl FlowKey {
    pub fn new(remote: IpAddr, remote_port: u16, local_port: u16) -> Self {
        Self {
            remote: normalize_ip(remote),
            remote_port,
            local_port,
        }
    }

    pub fn remote_endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.remote, self.remote_port)
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (local :{})", self.remote_endpoint(), self.local_port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Local port is the source.
    Outgoing,
    /// Local port is the destination.
    Incoming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowStats {
    pub first_seen: Instant,
    pub last_seen: Instant,
    pub packets: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

impl FlowStats {
    pub fn new(now: Instant) -> Self {
        Self {
            first_seen: now,
            last_seen: now,
            packets: 0,
            bytes_received: 0,
            bytes_sent: 0,
        }
    }

    pub fn record(&mut self, direction: Direction, payload_len: usize, now: Instant) {
        let len = payload_len as u64;
        match direction {
            Direction::Outgoing => self.bytes_sent = self.bytes_sent.saturating_add(len),
            Direction::Incoming => self.bytes_received = self.bytes_received.saturating_add(len),
        }
        self.packets = self.packets.saturating_add(1);
        if now > self.last_seen {
            self.last_seen = now;
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes_received.saturating_add(self.bytes_sent)
    }

    /// `now - last_seen <= window`. A `last_seen` in the future counts as live.
    pub fn is_live(&self, now: Instant, window: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) <= window
    }
}

/// A flow copied out of the flow table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowSnapshot {
    pub key: FlowKey,
    pub stats: FlowStats,
}

// ── Classification ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Lobby,
    Game,
}

impl Role {
    pub const ALL: [Role; 2] = [Role::Lobby, Role::Game];
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Lobby => f.write_str("lobby"),
            Role::Game => f.write_str("game"),
        }
    }
}

/// A remote endpoint with everything the classifier could learn about it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassifiedTarget {
    pub role: Role,
    pub endpoint: SocketAddr,
    pub region: Option<String>,
    pub service: Option<String>,
    pub provider: Option<String>,
    /// Human-readable summary, e.g. `"AWS GAMELIFT Europe (Ireland)"`.
    pub descriptor: String,
    pub is_cloud: bool,
    pub is_session_service: bool,
}

// ── Address helpers ──────────────────────────────────────────────────────────

/// Collapse IPv4-mapped IPv6 (`::ffff:a.b.c.d`) to plain IPv4.
pub fn normalize_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

/// Addresses that can never be a game or lobby server: loopback, private,
/// link-local, unspecified, broadcast and multicast.
pub fn is_non_routable(ip: IpAddr) -> bool {
    match normalize_ip(ip) {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_multicast()
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_multicast()
                || (first & 0xfe00) == 0xfc00 // unique local fc00::/7
                || (first & 0xffc0) == 0xfe80 // link-local fe80::/10
        }
    }
}
