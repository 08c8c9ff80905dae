//! regionscope integration test harness.
//!
//! Scenarios run the real registry, classifier, flow table, tracker and
//! discovery pass against injected fakes: a scripted range feed, a
//! controllable clock, an in-memory socket table and hand-built frames.
//! No root, network or game process is needed.
//!
//!   cargo test --test integration

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use regionscope_core::{Protocol, SocketRecord, TcpState};
use regionscope_services::ip_ranges::{
    Clock, FetchFuture, RangeFetcher, RegistryError, RegistrySettings,
};
use regionscope_services::{IpRangeRegistry, SocketSource, SourceError};

mod discovery;
mod registry;

// ── Feed ──────────────────────────────────────────────────────────────────────

pub const FEED: &str = r#"{
    "syncToken": "1700000000",
    "createDate": "2024-01-01-00-00-00",
    "prefixes": [
        {"ip_prefix": "198.51.100.0/24", "region": "eu-test-1", "service": "AMAZON", "network_border_group": "eu-test-1"},
        {"ip_prefix": "198.51.100.0/24", "region": "eu-test-1", "service": "GAMELIFT", "network_border_group": "eu-test-1"},
        {"ip_prefix": "203.0.113.0/24", "region": "eu-west-1", "service": "GAMELIFT", "network_border_group": "eu-west-1"}
    ],
    "ipv6_prefixes": [
        {"ipv6_prefix": "2001:db8:100::/48", "region": "eu-west-1", "service": "GAMELIFT", "network_border_group": "eu-west-1"}
    ]
}"#;

/// Range feed that counts calls and can be switched between success and failure.
#[derive(Clone)]
pub struct ScriptedFeed {
    pub calls: Arc<AtomicUsize>,
    body: Arc<Mutex<Option<&'static str>>>,
}

impl ScriptedFeed {
    pub fn ok(body: &'static str) -> Self {
        Self {
            calls: Arc::default(),
            body: Arc::new(Mutex::new(Some(body))),
        }
    }

    pub fn failing() -> Self {
        Self {
            calls: Arc::default(),
            body: Arc::new(Mutex::new(None)),
        }
    }

    pub fn set(&self, body: Option<&'static str>) {
        *self.body.lock().unwrap() = body;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RangeFetcher for ScriptedFeed {
    fn fetch(&self) -> FetchFuture<'_> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let body = *self.body.lock().unwrap();
        Box::pin(async move {
            body.map(str::to_string)
                .ok_or_else(|| RegistryError::Transport("connection refused".into()))
        })
    }
}

// ── Clock ─────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct TestClock(Arc<Mutex<SystemTime>>);

impl TestClock {
    pub fn at(t: SystemTime) -> Self {
        Self(Arc::new(Mutex::new(t)))
    }

    pub fn advance(&self, d: Duration) {
        *self.0.lock().unwrap() += d;
    }
}

impl Clock for TestClock {
    fn now(&self) -> SystemTime {
        *self.0.lock().unwrap()
    }
}

// ── Registry helpers ──────────────────────────────────────────────────────────

pub fn settings(cache_path: Option<PathBuf>) -> RegistrySettings {
    RegistrySettings {
        cache_path,
        ttl: Duration::from_secs(24 * 3600),
        fallback_retry: Duration::from_secs(300),
    }
}

pub fn registry(feed: ScriptedFeed, clock: TestClock, cache_path: Option<PathBuf>) -> Arc<IpRangeRegistry> {
    Arc::new(IpRangeRegistry::new(feed, clock, settings(cache_path)))
}

/// Fresh per-test directory under the system temp dir.
pub fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("regionscope-it-{}-{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

// ── Socket table ──────────────────────────────────────────────────────────────

pub const GAME_PID: u32 = 4242;

/// In-memory socket table standing in for procfs.
#[derive(Clone, Default)]
pub struct SocketTable(Arc<Mutex<Vec<SocketRecord>>>);

impl SocketTable {
    pub fn set(&self, records: Vec<SocketRecord>) {
        *self.0.lock().unwrap() = records;
    }

    fn by_protocol(&self, protocol: Protocol) -> Vec<SocketRecord> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.protocol == protocol)
            .cloned()
            .collect()
    }
}

impl SocketSource for SocketTable {
    fn name(&self) -> &'static str {
        "table"
    }

    fn tcp(&self) -> Result<Vec<SocketRecord>, SourceError> {
        Ok(self.by_protocol(Protocol::Tcp))
    }

    fn udp(&self) -> Result<Vec<SocketRecord>, SourceError> {
        Ok(self.by_protocol(Protocol::Udp))
    }
}

/// A source that always fails, to exercise the fallback path.
pub struct BrokenSource;

impl SocketSource for BrokenSource {
    fn name(&self) -> &'static str {
        "broken"
    }

    fn tcp(&self) -> Result<Vec<SocketRecord>, SourceError> {
        Err(SourceError::Io(std::io::Error::other("table unavailable")))
    }

    fn udp(&self) -> Result<Vec<SocketRecord>, SourceError> {
        Err(SourceError::Io(std::io::Error::other("table unavailable")))
    }
}

pub fn tcp_established(local_port: u16, remote: &str) -> SocketRecord {
    SocketRecord {
        protocol: Protocol::Tcp,
        local: format!("192.168.1.10:{local_port}").parse().unwrap(),
        remote: Some(remote.parse().unwrap()),
        pid: Some(GAME_PID),
        tcp_state: Some(TcpState::Established),
    }
}

pub fn udp_bound(port: u16) -> SocketRecord {
    SocketRecord {
        protocol: Protocol::Udp,
        local: format!("0.0.0.0:{port}").parse().unwrap(),
        remote: None,
        pid: Some(GAME_PID),
        tcp_state: None,
    }
}

// ── Frames ────────────────────────────────────────────────────────────────────

/// Ethernet + IPv4 + UDP frame with a zeroed payload of `payload` bytes.
pub fn udp_frame(src: [u8; 4], sport: u16, dst: [u8; 4], dport: u16, payload: usize) -> Vec<u8> {
    let total = 20 + 8 + payload;
    let mut f = Vec::with_capacity(14 + total);
    f.extend_from_slice(&[0x02, 0, 0, 0, 0, 1]);
    f.extend_from_slice(&[0x02, 0, 0, 0, 0, 2]);
    f.extend_from_slice(&0x0800u16.to_be_bytes());
    f.extend_from_slice(&[0x45, 0]);
    f.extend_from_slice(&(total as u16).to_be_bytes());
    f.extend_from_slice(&[0, 0, 0x40, 0, 64, 17, 0, 0]);
    f.extend_from_slice(&src);
    f.extend_from_slice(&dst);
    f.extend_from_slice(&sport.to_be_bytes());
    f.extend_from_slice(&dport.to_be_bytes());
    f.extend_from_slice(&((8 + payload) as u16).to_be_bytes());
    f.extend_from_slice(&[0, 0]);
    f.resize(14 + total, 0);
    f
}
