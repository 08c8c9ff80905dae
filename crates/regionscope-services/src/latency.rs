//! Latency probing of pinned targets.
//!
//! One prober task per role. Each tick it reads the current pin from a
//! `watch` channel, resolves the probe host, sends a single ICMP echo and
//! records the round trip on the [`LatencyBoard`]. The board is keyed by
//! role and tagged with the pin generation, so a sample that was in flight
//! when the pin moved is dropped instead of being shown against the new
//! target.
//!
//! Failures never overwrite a good reading: a timeout after a 42ms sample
//! leaves 42ms on the board.
//!
//! [`RegionSweep`] reuses the same pinger and board to ping every known
//! region's probe host on its own timer, whether or not anything is pinned.

use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::pin::Pin;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tokio::time::{self, MissedTickBehavior};

use regionscope_core::config::ProbeConfig;
use regionscope_core::regions::{self, KnownRegion, KNOWN_REGIONS};
use regionscope_core::{frame, ClassifiedTarget, Role};

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("cannot open ICMP socket (datagram: {dgram}; raw: {raw})")]
    Socket { dgram: io::Error, raw: io::Error },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("cannot resolve {0}")]
    Resolve(String),
    #[error("probe worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

// ── Severity ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Good,
    Marginal,
    Poor,
    VeryPoor,
}

/// Exclusive upper bounds of the good / marginal / poor buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub good: Duration,
    pub marginal: Duration,
    pub poor: Duration,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            good: Duration::from_millis(80),
            marginal: Duration::from_millis(130),
            poor: Duration::from_millis(250),
        }
    }
}

impl From<&ProbeConfig> for Thresholds {
    fn from(config: &ProbeConfig) -> Self {
        Self {
            good: Duration::from_millis(config.good_ms),
            marginal: Duration::from_millis(config.marginal_ms),
            poor: Duration::from_millis(config.poor_ms),
        }
    }
}

impl Thresholds {
    pub fn classify(&self, rtt: Duration) -> Severity {
        if rtt < self.good {
            Severity::Good
        } else if rtt < self.marginal {
            Severity::Marginal
        } else if rtt < self.poor {
            Severity::Poor
        } else {
            Severity::VeryPoor
        }
    }
}

// ── Latency board ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatencyReading {
    /// Nothing pinned.
    Idle,
    /// Pinned, no successful sample yet.
    Measuring,
    /// Last sweep got no reply. Only the region sweep reports this.
    Unreachable,
    Measured {
        rtt: Duration,
        severity: Severity,
        at: Instant,
    },
}

impl LatencyReading {
    pub fn rtt(&self) -> Option<Duration> {
        match self {
            LatencyReading::Measured { rtt, .. } => Some(*rtt),
            _ => None,
        }
    }

    pub fn status(&self) -> LatencyStatus {
        match *self {
            LatencyReading::Idle => LatencyStatus {
                state: "idle",
                rtt_ms: None,
                severity: None,
            },
            LatencyReading::Measuring => LatencyStatus {
                state: "measuring",
                rtt_ms: None,
                severity: None,
            },
            LatencyReading::Unreachable => LatencyStatus {
                state: "unreachable",
                rtt_ms: None,
                severity: None,
            },
            LatencyReading::Measured { rtt, severity, .. } => LatencyStatus {
                state: "measured",
                rtt_ms: Some(rtt.as_micros() as f64 / 1000.0),
                severity: Some(severity),
            },
        }
    }
}

/// Serializable view of a reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencyStatus {
    pub state: &'static str,
    pub rtt_ms: Option<f64>,
    pub severity: Option<Severity>,
}

#[derive(Debug, Clone, Copy)]
struct BoardEntry {
    generation: u64,
    reading: LatencyReading,
}

/// Latest reading per key. Pinned targets are keyed by [`Role`]; the region
/// sweep keys by region code.
#[derive(Clone)]
pub struct LatencyBoard<K = Role> {
    entries: Arc<DashMap<K, BoardEntry>>,
    thresholds: Thresholds,
}

impl<K: Eq + Hash> Default for LatencyBoard<K> {
    fn default() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            thresholds: Thresholds::default(),
        }
    }
}

impl<K: Eq + Hash + Copy + fmt::Display> LatencyBoard<K> {
    pub fn new(thresholds: Thresholds) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            thresholds,
        }
    }

    /// A new pin: forget the old reading and accept only `generation`.
    pub fn reset(&self, key: K, generation: u64) {
        self.entries.insert(
            key,
            BoardEntry {
                generation,
                reading: LatencyReading::Measuring,
            },
        );
    }

    pub fn clear(&self, key: K) {
        self.entries.remove(&key);
    }

    /// Apply one probe outcome. Returns false if the sample was discarded
    /// (wrong generation or failure).
    pub fn record(&self, key: K, generation: u64, outcome: Result<Duration, ProbeError>) -> bool {
        let Some(mut entry) = self.entries.get_mut(&key) else {
            return false;
        };
        if entry.generation != generation {
            tracing::trace!(%key, generation, current = entry.generation, "discarding sample for old pin");
            return false;
        }
        match outcome {
            Ok(rtt) => {
                entry.reading = LatencyReading::Measured {
                    rtt,
                    severity: self.thresholds.classify(rtt),
                    at: Instant::now(),
                };
                true
            }
            Err(e) => {
                tracing::debug!(%key, error = %e, "probe failed, keeping previous reading");
                false
            }
        }
    }

    /// Replace the reading with [`LatencyReading::Unreachable`].
    pub fn mark_unreachable(&self, key: K, generation: u64) -> bool {
        match self.entries.get_mut(&key) {
            Some(mut entry) if entry.generation == generation => {
                entry.reading = LatencyReading::Unreachable;
                true
            }
            _ => false,
        }
    }

    pub fn reading(&self, key: K) -> LatencyReading {
        self.entries
            .get(&key)
            .map(|e| e.reading)
            .unwrap_or(LatencyReading::Idle)
    }

    /// The reading, only if it belongs to `generation`.
    pub fn reading_for(&self, key: K, generation: u64) -> Option<LatencyReading> {
        self.entries
            .get(&key)
            .filter(|e| e.generation == generation)
            .map(|e| e.reading)
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }
}

// ── Probe host ───────────────────────────────────────────────────────────────

/// What the prober aims at: the region's documented ping host, or the raw
/// address when there is none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ProbeHost {
    Name(String),
    Address(IpAddr),
}

impl ProbeHost {
    pub fn for_target(target: &ClassifiedTarget, use_ping_hosts: bool) -> Self {
        let ping_host = target
            .region
            .as_deref()
            .filter(|_| use_ping_hosts && target.is_cloud)
            .and_then(regions::ping_host);
        match ping_host {
            Some(host) => ProbeHost::Name(host.to_string()),
            None => ProbeHost::Address(target.endpoint.ip()),
        }
    }

    /// Resolve to an address. A lookup failure falls back to `fallback`
    /// for this sample only.
    pub async fn resolve(&self, fallback: IpAddr) -> IpAddr {
        self.lookup(fallback.is_ipv4()).await.unwrap_or(fallback)
    }

    /// Resolve a name, preferring the given address family.
    pub async fn lookup(&self, prefer_v4: bool) -> Option<IpAddr> {
        let name = match self {
            ProbeHost::Address(ip) => return Some(*ip),
            ProbeHost::Name(name) => name,
        };
        match tokio::net::lookup_host((name.as_str(), 0)).await {
            Ok(addrs) => {
                let addrs: Vec<SocketAddr> = addrs.collect();
                addrs
                    .iter()
                    .find(|a| a.is_ipv4() == prefer_v4)
                    .or_else(|| addrs.first())
                    .map(|a| a.ip())
            }
            Err(e) => {
                tracing::debug!(host = %name, error = %e, "probe host lookup failed");
                None
            }
        }
    }
}

impl fmt::Display for ProbeHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeHost::Name(name) => f.write_str(name),
            ProbeHost::Address(ip) => write!(f, "{ip}"),
        }
    }
}

/// The pin as seen by the prober.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub generation: u64,
    pub host: ProbeHost,
    /// Raw endpoint address; used when the host does not resolve.
    pub address: IpAddr,
}

// ── Pinger ───────────────────────────────────────────────────────────────────

pub type PingFuture<'a> = Pin<Box<dyn Future<Output = Result<Duration, ProbeError>> + Send + 'a>>;

pub trait Pinger: Send + Sync {
    fn ping(&self, addr: IpAddr, timeout: Duration) -> PingFuture<'_>;
}

/// ICMP echo over an unprivileged datagram socket, or a raw socket when
/// the kernel refuses datagram ICMP (`net.ipv4.ping_group_range`).
pub struct IcmpPinger {
    identifier: u16,
    sequence: AtomicU16,
}

impl Default for IcmpPinger {
    fn default() -> Self {
        Self::new()
    }
}

impl IcmpPinger {
    pub fn new() -> Self {
        Self {
            identifier: (std::process::id() & 0xffff) as u16,
            sequence: AtomicU16::new(0),
        }
    }
}

impl Pinger for IcmpPinger {
    fn ping(&self, addr: IpAddr, timeout: Duration) -> PingFuture<'_> {
        let identifier = self.identifier;
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        Box::pin(async move {
            tokio::task::spawn_blocking(move || echo(addr, identifier, sequence, timeout)).await?
        })
    }
}

const ECHO_PAYLOAD: &[u8] = b"regionscope-probe";

fn open_icmp(ipv6: bool) -> Result<(UdpSocket, bool), ProbeError> {
    let (domain, protocol) = if ipv6 {
        (Domain::IPV6, Protocol::ICMPV6)
    } else {
        (Domain::IPV4, Protocol::ICMPV4)
    };
    match Socket::new(domain, Type::DGRAM, Some(protocol)) {
        Ok(socket) => Ok((socket.into(), false)),
        Err(dgram) => match Socket::new(domain, Type::RAW, Some(protocol)) {
            Ok(socket) => Ok((socket.into(), true)),
            Err(raw) => Err(ProbeError::Socket { dgram, raw }),
        },
    }
}

/// Blocking single echo. Runs on the blocking pool.
fn echo(addr: IpAddr, identifier: u16, sequence: u16, timeout: Duration) -> Result<Duration, ProbeError> {
    let ipv6 = addr.is_ipv6();
    let (socket, raw) = open_icmp(ipv6)?;
    socket.connect(SocketAddr::new(addr, 0))?;

    let request = frame::echo_request(ipv6, identifier, sequence, ECHO_PAYLOAD);
    let started = Instant::now();
    let deadline = started + timeout;
    socket.send(&request)?;

    let mut buf = [0u8; 1500];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ProbeError::Timeout(timeout));
        }
        socket.set_read_timeout(Some(remaining))?;
        let n = match socket.recv(&mut buf) {
            Ok(n) => n,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                return Err(ProbeError::Timeout(timeout));
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        // Datagram sockets rewrite the identifier; raw sockets see every
        // echo reply on the host and must check it.
        match frame::parse_echo_reply(&buf[..n], ipv6) {
            Some((id, seq)) if seq == sequence && (!raw || id == identifier) => {
                return Ok(started.elapsed());
            }
            _ => continue,
        }
    }
}

// ── Prober ───────────────────────────────────────────────────────────────────

pub struct Prober {
    pinger: Arc<dyn Pinger>,
    board: LatencyBoard,
    interval: Duration,
    timeout: Duration,
}

impl Prober {
    pub fn new(pinger: Arc<dyn Pinger>, board: LatencyBoard, interval: Duration, timeout: Duration) -> Self {
        Self {
            pinger,
            board,
            interval,
            timeout,
        }
    }

    /// Probe `role`'s pin until shutdown or until the pin sender is dropped.
    pub async fn run(
        self,
        role: Role,
        mut targets: watch::Receiver<Option<ProbeTarget>>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut interval = time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!(%role, interval_ms = self.interval.as_millis() as u64, "prober starting");

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                changed = targets.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    interval.reset_immediately();
                }
                _ = interval.tick() => {
                    let target = targets.borrow().clone();
                    if let Some(target) = target {
                        self.probe_once(role, &target).await;
                    }
                }
            }
        }

        tracing::debug!(%role, "prober stopped");
    }

    async fn probe_once(&self, role: Role, target: &ProbeTarget) {
        let addr = target.host.resolve(target.address).await;
        let outcome = self.pinger.ping(addr, self.timeout).await;
        if let Ok(rtt) = &outcome {
            tracing::trace!(%role, host = %target.host, %addr, rtt_ms = rtt.as_millis() as u64, "probe reply");
        }
        self.board.record(role, target.generation, outcome);
    }
}

// ── Region sweep ─────────────────────────────────────────────────────────────

/// Region sweep samples never go stale, so every entry uses one generation.
const SWEEP_GENERATION: u64 = 0;

/// One region as the sweep sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepRegion {
    pub code: &'static str,
    pub name: &'static str,
    pub stable: bool,
    /// `None` when the region has no public probe endpoint.
    pub host: Option<ProbeHost>,
}

impl From<&KnownRegion> for SweepRegion {
    fn from(region: &KnownRegion) -> Self {
        Self {
            code: region.code,
            name: region.name,
            stable: region.stable,
            host: region.ping_host.map(|h| ProbeHost::Name(h.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegionLatency {
    pub code: &'static str,
    pub name: &'static str,
    pub stable: bool,
    pub host: Option<ProbeHost>,
    pub latency: LatencyStatus,
}

/// Pings every known region's probe host each round, concurrently.
///
/// Unlike a pinned target, a region that stops answering is shown as
/// unreachable rather than keeping its last good sample.
pub struct RegionSweep {
    pinger: Arc<dyn Pinger>,
    board: LatencyBoard<&'static str>,
    regions: Vec<SweepRegion>,
    interval: Duration,
    timeout: Duration,
}

impl RegionSweep {
    /// Sweep over [`KNOWN_REGIONS`].
    pub fn new(pinger: Arc<dyn Pinger>, thresholds: Thresholds, interval: Duration, timeout: Duration) -> Self {
        let regions = KNOWN_REGIONS.iter().map(SweepRegion::from).collect();
        Self::with_regions(pinger, thresholds, regions, interval, timeout)
    }

    pub fn with_regions(
        pinger: Arc<dyn Pinger>,
        thresholds: Thresholds,
        regions: Vec<SweepRegion>,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        let board = LatencyBoard::new(thresholds);
        for region in regions.iter().filter(|r| r.host.is_some()) {
            board.reset(region.code, SWEEP_GENERATION);
        }
        Self {
            pinger,
            board,
            regions,
            interval,
            timeout,
        }
    }

    pub fn board(&self) -> &LatencyBoard<&'static str> {
        &self.board
    }

    /// Current reading for every region, in table order.
    pub fn statuses(&self) -> Vec<RegionLatency> {
        self.regions
            .iter()
            .map(|r| RegionLatency {
                code: r.code,
                name: r.name,
                stable: r.stable,
                host: r.host.clone(),
                latency: self.board.reading(r.code).status(),
            })
            .collect()
    }

    /// Ping every region once and wait for all replies or timeouts.
    pub async fn sweep_once(&self) {
        let mut pending = JoinSet::new();
        for region in &self.regions {
            let Some(host) = region.host.clone() else {
                continue;
            };
            let pinger = self.pinger.clone();
            let timeout = self.timeout;
            let code = region.code;
            pending.spawn(async move {
                let outcome = match host.lookup(true).await {
                    Some(addr) => pinger.ping(addr, timeout).await,
                    None => Err(ProbeError::Resolve(host.to_string())),
                };
                (code, outcome)
            });
        }

        while let Some(joined) = pending.join_next().await {
            match joined {
                Ok((code, Ok(rtt))) => {
                    self.board.record(code, SWEEP_GENERATION, Ok(rtt));
                }
                Ok((code, Err(e))) => {
                    tracing::debug!(region = code, error = %e, "region unreachable");
                    self.board.mark_unreachable(code, SWEEP_GENERATION);
                }
                Err(e) => tracing::debug!(error = %e, "region probe task failed"),
            }
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!(
            regions = self.regions.len(),
            interval_ms = self.interval.as_millis() as u64,
            "region sweep starting"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = interval.tick() => self.sweep_once().await,
            }
        }

        tracing::debug!("region sweep stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn severity_buckets() {
        let t = Thresholds::default();
        assert_eq!(t.classify(ms(42)), Severity::Good);
        assert_eq!(t.classify(ms(80)), Severity::Marginal);
        assert_eq!(t.classify(ms(129)), Severity::Marginal);
        assert_eq!(t.classify(ms(130)), Severity::Poor);
        assert_eq!(t.classify(ms(250)), Severity::VeryPoor);
    }

    #[test]
    fn timeout_keeps_previous_reading() {
        let board = LatencyBoard::default();
        board.reset(Role::Game, 1);
        assert_eq!(board.reading(Role::Game), LatencyReading::Measuring);

        assert!(board.record(Role::Game, 1, Ok(ms(42))));
        assert!(!board.record(Role::Game, 1, Err(ProbeError::Timeout(ms(2000)))));

        assert_eq!(board.reading(Role::Game).rtt(), Some(ms(42)));
        let status = board.reading(Role::Game).status();
        assert_eq!(status.state, "measured");
        assert_eq!(status.severity, Some(Severity::Good));
    }

    #[test]
    fn old_generation_samples_are_discarded() {
        let board = LatencyBoard::default();
        board.reset(Role::Game, 1);
        board.record(Role::Game, 1, Ok(ms(42)));

        board.reset(Role::Game, 2);
        assert!(!board.record(Role::Game, 1, Ok(ms(10))));
        assert_eq!(board.reading(Role::Game), LatencyReading::Measuring);

        assert!(board.record(Role::Game, 2, Ok(ms(300))));
        assert!(matches!(
            board.reading(Role::Game),
            LatencyReading::Measured { severity: Severity::VeryPoor, .. }
        ));
    }

    #[test]
    fn unpinned_role_is_idle() {
        let board = LatencyBoard::default();
        assert_eq!(board.reading(Role::Lobby), LatencyReading::Idle);
        assert!(!board.record(Role::Lobby, 1, Ok(ms(5))));
        board.reset(Role::Lobby, 3);
        board.clear(Role::Lobby);
        assert_eq!(board.reading(Role::Lobby), LatencyReading::Idle);
    }

    fn target(region: Option<&str>, is_cloud: bool) -> ClassifiedTarget {
        ClassifiedTarget {
            role: Role::Game,
            endpoint: "198.51.100.42:7777".parse().unwrap(),
            region: region.map(str::to_string),
            service: Some("GAMELIFT".into()),
            provider: Some("AWS".into()),
            descriptor: String::new(),
            is_cloud,
            is_session_service: false,
        }
    }

    #[test]
    fn probe_host_prefers_documented_ping_host() {
        assert_eq!(
            ProbeHost::for_target(&target(Some("eu-west-1"), true), true),
            ProbeHost::Name("gamelift-ping.eu-west-1.api.aws".into())
        );
        let raw = ProbeHost::Address("198.51.100.42".parse().unwrap());
        assert_eq!(ProbeHost::for_target(&target(Some("eu-west-1"), true), false), raw);
        assert_eq!(ProbeHost::for_target(&target(Some("eu-test-1"), true), true), raw);
        assert_eq!(ProbeHost::for_target(&target(Some("cn-north-1"), true), true), raw);
        assert_eq!(ProbeHost::for_target(&target(None, false), true), raw);
    }

    #[tokio::test]
    async fn address_host_resolves_to_itself() {
        let ip: IpAddr = "198.51.100.42".parse().unwrap();
        assert_eq!(ProbeHost::Address(ip).resolve("192.0.2.1".parse().unwrap()).await, ip);
    }

    #[test]
    fn reading_for_checks_generation() {
        let board = LatencyBoard::default();
        board.reset(Role::Lobby, 4);
        board.record(Role::Lobby, 4, Ok(ms(30)));
        assert_eq!(board.reading_for(Role::Lobby, 4).and_then(|r| r.rtt()), Some(ms(30)));
        assert_eq!(board.reading_for(Role::Lobby, 3), None);
        assert_eq!(board.reading_for(Role::Game, 4), None);
    }

    /// Replays scripted outcomes, then times out forever.
    struct ScriptedPinger {
        script: Mutex<Vec<Result<Duration, ProbeError>>>,
        calls: AtomicU16,
    }

    impl Pinger for ScriptedPinger {
        fn ping(&self, _addr: IpAddr, timeout: Duration) -> PingFuture<'_> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = {
                let mut script = self.script.lock().unwrap();
                if script.is_empty() {
                    Err(ProbeError::Timeout(timeout))
                } else {
                    script.remove(0)
                }
            };
            Box::pin(async move { next })
        }
    }

    #[tokio::test]
    async fn prober_keeps_42ms_through_timeouts() {
        let pinger = Arc::new(ScriptedPinger {
            script: Mutex::new(vec![Ok(ms(42))]),
            calls: AtomicU16::new(0),
        });
        let board = LatencyBoard::default();
        board.reset(Role::Game, 7);

        let (tx, rx) = watch::channel(Some(ProbeTarget {
            generation: 7,
            host: ProbeHost::Address("198.51.100.42".parse().unwrap()),
            address: "198.51.100.42".parse().unwrap(),
        }));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let prober = Prober::new(pinger.clone(), board.clone(), ms(10), ms(50));
        let task = tokio::spawn(prober.run(Role::Game, rx, shutdown_rx));

        let deadline = Instant::now() + Duration::from_secs(5);
        while pinger.calls.load(Ordering::SeqCst) < 4 && Instant::now() < deadline {
            time::sleep(ms(10)).await;
        }
        assert!(pinger.calls.load(Ordering::SeqCst) >= 4);
        assert_eq!(board.reading(Role::Game).rtt(), Some(ms(42)));

        let _ = shutdown_tx.send(());
        task.await.unwrap();
        drop(tx);
    }

    #[tokio::test]
    async fn prober_exits_when_pin_sender_is_dropped() {
        let pinger = Arc::new(ScriptedPinger {
            script: Mutex::new(Vec::new()),
            calls: AtomicU16::new(0),
        });
        let (tx, rx) = watch::channel(None);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let prober = Prober::new(pinger.clone(), LatencyBoard::default(), ms(10), ms(50));
        let task = tokio::spawn(prober.run(Role::Lobby, rx, shutdown_rx));

        drop(tx);
        time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        // Nothing pinned, so nothing probed.
        assert_eq!(pinger.calls.load(Ordering::SeqCst), 0);
    }

    /// Answers by address: a fixed delay for known hosts, timeout otherwise.
    struct TablePinger(Vec<(IpAddr, Duration)>);

    impl Pinger for TablePinger {
        fn ping(&self, addr: IpAddr, timeout: Duration) -> PingFuture<'_> {
            let reply = self.0.iter().find(|(a, _)| *a == addr).map(|(_, rtt)| *rtt);
            Box::pin(async move { reply.ok_or(ProbeError::Timeout(timeout)) })
        }
    }

    fn region(code: &'static str, host: Option<&str>) -> SweepRegion {
        SweepRegion {
            code,
            name: code,
            stable: true,
            host: host.map(|h| ProbeHost::Address(h.parse().unwrap())),
        }
    }

    #[tokio::test]
    async fn sweep_reports_every_region() {
        let pinger = Arc::new(TablePinger(vec![
            ("192.0.2.1".parse().unwrap(), ms(40)),
            ("192.0.2.2".parse().unwrap(), ms(140)),
        ]));
        let sweep = RegionSweep::with_regions(
            pinger,
            Thresholds::default(),
            vec![
                region("near-1", Some("192.0.2.1")),
                region("far-1", Some("192.0.2.2")),
                region("dark-1", Some("192.0.2.3")),
                region("closed-1", None),
            ],
            ms(1000),
            ms(50),
        );

        let before = sweep.statuses();
        assert_eq!(before[0].latency.state, "measuring");
        assert_eq!(before[3].latency.state, "idle");

        sweep.sweep_once().await;
        let after = sweep.statuses();
        assert_eq!(after.len(), 4);
        assert_eq!(after[0].latency.rtt_ms, Some(40.0));
        assert_eq!(after[0].latency.severity, Some(Severity::Good));
        assert_eq!(after[1].latency.severity, Some(Severity::Poor));
        assert_eq!(after[2].latency.state, "unreachable");
        assert_eq!(after[3].latency.state, "idle");
        assert_eq!(after[3].host, None);
    }

    #[tokio::test]
    async fn unreachable_region_replaces_old_sample() {
        let ip: IpAddr = "192.0.2.1".parse().unwrap();
        let sweep = RegionSweep::with_regions(
            Arc::new(TablePinger(vec![(ip, ms(40))])),
            Thresholds::default(),
            vec![region("near-1", Some("192.0.2.1"))],
            ms(1000),
            ms(50),
        );
        sweep.sweep_once().await;
        assert_eq!(sweep.board().reading("near-1").rtt(), Some(ms(40)));

        // Same region, pinger no longer answers.
        let silent = RegionSweep {
            pinger: Arc::new(TablePinger(Vec::new())),
            board: sweep.board().clone(),
            regions: vec![region("near-1", Some("192.0.2.1"))],
            interval: ms(1000),
            timeout: ms(50),
        };
        silent.sweep_once().await;
        assert_eq!(sweep.board().reading("near-1"), LatencyReading::Unreachable);
    }

    #[test]
    fn known_regions_without_ping_host_are_listed_but_not_pinged() {
        let sweep = RegionSweep::new(Arc::new(TablePinger(Vec::new())), Thresholds::default(), ms(5000), ms(2000));
        let statuses = sweep.statuses();
        assert_eq!(statuses.len(), KNOWN_REGIONS.len());
        let beijing = statuses.iter().find(|r| r.code == "cn-north-1").unwrap();
        assert_eq!(beijing.host, None);
        assert_eq!(beijing.latency.state, "idle");
        let ireland = statuses.iter().find(|r| r.code == "eu-west-1").unwrap();
        assert_eq!(ireland.host, Some(ProbeHost::Name("gamelift-ping.eu-west-1.api.aws".into())));
        assert_eq!(ireland.latency.state, "measuring");
    }
}
