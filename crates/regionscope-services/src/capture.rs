//! Promiscuous UDP capture feeding the flow table.
//!
//! The kernel rarely reports a remote peer for the game's UDP sockets (they
//! are unconnected), so the only way to see who the game talks to is to
//! watch the wire. Capture is scoped to the game's local UDP ports and runs
//! on a dedicated thread:
//!
//!   Stopped ──start()──▶ Starting ──channel open──▶ Capturing ──read errors──▶ Failed
//!      ▲                    │                          │                         │
//!      └────── error ───────┘◀──────── stop() ─────────┘◀──────── stop() ────────┘
//!
//! Failure to open a capture device is returned to the caller, which
//! degrades to TCP-only discovery. A thread that gives up after repeated
//! read errors leaves the state at `Failed` for the caller to notice.
//! Nothing here retries on its own.

use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use pnet::datalink::{self, Channel, Config, DataLinkReceiver, NetworkInterface};
use serde::Serialize;

use regionscope_core::config::CaptureConfig;
use regionscope_core::frame::{self, LinkKind, IPPROTO_UDP};
use regionscope_core::{is_non_routable, Direction, FlowKey};

use crate::flows::FlowTable;

/// Consecutive hard read errors before the capture thread gives up.
const MAX_READ_ERRORS: u32 = 16;

const VIRTUAL_PREFIXES: &[&str] = &[
    "lo", "docker", "veth", "br-", "virbr", "vmnet", "vboxnet", "tun", "tap", "wg", "zt", "tailscale",
];
const VIRTUAL_MARKERS: &[&str] = &["miniport", "pseudo", "virtual", "loopback"];
const PHYSICAL_PREFIXES: &[&str] = &["eth", "en", "wl"];
const PHYSICAL_MARKERS: &[&str] = &["ethernet", "wi-fi", "wireless", "802.11"];

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("no usable capture interface")]
    NoInterface,
    #[error("interface {0} not found")]
    InterfaceNotFound(String),
    #[error("permission denied opening {0} (needs root or CAP_NET_RAW)")]
    PermissionDenied(String),
    #[error("interface {0} does not provide a datalink channel")]
    UnsupportedChannel(String),
    #[error("failed to open {0}: {1}")]
    Open(String, #[source] io::Error),
    #[error("failed to spawn capture thread: {0}")]
    Spawn(#[source] io::Error),
}

// ── State & counters ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureState {
    Stopped,
    Starting,
    Capturing,
    /// The capture thread exited on its own after repeated read errors.
    Failed,
}

impl CaptureState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => CaptureState::Starting,
            2 => CaptureState::Capturing,
            3 => CaptureState::Failed,
            _ => CaptureState::Stopped,
        }
    }
}

#[derive(Default)]
struct Counters {
    frames_seen: AtomicU64,
    frames_udp: AtomicU64,
    frames_matched: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaptureStats {
    pub state: CaptureState,
    pub interface: Option<String>,
    pub scope: Vec<u16>,
    pub frames_seen: u64,
    pub frames_udp: u64,
    pub frames_matched: u64,
}

// ── Frame handling ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    NotUdp,
    OutOfScope,
    /// The remote side is loopback/private/link-local.
    LocalRemote,
    Recorded { first_sighting: bool },
}

/// Classify one frame and, if it belongs to an in-scope flow, count it.
///
/// A source port in scope means the datagram is outgoing; otherwise a
/// destination port in scope means incoming.
pub fn handle_frame(
    flows: &FlowTable,
    scope: &HashSet<u16>,
    raw: &[u8],
    link: LinkKind,
    now: Instant,
) -> FrameOutcome {
    if frame::ip_protocol(raw, link) != Some(IPPROTO_UDP) {
        return FrameOutcome::NotUdp;
    }
    let Some(datagram) = frame::parse_udp(raw, link) else {
        return FrameOutcome::NotUdp;
    };

    let (direction, local_port, remote) = if scope.contains(&datagram.src.port()) {
        (Direction::Outgoing, datagram.src.port(), datagram.dst)
    } else if scope.contains(&datagram.dst.port()) {
        (Direction::Incoming, datagram.dst.port(), datagram.src)
    } else {
        return FrameOutcome::OutOfScope;
    };

    if is_non_routable(remote.ip()) {
        return FrameOutcome::LocalRemote;
    }

    let key = FlowKey::new(remote.ip(), remote.port(), local_port);
    let first_sighting = flows.observe(key, direction, datagram.payload_len, now);
    if first_sighting {
        tracing::debug!(flow = %key, "new udp flow");
    } else {
        tracing::trace!(flow = %key, len = datagram.payload_len, ?direction, "udp datagram");
    }
    FrameOutcome::Recorded { first_sighting }
}

// ── Interface selection ───────────────────────────────────────────────────────

/// The parts of an interface that selection looks at.
#[derive(Debug, Clone)]
pub struct InterfaceInfo {
    pub name: String,
    pub description: String,
    pub up: bool,
    pub loopback: bool,
    pub has_ipv4: bool,
    pub has_ip: bool,
}

impl From<&NetworkInterface> for InterfaceInfo {
    fn from(iface: &NetworkInterface) -> Self {
        Self {
            name: iface.name.clone(),
            description: iface.description.clone(),
            up: iface.is_up(),
            loopback: iface.is_loopback(),
            has_ipv4: iface.ips.iter().any(|ip| ip.is_ipv4()),
            has_ip: !iface.ips.is_empty(),
        }
    }
}

/// Lower is better; `None` means unusable.
pub fn interface_rank(info: &InterfaceInfo) -> Option<u8> {
    if !info.up || info.loopback || !info.has_ip {
        return None;
    }
    let name = info.name.to_ascii_lowercase();
    let description = info.description.to_ascii_lowercase();
    if VIRTUAL_PREFIXES.iter().any(|p| name.starts_with(p))
        || VIRTUAL_MARKERS.iter().any(|m| description.contains(m))
    {
        return None;
    }

    let physical = PHYSICAL_PREFIXES.iter().any(|p| name.starts_with(p))
        || PHYSICAL_MARKERS.iter().any(|m| description.contains(m));
    Some(match (physical, info.has_ipv4) {
        (true, true) => 0,
        (false, true) => 1,
        (true, false) => 2,
        (false, false) => 3,
    })
}

fn select_interface(configured: &str) -> Result<NetworkInterface, CaptureError> {
    let interfaces = datalink::interfaces();
    if !configured.is_empty() {
        return interfaces
            .into_iter()
            .find(|i| i.name == configured)
            .ok_or_else(|| CaptureError::InterfaceNotFound(configured.to_string()));
    }
    interfaces
        .into_iter()
        .filter_map(|i| interface_rank(&InterfaceInfo::from(&i)).map(|rank| (rank, i)))
        .min_by_key(|(rank, _)| *rank)
        .map(|(_, i)| i)
        .ok_or(CaptureError::NoInterface)
}

fn link_kind(iface: &NetworkInterface) -> LinkKind {
    if iface.is_point_to_point() || iface.mac.is_none() {
        LinkKind::RawIp
    } else {
        LinkKind::Ethernet
    }
}

// ── Capture ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    /// Empty = auto-select.
    pub interface: String,
    pub promiscuous: bool,
    pub read_timeout: Duration,
    pub buffer_bytes: usize,
}

impl From<&CaptureConfig> for CaptureSettings {
    fn from(config: &CaptureConfig) -> Self {
        Self {
            interface: config.interface.clone(),
            promiscuous: config.promiscuous,
            read_timeout: config.read_timeout(),
            buffer_bytes: config.buffer_bytes,
        }
    }
}

struct Worker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
    interface: String,
}

pub struct FlowCapture {
    flows: FlowTable,
    settings: CaptureSettings,
    state: Arc<AtomicU8>,
    counters: Arc<Counters>,
    scope: HashSet<u16>,
    worker: Option<Worker>,
}

impl FlowCapture {
    pub fn new(flows: FlowTable, settings: CaptureSettings) -> Self {
        Self {
            flows,
            settings,
            state: Arc::new(AtomicU8::new(CaptureState::Stopped as u8)),
            counters: Arc::new(Counters::default()),
            scope: HashSet::new(),
            worker: None,
        }
    }

    pub fn flows(&self) -> &FlowTable {
        &self.flows
    }

    pub fn state(&self) -> CaptureState {
        CaptureState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn scope(&self) -> &HashSet<u16> {
        &self.scope
    }

    /// Starting or capturing.
    pub fn is_running(&self) -> bool {
        matches!(self.state(), CaptureState::Starting | CaptureState::Capturing)
    }

    /// Open the capture device and start the capture thread.
    ///
    /// Any running capture is stopped first.
    pub fn start(&mut self, scope: HashSet<u16>) -> Result<(), CaptureError> {
        self.stop();
        self.set_state(CaptureState::Starting);

        match self.open_and_spawn(&scope) {
            Ok(worker) => {
                tracing::info!(
                    interface = %worker.interface,
                    ports = ?scope,
                    "udp capture started"
                );
                self.worker = Some(worker);
                self.scope = scope;
                Ok(())
            }
            Err(e) => {
                self.set_state(CaptureState::Stopped);
                Err(e)
            }
        }
    }

    /// Stop, drop flows for ports that left the scope, start again.
    pub fn restart(&mut self, scope: HashSet<u16>) -> Result<(), CaptureError> {
        self.stop();
        self.flows.prune_scope(&scope);
        self.start(scope)
    }

    /// Stop the capture thread and release the device. Safe when never started.
    pub fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop.store(true, Ordering::Release);
            // The thread notices within one read timeout.
            if worker.handle.join().is_err() {
                tracing::warn!(interface = %worker.interface, "capture thread panicked");
            }
            tracing::info!(interface = %worker.interface, "udp capture stopped");
        }
        self.set_state(CaptureState::Stopped);
    }

    pub fn stats(&self) -> CaptureStats {
        let mut scope: Vec<u16> = self.scope.iter().copied().collect();
        scope.sort_unstable();
        CaptureStats {
            state: self.state(),
            interface: self.worker.as_ref().map(|w| w.interface.clone()),
            scope,
            frames_seen: self.counters.frames_seen.load(Ordering::Relaxed),
            frames_udp: self.counters.frames_udp.load(Ordering::Relaxed),
            frames_matched: self.counters.frames_matched.load(Ordering::Relaxed),
        }
    }

    fn set_state(&self, state: CaptureState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Run the capture loop over an already-open receiver.
    #[cfg(test)]
    pub(crate) fn start_with_receiver(
        &mut self,
        rx: Box<dyn DataLinkReceiver>,
        scope: HashSet<u16>,
    ) -> Result<(), CaptureError> {
        self.stop();
        self.set_state(CaptureState::Starting);
        let worker = self.spawn_worker(rx, LinkKind::Ethernet, &scope, "test0".into())?;
        self.worker = Some(worker);
        self.scope = scope;
        Ok(())
    }

    fn open_and_spawn(&self, scope: &HashSet<u16>) -> Result<Worker, CaptureError> {
        let iface = select_interface(&self.settings.interface)?;
        let link = link_kind(&iface);

        let config = Config {
            read_buffer_size: self.settings.buffer_bytes,
            read_timeout: Some(self.settings.read_timeout),
            promiscuous: self.settings.promiscuous,
            ..Default::default()
        };

        let rx = match datalink::channel(&iface, config) {
            Ok(Channel::Ethernet(_tx, rx)) => rx,
            Ok(_) => return Err(CaptureError::UnsupportedChannel(iface.name.clone())),
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                return Err(CaptureError::PermissionDenied(iface.name.clone()));
            }
            Err(e) => return Err(CaptureError::Open(iface.name.clone(), e)),
        };

        self.spawn_worker(rx, link, scope, iface.name)
    }

    fn spawn_worker(
        &self,
        rx: Box<dyn DataLinkReceiver>,
        link: LinkKind,
        scope: &HashSet<u16>,
        interface: String,
    ) -> Result<Worker, CaptureError> {
        let stop = Arc::new(AtomicBool::new(false));
        let ctx = LoopContext {
            rx,
            link,
            scope: scope.clone(),
            flows: self.flows.clone(),
            counters: self.counters.clone(),
            state: self.state.clone(),
            stop: stop.clone(),
            interface: interface.clone(),
        };

        let handle = std::thread::Builder::new()
            .name("regionscope-capture".into())
            .spawn(move || ctx.run())
            .map_err(CaptureError::Spawn)?;

        Ok(Worker {
            stop,
            handle,
            interface,
        })
    }
}

impl Drop for FlowCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

struct LoopContext {
    rx: Box<dyn DataLinkReceiver>,
    link: LinkKind,
    scope: HashSet<u16>,
    flows: FlowTable,
    counters: Arc<Counters>,
    state: Arc<AtomicU8>,
    stop: Arc<AtomicBool>,
    interface: String,
}

impl LoopContext {
    fn run(mut self) {
        self.state
            .store(CaptureState::Capturing as u8, Ordering::Release);
        let mut errors = 0u32;
        let mut exit_state = CaptureState::Stopped;

        while !self.stop.load(Ordering::Acquire) {
            match self.rx.next() {
                Ok(raw) => {
                    errors = 0;
                    self.counters.frames_seen.fetch_add(1, Ordering::Relaxed);
                    match handle_frame(&self.flows, &self.scope, raw, self.link, Instant::now()) {
                        FrameOutcome::NotUdp => {}
                        FrameOutcome::Recorded { .. } => {
                            self.counters.frames_udp.fetch_add(1, Ordering::Relaxed);
                            self.counters.frames_matched.fetch_add(1, Ordering::Relaxed);
                        }
                        FrameOutcome::OutOfScope | FrameOutcome::LocalRemote => {
                            self.counters.frames_udp.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => {
                    errors += 1;
                    tracing::debug!(error = %e, errors, interface = %self.interface, "capture read failed");
                    if errors >= MAX_READ_ERRORS {
                        tracing::warn!(interface = %self.interface, error = %e, "capture giving up after repeated read errors");
                        exit_state = CaptureState::Failed;
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        }

        self.state.store(exit_state as u8, Ordering::Release);
    }
}
