//! Monitor session: discovery, capture, pinning and probing wired together.
//!
//! ```text
//!   discovery task (2s) ──▶ sockets ──▶ capture scope ──▶ classify ──▶ pin ──▶ snapshot
//!                                                                      │
//!                                        watch<ProbeTarget> per role ◀─┘
//!                                                  │
//!   prober tasks (1s)  ◀───────────────────────────┘──▶ latency board
//! ```
//!
//! [`Discovery`] holds all per-tick state and can be driven directly; the
//! [`MonitorSession`] owns one behind a mutex and runs it on a timer.
//! Readers never take that mutex: they get the last published snapshot
//! with latency overlaid from the board.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use regionscope_core::config::{LobbyPriority, RegionScopeConfig};
use regionscope_core::{normalize_ip, ClassifiedTarget, FlowSnapshot, Role, SocketRecord};

use crate::capture::{CaptureSettings, CaptureState, CaptureStats, FlowCapture};
use crate::classifier::{rank_lobby, Classifier, ClassifierSettings};
use crate::flows::FlowTable;
use crate::ip_ranges::IpRangeRegistry;
use crate::latency::{
    IcmpPinger, LatencyBoard, LatencyStatus, Pinger, ProbeHost, ProbeTarget, Prober, RegionLatency,
    RegionSweep, Thresholds,
};
use crate::sockets::{find_process_ids, SocketEnumerator};
use crate::tracker::{PinChange, PinnedTarget, TargetTracker};

// ── Settings ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub interval: Duration,
    pub timeout: Duration,
    pub thresholds: Thresholds,
    /// `None` = region sweep disabled.
    pub sweep_interval: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub process_name: String,
    pub discovery_interval: Duration,
    pub include_unknown_owner: bool,
    pub lobby_priority: LobbyPriority,
    pub use_ping_hosts: bool,
    pub liveness: Duration,
    /// `None` = capture disabled.
    pub capture: Option<CaptureSettings>,
    /// `None` = probing disabled.
    pub probe: Option<ProbeSettings>,
    pub classifier: ClassifierSettings,
}

impl From<&RegionScopeConfig> for MonitorSettings {
    fn from(config: &RegionScopeConfig) -> Self {
        Self {
            process_name: config.target.process_name.clone(),
            discovery_interval: config.discovery.interval(),
            include_unknown_owner: config.discovery.include_unknown_owner,
            lobby_priority: config.discovery.lobby_priority,
            use_ping_hosts: config.probe.use_ping_hosts,
            liveness: config.capture.liveness(),
            capture: config
                .capture
                .enabled
                .then(|| CaptureSettings::from(&config.capture)),
            probe: config.probe.enabled.then(|| ProbeSettings {
                interval: config.probe.interval(),
                timeout: config.probe.timeout(),
                thresholds: Thresholds::from(&config.probe),
                sweep_interval: config.probe.sweep_enabled.then(|| config.probe.sweep_interval()),
            }),
            classifier: ClassifierSettings::from(config),
        }
    }
}

// ── Snapshot ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct TargetStatus {
    #[serde(flatten)]
    pub target: ClassifiedTarget,
    pub probe_host: ProbeHost,
    pub pinned_secs: u64,
    pub confirmed_secs_ago: u64,
    pub stale: bool,
    pub generation: u64,
    pub latency: LatencyStatus,
}

impl TargetStatus {
    fn new(pin: &PinnedTarget, latency: LatencyStatus, now: Instant) -> Self {
        Self {
            target: pin.target.clone(),
            probe_host: pin.probe_host.clone(),
            pinned_secs: now.saturating_duration_since(pin.pinned_at).as_secs(),
            confirmed_secs_ago: now.saturating_duration_since(pin.last_confirmed).as_secs(),
            stale: pin.stale,
            generation: pin.generation,
            latency,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CaptureMode {
    Disabled,
    /// Enabled, no UDP ports to watch yet.
    Idle,
    Active,
    /// Capture could not start; discovery is TCP and socket-table only.
    Degraded { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct CaptureStatus {
    pub mode: CaptureMode,
    pub stats: Option<CaptureStats>,
    pub flows: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub process: String,
    pub pids: Vec<u32>,
    pub tick: u64,
    pub lobby: Option<TargetStatus>,
    pub game: Option<TargetStatus>,
    pub capture: CaptureStatus,
}

impl Snapshot {
    fn empty(process: &str) -> Self {
        Self {
            process: process.to_string(),
            pids: Vec::new(),
            tick: 0,
            lobby: None,
            game: None,
            capture: CaptureStatus {
                mode: CaptureMode::Idle,
                stats: None,
                flows: 0,
            },
        }
    }

    pub fn target(&self, role: Role) -> Option<&TargetStatus> {
        match role {
            Role::Lobby => self.lobby.as_ref(),
            Role::Game => self.game.as_ref(),
        }
    }

    fn target_mut(&mut self, role: Role) -> Option<&mut TargetStatus> {
        match role {
            Role::Lobby => self.lobby.as_mut(),
            Role::Game => self.game.as_mut(),
        }
    }
}

// ── Discovery ─────────────────────────────────────────────────────────────────

pub type PidLookup = fn(&str) -> Vec<u32>;

/// Everything one discovery tick needs.
pub struct Discovery {
    settings: MonitorSettings,
    classifier: Classifier,
    enumerator: Arc<SocketEnumerator>,
    find_pids: PidLookup,
    flows: FlowTable,
    capture: Option<FlowCapture>,
    degraded: Option<String>,
    /// When the UDP port set last went empty.
    scope_empty_since: Option<Instant>,
    tracker: TargetTracker,
    board: LatencyBoard,
    pins: HashMap<Role, watch::Sender<Option<ProbeTarget>>>,
    last_pids: Vec<u32>,
    ticks: u64,
}

impl Discovery {
    pub fn new(settings: MonitorSettings, registry: Arc<IpRangeRegistry>) -> Self {
        let enumerator = SocketEnumerator::new(settings.include_unknown_owner);
        Self::with_enumerator(settings, registry, enumerator)
    }

    pub fn with_enumerator(
        settings: MonitorSettings,
        registry: Arc<IpRangeRegistry>,
        enumerator: SocketEnumerator,
    ) -> Self {
        let flows = FlowTable::new(settings.liveness);
        let capture = settings
            .capture
            .clone()
            .map(|c| FlowCapture::new(flows.clone(), c));
        let board = LatencyBoard::new(
            settings
                .probe
                .as_ref()
                .map(|p| p.thresholds)
                .unwrap_or_default(),
        );
        let pins = Role::ALL
            .into_iter()
            .map(|role| (role, watch::channel(None).0))
            .collect();
        Self {
            classifier: Classifier::new(registry, settings.classifier.clone()),
            tracker: TargetTracker::new(settings.use_ping_hosts),
            enumerator: Arc::new(enumerator),
            find_pids: find_process_ids,
            flows,
            capture,
            degraded: None,
            scope_empty_since: None,
            board,
            pins,
            last_pids: Vec::new(),
            ticks: 0,
            settings,
        }
    }

    /// Replace the process lookup.
    pub fn with_pid_lookup(mut self, find_pids: PidLookup) -> Self {
        self.find_pids = find_pids;
        self
    }

    pub fn flows(&self) -> &FlowTable {
        &self.flows
    }

    pub fn board(&self) -> &LatencyBoard {
        &self.board
    }

    pub fn tracker(&self) -> &TargetTracker {
        &self.tracker
    }

    pub fn registry(&self) -> &Arc<IpRangeRegistry> {
        self.classifier.registry()
    }

    /// Channel the prober for `role` listens on.
    pub fn subscribe(&self, role: Role) -> watch::Receiver<Option<ProbeTarget>> {
        match self.pins.get(&role) {
            Some(tx) => tx.subscribe(),
            None => watch::channel(None).1,
        }
    }

    /// Run one discovery pass and return the resulting snapshot.
    pub async fn tick(&mut self, now: Instant) -> Snapshot {
        self.ticks += 1;

        let pids = self.resolve_pids().await;
        let (tcp, udp) = self.enumerate(&pids).await;

        let scope: HashSet<u16> = udp
            .iter()
            .map(|r| r.local.port())
            .filter(|p| *p != 0)
            .collect();
        self.update_capture(scope, now).await;

        let lobby = self.lobby_candidates(&tcp).await;
        let game = self.game_candidates(&udp, now).await;

        // TCP tables carry no timestamps: a lobby pin confirmed within the
        // liveness window survives a tick where its socket was not listed.
        let lobby_alive = self.is_pin_alive(Role::Lobby, |ep| tcp.iter().any(|r| is_peer(r, ep)))
            || self.confirmed_within_liveness(Role::Lobby, now);
        let flows = self.flows.clone();
        let game_alive = self.is_pin_alive(Role::Game, |ep| {
            flows.is_endpoint_live(ep, now) || udp.iter().any(|r| is_peer(r, ep))
        });

        self.apply(Role::Lobby, &lobby, lobby_alive, now);
        self.apply(Role::Game, &game, game_alive, now);

        self.flows.expire(now);
        self.snapshot(now)
    }

    /// Stop capture and forget pins.
    pub async fn shutdown(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            let _ = tokio::task::spawn_blocking(move || capture.stop()).await;
        }
        self.tracker.clear();
        for role in Role::ALL {
            self.publish(role);
        }
    }

    async fn resolve_pids(&mut self) -> Vec<u32> {
        let name = self.settings.process_name.clone();
        let find_pids = self.find_pids;
        let mut pids = tokio::task::spawn_blocking(move || find_pids(&name))
            .await
            .unwrap_or_else(|e| {
                tracing::debug!(error = %e, "process lookup worker failed");
                Vec::new()
            });
        pids.sort_unstable();
        pids.dedup();

        if pids != self.last_pids {
            if pids.is_empty() {
                tracing::info!(process = %self.settings.process_name, "target process not running");
            } else {
                tracing::info!(process = %self.settings.process_name, ?pids, "target process found");
            }
            self.last_pids = pids.clone();
        }
        pids
    }

    async fn enumerate(&self, pids: &[u32]) -> (Vec<SocketRecord>, Vec<SocketRecord>) {
        if pids.is_empty() {
            return (Vec::new(), Vec::new());
        }
        let enumerator = self.enumerator.clone();
        let pids = pids.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut tcp = Vec::new();
            let mut udp = Vec::new();
            for pid in pids {
                extend_unique(&mut tcp, enumerator.list_tcp(Some(pid)));
                extend_unique(&mut udp, enumerator.list_udp(Some(pid)));
            }
            (tcp, udp)
        })
        .await
        .unwrap_or_else(|e| {
            tracing::debug!(error = %e, "socket enumeration worker failed");
            (Vec::new(), Vec::new())
        })
    }

    /// Follow the target's UDP ports.
    ///
    /// An empty port set leaves capture running and the flow table alone;
    /// flows age out through `expire`. Capture stops only once the set has
    /// stayed empty for longer than the liveness window. A device that fails
    /// to open, or a capture thread that gives up, is final for this session.
    async fn update_capture(&mut self, scope: HashSet<u16>, now: Instant) {
        if self.degraded.is_some() {
            return;
        }
        let Some(capture) = self.capture.take() else {
            return;
        };

        if capture.state() == CaptureState::Failed {
            self.degrade(capture, "capture thread stopped after repeated read errors")
                .await;
            return;
        }

        if scope.is_empty() {
            let since = *self.scope_empty_since.get_or_insert(now);
            let idle_too_long = now.saturating_duration_since(since) > self.settings.liveness;
            if !(idle_too_long && capture.is_running()) {
                self.capture = Some(capture);
                return;
            }
            tracing::debug!("no udp ports for a full liveness window, stopping capture");
            let stopped = tokio::task::spawn_blocking(move || {
                let mut capture = capture;
                capture.stop();
                capture
            })
            .await;
            match stopped {
                Ok(capture) => self.capture = Some(capture),
                Err(e) => {
                    tracing::warn!(error = %e, "capture worker failed, continuing without UDP flows");
                    self.degraded = Some(e.to_string());
                }
            }
            return;
        }
        self.scope_empty_since = None;

        if capture.scope() == &scope && capture.is_running() {
            self.capture = Some(capture);
            return;
        }

        let joined = tokio::task::spawn_blocking(move || {
            let mut capture = capture;
            let result = capture.restart(scope);
            (capture, result)
        })
        .await;

        match joined {
            Ok((capture, Ok(()))) => self.capture = Some(capture),
            Ok((_, Err(e))) => {
                tracing::warn!(error = %e, "packet capture unavailable, continuing without UDP flows");
                self.degraded = Some(e.to_string());
            }
            Err(e) => {
                tracing::warn!(error = %e, "capture worker failed, continuing without UDP flows");
                self.degraded = Some(e.to_string());
            }
        }
    }

    async fn degrade(&mut self, mut capture: FlowCapture, reason: &str) {
        tracing::warn!(reason, "packet capture lost, continuing without UDP flows");
        let _ = tokio::task::spawn_blocking(move || capture.stop()).await;
        self.degraded = Some(reason.to_string());
    }

    async fn lobby_candidates(&self, tcp: &[SocketRecord]) -> Vec<ClassifiedTarget> {
        let mut candidates = Vec::new();
        for record in tcp.iter().filter(|r| r.is_established()) {
            if let Some(target) = self.classifier.classify(record, Role::Lobby).await {
                if target.is_cloud && !candidates.iter().any(|c: &ClassifiedTarget| c.endpoint == target.endpoint) {
                    candidates.push(target);
                }
            }
        }
        rank_lobby(candidates, self.settings.lobby_priority)
    }

    /// Live captured flows, busiest first, then any connected UDP sockets.
    async fn game_candidates(&self, udp: &[SocketRecord], now: Instant) -> Vec<ClassifiedTarget> {
        let mut endpoints: Vec<SocketAddr> = Vec::new();
        for flow in self.flows.live_flows(now) {
            let endpoint = flow.key.remote_endpoint();
            if !endpoints.contains(&endpoint) {
                endpoints.push(endpoint);
            }
        }
        for peer in udp.iter().filter_map(SocketRecord::peer) {
            if !endpoints.contains(&peer) {
                endpoints.push(peer);
            }
        }

        let mut candidates = Vec::new();
        for endpoint in endpoints {
            if let Some(target) = self.classifier.classify_endpoint(endpoint, Role::Game).await {
                if !candidates.iter().any(|c: &ClassifiedTarget| c.endpoint == target.endpoint) {
                    candidates.push(target);
                }
            }
        }
        candidates
    }

    fn is_pin_alive(&self, role: Role, alive: impl Fn(SocketAddr) -> bool) -> bool {
        self.tracker
            .pinned(role)
            .is_some_and(|pin| alive(pin.target.endpoint))
    }

    fn confirmed_within_liveness(&self, role: Role, now: Instant) -> bool {
        self.tracker
            .pinned(role)
            .is_some_and(|pin| now.saturating_duration_since(pin.last_confirmed) <= self.settings.liveness)
    }

    fn apply(&mut self, role: Role, candidates: &[ClassifiedTarget], alive: bool, now: Instant) {
        let change = self.tracker.update(role, candidates, alive, now);
        match change {
            PinChange::Adopted | PinChange::Replaced { .. } => {
                if let Some(pin) = self.tracker.pinned(role) {
                    tracing::info!(
                        %role,
                        endpoint = %pin.target.endpoint,
                        target = %pin.target.descriptor,
                        probe = %pin.probe_host,
                        generation = pin.generation,
                        "pinned target"
                    );
                }
            }
            PinChange::Cleared { previous } => {
                tracing::info!(%role, %previous, "pin cleared");
            }
            PinChange::RetainedStale => {
                tracing::debug!(%role, "no candidates, keeping pin while it is alive");
            }
            PinChange::Kept | PinChange::Empty => {}
        }
        if change.is_new_target() {
            self.publish(role);
        }
    }

    /// Point the prober at the current pin and reset the reading.
    fn publish(&self, role: Role) {
        let target = self.tracker.pinned(role).map(|pin| ProbeTarget {
            generation: pin.generation,
            host: pin.probe_host.clone(),
            address: pin.target.endpoint.ip(),
        });
        match &target {
            Some(t) => self.board.reset(role, t.generation),
            None => self.board.clear(role),
        }
        if let Some(tx) = self.pins.get(&role) {
            tx.send_replace(target);
        }
    }

    fn capture_status(&self) -> CaptureStatus {
        let mode = match (&self.degraded, &self.capture) {
            (Some(reason), _) => CaptureMode::Degraded {
                reason: reason.clone(),
            },
            (None, None) => CaptureMode::Disabled,
            (None, Some(c)) if c.state() == CaptureState::Capturing => CaptureMode::Active,
            (None, Some(_)) => CaptureMode::Idle,
        };
        CaptureStatus {
            mode,
            stats: self.capture.as_ref().map(FlowCapture::stats),
            flows: self.flows.len(),
        }
    }

    pub fn snapshot(&self, now: Instant) -> Snapshot {
        let status = |role| {
            self.tracker
                .pinned(role)
                .map(|pin| TargetStatus::new(pin, self.board.reading(role).status(), now))
        };
        Snapshot {
            process: self.settings.process_name.clone(),
            pids: self.last_pids.clone(),
            tick: self.ticks,
            lobby: status(Role::Lobby),
            game: status(Role::Game),
            capture: self.capture_status(),
        }
    }
}

fn is_peer(record: &SocketRecord, endpoint: SocketAddr) -> bool {
    record
        .peer()
        .is_some_and(|p| normalize_ip(p.ip()) == endpoint.ip() && p.port() == endpoint.port())
}

fn extend_unique(into: &mut Vec<SocketRecord>, records: Vec<SocketRecord>) {
    for record in records {
        if !into.contains(&record) {
            into.push(record);
        }
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

struct Shared {
    discovery: Mutex<Discovery>,
    latest: watch::Sender<Snapshot>,
    flows: FlowTable,
    board: LatencyBoard,
    sweep: Option<Arc<RegionSweep>>,
    registry: Arc<IpRangeRegistry>,
}

/// A running monitor. Must be started inside a tokio runtime.
pub struct MonitorSession {
    shared: Arc<Shared>,
    shutdown: broadcast::Sender<()>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl MonitorSession {
    /// Watch `process_name` using the rest of `config`.
    pub fn start(
        process_name: impl Into<String>,
        config: &RegionScopeConfig,
        registry: Arc<IpRangeRegistry>,
    ) -> Self {
        let mut settings = MonitorSettings::from(config);
        settings.process_name = process_name.into();
        let pinger: Arc<dyn Pinger> = Arc::new(IcmpPinger::new());
        Self::spawn(Discovery::new(settings, registry), pinger)
    }

    /// Start from a prepared [`Discovery`] and pinger.
    pub fn spawn(discovery: Discovery, pinger: Arc<dyn Pinger>) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        let interval = discovery.settings.discovery_interval;
        let probe = discovery.settings.probe.clone();
        let flows = discovery.flows.clone();
        let board = discovery.board.clone();
        let registry = discovery.registry().clone();
        let (latest, _) = watch::channel(Snapshot::empty(&discovery.settings.process_name));

        tracing::info!(
            process = %discovery.settings.process_name,
            interval_ms = interval.as_millis() as u64,
            capture = discovery.capture.is_some(),
            probe = probe.is_some(),
            "monitor session starting"
        );

        let mut tasks = Vec::new();
        let mut sweep = None;
        if let Some(probe) = probe {
            for role in Role::ALL {
                let prober = Prober::new(pinger.clone(), board.clone(), probe.interval, probe.timeout);
                tasks.push(tokio::spawn(prober.run(
                    role,
                    discovery.subscribe(role),
                    shutdown.subscribe(),
                )));
            }
            if let Some(every) = probe.sweep_interval {
                let regions = Arc::new(RegionSweep::new(pinger.clone(), probe.thresholds, every, probe.timeout));
                tasks.push(tokio::spawn(regions.clone().run(shutdown.subscribe())));
                sweep = Some(regions);
            }
        }

        let shared = Arc::new(Shared {
            discovery: Mutex::new(discovery),
            latest,
            flows,
            board,
            sweep,
            registry,
        });
        tasks.push(tokio::spawn(discovery_loop(shared.clone(), interval, shutdown.subscribe())));

        Self {
            shared,
            shutdown,
            tasks: StdMutex::new(tasks),
            stopped: AtomicBool::new(false),
        }
    }

    /// Run a discovery pass now.
    pub async fn tick(&self) -> Snapshot {
        let snapshot = self.shared.discovery.lock().await.tick(Instant::now()).await;
        self.shared.latest.send_replace(snapshot.clone());
        snapshot
    }

    /// The most recent snapshot, with latency as of now. Does not wait for
    /// a discovery pass in progress.
    pub fn snapshot(&self) -> Snapshot {
        let mut snapshot = self.latest();
        for role in Role::ALL {
            if let Some(target) = snapshot.target_mut(role) {
                if let Some(reading) = self.shared.board.reading_for(role, target.generation) {
                    target.latency = reading.status();
                }
            }
        }
        snapshot
    }

    /// The most recent snapshot published by a tick, without waiting.
    pub fn latest(&self) -> Snapshot {
        self.shared.latest.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.shared.latest.subscribe()
    }

    pub fn live_flows(&self) -> Vec<FlowSnapshot> {
        self.shared.flows.live_flows(Instant::now())
    }

    pub fn registry(&self) -> &Arc<IpRangeRegistry> {
        &self.shared.registry
    }

    pub fn board(&self) -> &LatencyBoard {
        &self.shared.board
    }

    /// Latency to every known region. `None` when the sweep is disabled.
    pub fn regions(&self) -> Option<Vec<RegionLatency>> {
        self.shared.sweep.as_ref().map(|sweep| sweep.statuses())
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Stop all tasks and the capture thread. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown.send(());
        self.abort_tasks();
        let mut discovery = self.shared.discovery.lock().await;
        discovery.shutdown().await;
        self.shared.latest.send_replace(discovery.snapshot(Instant::now()));
        tracing::info!("monitor session stopped");
    }

    fn abort_tasks(&self) {
        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for task in tasks {
            task.abort();
        }
    }
}

impl Drop for MonitorSession {
    fn drop(&mut self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            let _ = self.shutdown.send(());
            self.abort_tasks();
        }
    }
}

async fn discovery_loop(shared: Arc<Shared>, every: Duration, mut shutdown: broadcast::Receiver<()>) {
    let mut interval = time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = interval.tick() => {
                let snapshot = shared.discovery.lock().await.tick(Instant::now()).await;
                shared.latest.send_replace(snapshot);
            }
        }
    }
    tracing::debug!("discovery loop stopped");
}
