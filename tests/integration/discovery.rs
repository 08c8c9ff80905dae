//! Discovery passes end to end: frames and socket tables in, pinned
//! targets and snapshots out.

use std::collections::HashSet;
use std::time::{Duration, Instant, SystemTime};

use regionscope_core::config::RegionScopeConfig;
use regionscope_core::frame::LinkKind;
use regionscope_core::Role;
use regionscope_services::capture::{handle_frame, FrameOutcome};
use regionscope_services::monitor::CaptureMode;
use regionscope_services::{Discovery, MonitorSettings, ProbeHost, SocketEnumerator, SocketSource};

use crate::*;

const LOCAL: [u8; 4] = [192, 168, 1, 10];
const SERVER: [u8; 4] = [198, 51, 100, 42];

fn monitor_settings() -> MonitorSettings {
    let mut config = RegionScopeConfig::default();
    config.capture.enabled = false;
    MonitorSettings::from(&config)
}

fn discovery_with(sources: Vec<Box<dyn SocketSource>>, include_unknown_owner: bool) -> Discovery {
    let reg = registry(ScriptedFeed::ok(FEED), TestClock::at(SystemTime::now()), None);
    let enumerator = SocketEnumerator::with_sources(sources, include_unknown_owner);
    Discovery::with_enumerator(monitor_settings(), reg, enumerator).with_pid_lookup(|_| vec![GAME_PID])
}

fn discovery(table: &SocketTable) -> Discovery {
    discovery_with(vec![Box::new(table.clone())], true)
}

/// Feed a short burst of game traffic through the frame handler.
fn exchange(d: &Discovery, server: [u8; 4], port: u16, now: Instant) {
    let scope = HashSet::from([50000]);
    for _ in 0..3 {
        let out = udp_frame(LOCAL, 50000, server, port, 40);
        let back = udp_frame(server, port, LOCAL, 50000, 120);
        assert!(matches!(
            handle_frame(d.flows(), &scope, &out, LinkKind::Ethernet, now),
            FrameOutcome::Recorded { .. }
        ));
        assert!(matches!(
            handle_frame(d.flows(), &scope, &back, LinkKind::Ethernet, now),
            FrameOutcome::Recorded { .. }
        ));
    }
}

/// 198.51.100.0/24 is eu-test-1 GAMELIFT; UDP traffic to
/// 198.51.100.42:7777 becomes the pinned game target.
#[tokio::test]
async fn test_end_to_end_game_target() {
    let table = SocketTable::default();
    table.set(vec![udp_bound(50000)]);
    let mut d = discovery(&table);

    let t0 = Instant::now();
    exchange(&d, SERVER, 7777, t0);

    let snap = d.tick(t0).await;
    let game = snap.game.expect("game target pinned");
    assert_eq!(game.target.role, Role::Game);
    assert_eq!(game.target.endpoint, "198.51.100.42:7777".parse().unwrap());
    assert_eq!(game.target.region.as_deref(), Some("eu-test-1"));
    assert_eq!(game.target.service.as_deref(), Some("GAMELIFT"));
    assert!(game.target.is_cloud);
    assert_eq!(game.target.descriptor, "AWS GAMELIFT eu-test-1");
    assert_eq!(game.probe_host, ProbeHost::Address("198.51.100.42".parse().unwrap()));
    assert_eq!(snap.pids, vec![GAME_PID]);
    assert_eq!(snap.capture.mode, CaptureMode::Disabled);

    let flow = d.flows().active_flow(t0).unwrap();
    assert_eq!(flow.stats.packets, 6);
    assert_eq!(flow.stats.bytes_sent, 120);
    assert_eq!(flow.stats.bytes_received, 360);

    // Next tick confirms the same pin.
    let again = d.tick(t0 + Duration::from_secs(2)).await.game.unwrap();
    assert_eq!(again.generation, game.generation);
    assert!(!again.stale);
}

/// A flow quiet for 9s still counts; at 11s it is gone and so is the pin.
#[tokio::test]
async fn test_flow_eviction() {
    let table = SocketTable::default();
    table.set(vec![udp_bound(50000)]);
    let mut d = discovery(&table);

    let t0 = Instant::now();
    exchange(&d, SERVER, 7777, t0);

    assert!(d.tick(t0 + Duration::from_secs(9)).await.game.is_some());
    let snap = d.tick(t0 + Duration::from_secs(11)).await;
    assert!(snap.game.is_none());
    assert!(d.flows().is_empty());
}

/// The pin moves only once the old server stops talking.
#[tokio::test]
async fn test_pin_replacement() {
    let table = SocketTable::default();
    table.set(vec![udp_bound(50000)]);
    let mut d = discovery(&table);

    let t0 = Instant::now();
    exchange(&d, SERVER, 7777, t0);
    let first = d.tick(t0).await.game.unwrap();

    // New match server, the old one still inside its liveness window.
    let other = [203, 0, 113, 50];
    let t1 = t0 + Duration::from_secs(4);
    exchange(&d, other, 7778, t1);
    exchange(&d, other, 7778, t1);
    let kept = d.tick(t1).await.game.unwrap();
    assert_eq!(kept.target.endpoint, first.target.endpoint);

    let t2 = t0 + Duration::from_secs(12);
    exchange(&d, other, 7778, t2);
    let moved = d.tick(t2).await.game.unwrap();
    assert_eq!(moved.target.endpoint, "203.0.113.50:7778".parse().unwrap());
    assert_eq!(moved.target.region.as_deref(), Some("eu-west-1"));
    assert!(moved.target.is_session_service);
    assert!(moved.generation > first.generation);
    assert_eq!(moved.latency.state, "measuring");
}

/// One enumeration pass that misses the game's sockets does not move the
/// game pin; it clears only once its flow has been quiet for over 10s.
#[tokio::test]
async fn test_game_pin_survives_empty_enumeration() {
    let table = SocketTable::default();
    table.set(vec![udp_bound(50000)]);
    let mut d = discovery(&table);

    let t0 = Instant::now();
    exchange(&d, SERVER, 7777, t0);
    let first = d.tick(t0).await.game.unwrap();

    table.set(Vec::new());
    let kept = d.tick(t0 + Duration::from_secs(2)).await.game.expect("game kept");
    assert_eq!(kept.target.endpoint, first.target.endpoint);
    assert_eq!(kept.generation, first.generation);

    table.set(vec![udp_bound(50000)]);
    exchange(&d, SERVER, 7777, t0 + Duration::from_secs(4));
    let again = d.tick(t0 + Duration::from_secs(4)).await.game.unwrap();
    assert_eq!(again.generation, first.generation);

    table.set(Vec::new());
    assert!(d.tick(t0 + Duration::from_secs(14)).await.game.is_some());
    assert!(d.tick(t0 + Duration::from_secs(15)).await.game.is_none());
}

/// Same for the lobby: a missed pass keeps the pin and its generation, and
/// it clears only after more than 10s without the connection.
#[tokio::test]
async fn test_lobby_pin_survives_empty_enumeration() {
    let table = SocketTable::default();
    table.set(vec![tcp_established(50003, "203.0.113.9:443")]);
    let mut d = discovery(&table);

    let t0 = Instant::now();
    let first = d.tick(t0).await.lobby.unwrap();

    table.set(Vec::new());
    let kept = d.tick(t0 + Duration::from_secs(2)).await.lobby.expect("lobby kept");
    assert_eq!(kept.target.endpoint, first.target.endpoint);
    assert_eq!(kept.generation, first.generation);
    assert!(kept.stale);

    table.set(vec![tcp_established(50003, "203.0.113.9:443")]);
    let again = d.tick(t0 + Duration::from_secs(4)).await.lobby.unwrap();
    assert_eq!(again.generation, first.generation);
    assert!(!again.stale);
    assert_eq!(again.latency.state, "measuring");

    table.set(Vec::new());
    assert!(d.tick(t0 + Duration::from_secs(14)).await.lobby.is_some());
    assert!(d.tick(t0 + Duration::from_secs(15)).await.lobby.is_none());
}

/// Established TCP to the provider is the lobby; the session service wins.
#[tokio::test]
async fn test_lobby_selection_with_failing_primary_source() {
    let table = SocketTable::default();
    table.set(vec![
        tcp_established(50001, "104.16.0.10:443"),
        tcp_established(50002, "198.51.100.9:443"),
        tcp_established(50003, "203.0.113.9:443"),
        tcp_established(50004, "8.8.8.8:443"),
    ]);
    let mut d = discovery_with(vec![Box::new(BrokenSource), Box::new(table.clone())], true);

    let snap = d.tick(Instant::now()).await;
    let lobby = snap.lobby.expect("lobby pinned");
    assert_eq!(lobby.target.endpoint, "203.0.113.9:443".parse().unwrap());
    assert!(lobby.target.is_session_service);
    assert_eq!(lobby.target.descriptor, "AWS GAMELIFT Europe (Ireland)");
    assert_eq!(lobby.probe_host, ProbeHost::Name("gamelift-ping.eu-west-1.api.aws".into()));
    assert!(snap.game.is_none());
}

/// Every source failing yields an empty pass, not an error.
#[tokio::test]
async fn test_all_sources_failing() {
    let mut d = discovery_with(vec![Box::new(BrokenSource)], true);
    let snap = d.tick(Instant::now()).await;
    assert!(snap.lobby.is_none());
    assert!(snap.game.is_none());
}

/// Sockets with no known owner follow the configured policy.
#[tokio::test]
async fn test_unknown_owner_policy() {
    let table = SocketTable::default();
    let mut record = tcp_established(50001, "203.0.113.9:443");
    record.pid = None;
    table.set(vec![record]);

    let mut lenient = discovery_with(vec![Box::new(table.clone())], true);
    assert!(lenient.tick(Instant::now()).await.lobby.is_some());

    let mut strict = discovery_with(vec![Box::new(table.clone())], false);
    assert!(strict.tick(Instant::now()).await.lobby.is_none());
}

/// The snapshot serializes to the shape the status endpoint serves.
#[tokio::test]
async fn test_snapshot_json() {
    let table = SocketTable::default();
    table.set(vec![udp_bound(50000), tcp_established(50001, "203.0.113.9:443")]);
    let mut d = discovery(&table);
    let t0 = Instant::now();
    exchange(&d, SERVER, 7777, t0);

    let snap = d.tick(t0).await;
    let json = serde_json::to_value(&snap).unwrap();

    assert_eq!(json["game"]["role"], "game");
    assert_eq!(json["game"]["region"], "eu-test-1");
    assert_eq!(json["game"]["latency"]["state"], "measuring");
    assert_eq!(json["lobby"]["probe_host"]["kind"], "name");
    assert_eq!(json["lobby"]["probe_host"]["value"], "gamelift-ping.eu-west-1.api.aws");
    assert_eq!(json["capture"]["mode"]["mode"], "disabled");
    assert_eq!(json["capture"]["flows"], 1);
}
