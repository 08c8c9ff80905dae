//! regionscope-ctl: command-line client for the regionscoped status endpoint.

use anyhow::{Context, Result};
use serde::Deserialize;

const DEFAULT_PORT: u16 = 9471;

// ── Response types ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct StatusResponse {
    process: String,
    pids:    Vec<u32>,
    tick:    u64,
    lobby:   Option<TargetInfo>,
    game:    Option<TargetInfo>,
    capture: CaptureInfo,
}

#[derive(Deserialize)]
struct TargetInfo {
    endpoint:           String,
    descriptor:         String,
    region:             Option<String>,
    is_session_service: bool,
    probe_host:         ProbeHostInfo,
    pinned_secs:        u64,
    stale:              bool,
    latency:            LatencyInfo,
}

#[derive(Deserialize)]
struct ProbeHostInfo {
    value: serde_json::Value,
}

#[derive(Deserialize)]
struct LatencyInfo {
    state:    String,
    rtt_ms:   Option<f64>,
    severity: Option<String>,
}

#[derive(Deserialize)]
struct CaptureInfo {
    mode:  CaptureModeInfo,
    stats: Option<CaptureStatsInfo>,
    flows: usize,
}

#[derive(Deserialize)]
struct CaptureModeInfo {
    mode:   String,
    reason: Option<String>,
}

#[derive(Deserialize)]
struct CaptureStatsInfo {
    interface:      Option<String>,
    scope:          Vec<u16>,
    frames_seen:    u64,
    frames_matched: u64,
}

#[derive(Deserialize)]
struct FlowsResponse {
    flows: Vec<FlowInfo>,
}

#[derive(Deserialize)]
struct FlowInfo {
    remote:         String,
    local_port:     u16,
    packets:        u64,
    bytes_received: u64,
    bytes_sent:     u64,
    idle_secs:      u64,
}

#[derive(Deserialize)]
struct RegionsResponse {
    enabled: bool,
    regions: Vec<RegionInfo>,
}

#[derive(Deserialize)]
struct RegionInfo {
    code:    String,
    name:    String,
    stable:  bool,
    host:    Option<ProbeHostInfo>,
    latency: LatencyInfo,
}

#[derive(Deserialize)]
struct RegistryResponse {
    source:   String,
    entries:  usize,
    age_secs: Option<u64>,
}

#[derive(Deserialize)]
struct RefreshResponse {
    source:  String,
    entries: usize,
}

// ── HTTP helpers ──────────────────────────────────────────────────────────────

fn base_url(port: u16) -> String {
    format!("http://127.0.0.1:{}", port)
}

async fn get_json<T: for<'de> Deserialize<'de>>(url: &str) -> Result<T> {
    reqwest::get(url)
        .await
        .with_context(|| format!("failed to connect to regionscoped at {}, is it running?", url))?
        .json::<T>()
        .await
        .context("failed to parse response")
}

async fn post_json<T: for<'de> Deserialize<'de>>(url: &str) -> Result<T> {
    reqwest::Client::new()
        .post(url)
        .send()
        .await
        .with_context(|| format!("failed to connect to regionscoped at {}, is it running?", url))?
        .json::<T>()
        .await
        .context("failed to parse response")
}

// ── Formatting ────────────────────────────────────────────────────────────────

fn format_latency(latency: &LatencyInfo) -> String {
    match (latency.rtt_ms, &latency.severity) {
        (Some(ms), Some(severity)) => format!("{:.0} ms ({})", ms, severity.replace('_', " ")),
        _ => latency.state.clone(),
    }
}

fn format_host(host: &ProbeHostInfo) -> String {
    match &host.value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn print_target(label: &str, target: Option<&TargetInfo>) {
    let Some(t) = target else {
        println!("\n  {}: none", label);
        return;
    };
    println!("\n  {}:", label);
    println!("  ┌─ {}", t.descriptor);
    println!("  │  endpoint : {}", t.endpoint);
    println!("  │  region   : {}", t.region.as_deref().unwrap_or("-"));
    if t.is_session_service {
        println!("  │  session service");
    }
    println!("  │  probe    : {}", format_host(&t.probe_host));
    println!("  │  latency  : {}", format_latency(&t.latency));
    println!(
        "  └─ pinned   : {}s{}",
        t.pinned_secs,
        if t.stale { " (stale)" } else { "" }
    );
}

// ── Subcommand handlers ───────────────────────────────────────────────────────

async fn cmd_status(port: u16) -> Result<()> {
    let resp: StatusResponse = get_json(&format!("{}/status", base_url(port))).await?;

    println!("═══════════════════════════════════════");
    println!("  regionscope status");
    println!("═══════════════════════════════════════");
    println!("  Process  : {}", resp.process);
    if resp.pids.is_empty() {
        println!("  Pids     : not running");
    } else {
        let pids: Vec<String> = resp.pids.iter().map(u32::to_string).collect();
        println!("  Pids     : {}", pids.join(", "));
    }
    println!("  Ticks    : {}", resp.tick);

    match &resp.capture.mode.reason {
        Some(reason) => println!("  Capture  : {} ({})", resp.capture.mode.mode, reason),
        None => println!("  Capture  : {}", resp.capture.mode.mode),
    }
    if let Some(stats) = &resp.capture.stats {
        println!("  Interface: {}", stats.interface.as_deref().unwrap_or("-"));
        println!("  Ports    : {:?}", stats.scope);
        println!("  Frames   : {} seen, {} matched", stats.frames_seen, stats.frames_matched);
    }
    println!("  Flows    : {}", resp.capture.flows);

    print_target("Lobby", resp.lobby.as_ref());
    print_target("Game", resp.game.as_ref());

    Ok(())
}

async fn cmd_flows(port: u16) -> Result<()> {
    let resp: FlowsResponse = get_json(&format!("{}/flows", base_url(port))).await?;

    if resp.flows.is_empty() {
        println!("No live flows.");
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Live Flows ({})", resp.flows.len());
    println!("═══════════════════════════════════════");

    for f in &resp.flows {
        println!("  ┌─ {}", f.remote);
        println!("  │  local port : {}", f.local_port);
        println!("  │  packets    : {}", f.packets);
        println!("  │  received   : {} bytes", f.bytes_received);
        println!("  │  sent       : {} bytes", f.bytes_sent);
        println!("  └─ idle       : {}s", f.idle_secs);
    }

    Ok(())
}

fn format_region(region: &RegionInfo) -> String {
    let latency = match region.host {
        Some(_) => format_latency(&region.latency),
        None => "no probe endpoint".to_string(),
    };
    format!(
        "{:<16} {:<30} {}{}",
        region.code,
        region.name,
        latency,
        if region.stable { "" } else { "  [unstable]" }
    )
}

async fn cmd_regions(port: u16) -> Result<()> {
    let resp: RegionsResponse = get_json(&format!("{}/regions", base_url(port))).await?;

    if !resp.enabled {
        println!("Region sweep is disabled (probe.sweep_enabled = false).");
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Region Latency ({})", resp.regions.len());
    println!("═══════════════════════════════════════");
    for region in &resp.regions {
        println!("  {}", format_region(region));
    }

    Ok(())
}

async fn cmd_registry(port: u16) -> Result<()> {
    let resp: RegistryResponse = get_json(&format!("{}/registry", base_url(port))).await?;

    println!("═══════════════════════════════════════");
    println!("  IP Range Registry");
    println!("═══════════════════════════════════════");
    println!("  Source  : {}", resp.source);
    println!("  Entries : {}", resp.entries);
    match resp.age_secs {
        Some(age) => println!("  Age     : {}h {}m", age / 3600, (age % 3600) / 60),
        None => println!("  Age     : -"),
    }

    Ok(())
}

async fn cmd_registry_refresh(port: u16) -> Result<()> {
    let resp: RefreshResponse = post_json(&format!("{}/registry/refresh", base_url(port))).await?;
    println!("Registry reloaded from {} ({} entries).", resp.source, resp.entries);
    Ok(())
}

fn print_usage() {
    println!("Usage: regionscope-ctl [--port <port>] <command>");
    println!();
    println!("Commands:");
    println!("  status             Show pinned targets, latency and capture state");
    println!("  flows              List live UDP flows");
    println!("  regions            Show latency to every known region");
    println!("  registry           Show IP range registry source and age");
    println!("  registry refresh   Reload the IP range registry now");
    println!();
    println!("Options:");
    println!("  --port <port>   Status endpoint port (default: {})", DEFAULT_PORT);
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    // Parse --port option
    let mut port = DEFAULT_PORT;
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--port" {
            i += 1;
            port = args
                .get(i)
                .context("--port requires a value")?
                .parse()
                .context("--port must be a number")?;
        } else {
            remaining.push(&args[i]);
        }
        i += 1;
    }

    match remaining.as_slice() {
        ["status"] | []                => cmd_status(port).await,
        ["flows"]                      => cmd_flows(port).await,
        ["regions"]                    => cmd_regions(port).await,
        ["registry"]                   => cmd_registry(port).await,
        ["registry", "refresh"]        => cmd_registry_refresh(port).await,
        ["help"] | ["--help"] | ["-h"] => { print_usage(); Ok(()) }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            print_usage();
            std::process::exit(1);
        }
    }
}
