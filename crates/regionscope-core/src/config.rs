//! Configuration system for regionscope.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $REGIONSCOPE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/regionscope/config.toml
//!   3. ~/.config/regionscope/config.toml

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::types::{
    DISCOVERY_INTERVAL, LIVENESS_WINDOW, PROBE_INTERVAL, PROBE_TIMEOUT, REGION_SWEEP_INTERVAL,
};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionScopeConfig {
    pub target: TargetConfig,
    pub discovery: DiscoveryConfig,
    pub registry: RegistryConfig,
    pub capture: CaptureConfig,
    pub probe: ProbeConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// Process name of the game client. Matched case-insensitively,
    /// with or without a trailing `.exe`.
    pub process_name: String,
    /// Registry service tag that marks the game's session service.
    pub session_service: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LobbyPriority {
    /// Session-service endpoints, then port 443 on a cloud address,
    /// then any cloud address, then enumeration order.
    SecurePortFirst,
    /// First established connection in enumeration order.
    FirstEstablished,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Discovery tick in milliseconds. Clamped to 2000..=5000.
    pub interval_ms: u64,
    /// Keep sockets whose owner could not be determined when filtering by pid.
    pub include_unknown_owner: bool,
    pub lobby_priority: LobbyPriority,
    /// Remote ports that are never game or lobby traffic.
    pub excluded_ports: Vec<u16>,
    /// Public DNS resolvers. Traffic to these is never a game server.
    pub excluded_resolvers: Vec<IpAddr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub url: String,
    pub cache_path: PathBuf,
    /// Data older than this is refreshed.
    pub ttl_secs: u64,
    pub fetch_timeout_secs: u64,
    /// How long to run on the built-in table before trying the network again.
    pub fallback_retry_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub enabled: bool,
    /// Network interface name. Empty = auto-detect.
    pub interface: String,
    pub promiscuous: bool,
    pub read_timeout_ms: u64,
    pub buffer_bytes: usize,
    /// Flows quiet for longer than this are ignored.
    pub liveness_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub timeout_ms: u64,
    /// Probe the region's documented ping host instead of the raw address.
    pub use_ping_hosts: bool,
    /// Upper bounds (exclusive) of the good / marginal / poor buckets.
    pub good_ms: u64,
    pub marginal_ms: u64,
    pub poor_ms: u64,
    /// Ping every known region's probe host, independent of any pin.
    pub sweep_enabled: bool,
    pub sweep_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    /// Status endpoint port on 127.0.0.1.
    pub port: u16,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for RegionScopeConfig {
    fn default() -> Self {
        Self {
            target: TargetConfig::default(),
            discovery: DiscoveryConfig::default(),
            registry: RegistryConfig::default(),
            capture: CaptureConfig::default(),
            probe: ProbeConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            process_name: "DeadByDaylight-Win64-Shipping".to_string(),
            session_service: "GAMELIFT".to_string(),
        }
    }
}

pub const DEFAULT_EXCLUDED_PORTS: &[u16] = &[
    21, 22, 25, 53, 80, 110, 143, 465, 587, 993, 995, 1433, 3306, 5432, 6379, 9200, 9300, 11211,
    27017,
];

pub const DEFAULT_EXCLUDED_RESOLVERS: &[&str] = &[
    "1.1.1.1",
    "1.0.0.1",
    "8.8.8.8",
    "8.8.4.4",
    "9.9.9.9",
    "149.112.112.112",
    "208.67.222.222",
    "208.67.220.220",
    "2606:4700:4700::1111",
    "2606:4700:4700::1001",
    "2001:4860:4860::8888",
    "2001:4860:4860::8844",
];

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            interval_ms: DISCOVERY_INTERVAL.as_millis() as u64,
            include_unknown_owner: true,
            lobby_priority: LobbyPriority::SecurePortFirst,
            excluded_ports: DEFAULT_EXCLUDED_PORTS.to_vec(),
            excluded_resolvers: DEFAULT_EXCLUDED_RESOLVERS
                .iter()
                .filter_map(|s| s.parse().ok())
                .collect(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            url: "https://ip-ranges.amazonaws.com/ip-ranges.json".to_string(),
            cache_path: data_dir().join("aws-ip-ranges.json"),
            ttl_secs: 24 * 60 * 60,
            fetch_timeout_secs: 30,
            fallback_retry_secs: 5 * 60,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interface: String::new(),
            promiscuous: true,
            read_timeout_ms: 1000,
            buffer_bytes: 65536,
            liveness_secs: LIVENESS_WINDOW.as_secs(),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: PROBE_INTERVAL.as_millis() as u64,
            timeout_ms: PROBE_TIMEOUT.as_millis() as u64,
            use_ping_hosts: true,
            good_ms: 80,
            marginal_ms: 130,
            poor_ms: 250,
            sweep_enabled: true,
            sweep_interval_ms: REGION_SWEEP_INTERVAL.as_millis() as u64,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 9471,
        }
    }
}

// ── Derived values ────────────────────────────────────────────────────────────

impl DiscoveryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.clamp(2000, 5000))
    }
}

impl RegistryConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn fallback_retry(&self) -> Duration {
        Duration::from_secs(self.fallback_retry_secs)
    }
}

impl CaptureConfig {
    pub fn liveness(&self) -> Duration {
        Duration::from_secs(self.liveness_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl ProbeConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(100))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1000))
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

pub fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("regionscope")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("regionscope")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl RegionScopeConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            RegionScopeConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("REGIONSCOPE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&RegionScopeConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply REGIONSCOPE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        let flag = |v: String| v == "true" || v == "1";

        if let Some(v) = var("REGIONSCOPE_TARGET__PROCESS_NAME") {
            self.target.process_name = v;
        }
        if let Some(v) = var("REGIONSCOPE_DISCOVERY__INTERVAL_MS") {
            if let Ok(ms) = v.parse() {
                self.discovery.interval_ms = ms;
            }
        }
        if let Some(v) = var("REGIONSCOPE_DISCOVERY__INCLUDE_UNKNOWN_OWNER") {
            self.discovery.include_unknown_owner = flag(v);
        }
        if let Some(v) = var("REGIONSCOPE_DISCOVERY__LOBBY_PRIORITY") {
            match v.as_str() {
                "secure_port_first" => self.discovery.lobby_priority = LobbyPriority::SecurePortFirst,
                "first_established" => self.discovery.lobby_priority = LobbyPriority::FirstEstablished,
                _ => {}
            }
        }
        if let Some(v) = var("REGIONSCOPE_REGISTRY__URL") {
            self.registry.url = v;
        }
        if let Some(v) = var("REGIONSCOPE_REGISTRY__CACHE_PATH") {
            self.registry.cache_path = PathBuf::from(v);
        }
        if let Some(v) = var("REGIONSCOPE_CAPTURE__ENABLED") {
            self.capture.enabled = flag(v);
        }
        if let Some(v) = var("REGIONSCOPE_CAPTURE__INTERFACE") {
            self.capture.interface = v;
        }
        if let Some(v) = var("REGIONSCOPE_PROBE__ENABLED") {
            self.probe.enabled = flag(v);
        }
        if let Some(v) = var("REGIONSCOPE_PROBE__USE_PING_HOSTS") {
            self.probe.use_ping_hosts = flag(v);
        }
        if let Some(v) = var("REGIONSCOPE_PROBE__SWEEP_ENABLED") {
            self.probe.sweep_enabled = flag(v);
        }
        if let Some(v) = var("REGIONSCOPE_API__PORT") {
            if let Ok(p) = v.parse() {
                self.api.port = p;
            }
        }
    }
}
