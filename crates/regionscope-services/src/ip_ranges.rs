//! Cloud provider IP range registry.
//!
//! Holds the provider's published prefix list and answers "is this address
//! the provider's, and in which region / under which service tag?".
//!
//! Data is loaded lazily on the first query and refreshed once it is older
//! than the TTL. Every refresh walks the same chain:
//!
//!   1. disk cache, if its mtime is younger than the TTL
//!   2. remote feed (written back to the disk cache on success)
//!   3. stale disk cache
//!   4. built-in table of well-known blocks
//!
//! Steps 3 and 4 are retried after a short back-off rather than on every
//! query. Refreshes are single-flight: concurrent callers wait on one
//! mutex, and a waiter that finds the data already fresh returns without
//! touching the network.

use std::future::Future;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use regionscope_core::config::RegistryConfig;
use regionscope_core::Cidr;

/// Generic provider-wide tag. A more specific tag on an overlapping prefix
/// takes precedence over it.
pub const GENERIC_SERVICE: &str = "AMAZON";

/// Built-in blocks used when neither the cache nor the network is available.
const BUILT_IN_RANGES: &[(&str, &str)] = &[
    ("52.0.0.0/8", "us-east-1"),
    ("54.0.0.0/8", "eu-west-1"),
    ("18.0.0.0/8", "us-east-1"),
    ("3.0.0.0/8", "us-east-1"),
    ("13.0.0.0/8", "us-east-1"),
    ("15.0.0.0/8", "us-east-1"),
    ("35.0.0.0/8", "us-east-1"),
    ("44.0.0.0/8", "us-east-1"),
];
const BUILT_IN_SERVICE: &str = "EC2";

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("transport: {0}")]
    Transport(String),
    #[error("cache io: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed feed: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("feed contained no usable prefixes")]
    Empty,
}

// ── Injected transport and clock ──────────────────────────────────────────────

pub type FetchFuture<'a> = Pin<Box<dyn Future<Output = Result<String, RegistryError>> + Send + 'a>>;

/// Retrieves the raw feed document.
pub trait RangeFetcher: Send + Sync {
    fn fetch(&self) -> FetchFuture<'_>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Fetches the feed over HTTPS.
pub struct HttpFetcher {
    client: reqwest::Client,
    url: String,
}

impl HttpFetcher {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, RegistryError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl RangeFetcher for HttpFetcher {
    fn fetch(&self) -> FetchFuture<'_> {
        Box::pin(async move {
            let body = self
                .client
                .get(&self.url)
                .send()
                .await?
                .error_for_status()?
                .text()
                .await?;
            Ok(body)
        })
    }
}

// ── Data ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeSource {
    /// Nothing loaded yet.
    Unloaded,
    Remote,
    DiskCache,
    /// Disk cache past its TTL, used because the remote fetch failed.
    StaleCache,
    BuiltIn,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeEntry {
    pub cidr: Cidr,
    pub region: String,
    pub service: String,
    pub network_border_group: Option<String>,
}

/// Result of a registry lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RangeMatch {
    pub prefix: String,
    pub region: String,
    pub service: String,
}

#[derive(Debug)]
struct RangeSet {
    entries: Vec<RangeEntry>,
    source: RangeSource,
    fetched_at: SystemTime,
    /// Set for degraded sources; the chain is retried at this time.
    retry_at: Option<SystemTime>,
}

impl RangeSet {
    fn unloaded() -> Self {
        Self {
            entries: Vec::new(),
            source: RangeSource::Unloaded,
            fetched_at: SystemTime::UNIX_EPOCH,
            retry_at: None,
        }
    }

    fn is_fresh(&self, now: SystemTime, ttl: Duration) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        match self.retry_at {
            Some(at) => now < at,
            None => age(now, self.fetched_at) < ttl,
        }
    }

    /// First specific match wins; the generic tag only answers when nothing
    /// more specific covers the address.
    fn lookup(&self, ip: IpAddr) -> Option<&RangeEntry> {
        let mut generic = None;
        for entry in self.entries.iter().filter(|e| e.cidr.contains(ip)) {
            if entry.service != GENERIC_SERVICE {
                return Some(entry);
            }
            generic.get_or_insert(entry);
        }
        generic
    }
}

/// Snapshot for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStatus {
    pub source: RangeSource,
    pub entries: usize,
    pub age_secs: Option<u64>,
}

// ── Feed format ───────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct Feed {
    #[serde(default)]
    prefixes: Vec<FeedPrefix>,
    #[serde(default)]
    ipv6_prefixes: Vec<FeedPrefix>,
}

#[derive(Deserialize)]
struct FeedPrefix {
    #[serde(alias = "ipv6_prefix")]
    ip_prefix: String,
    #[serde(default)]
    region: String,
    #[serde(default)]
    service: String,
    #[serde(default)]
    network_border_group: Option<String>,
}

/// Parse the provider feed. Malformed prefixes are skipped; a document with
/// no usable prefix at all is an error.
pub fn parse_feed(text: &str) -> Result<Vec<RangeEntry>, RegistryError> {
    let feed: Feed = serde_json::from_str(text)?;
    let mut skipped = 0usize;
    let entries: Vec<RangeEntry> = feed
        .prefixes
        .into_iter()
        .chain(feed.ipv6_prefixes)
        .filter_map(|p| match Cidr::parse(&p.ip_prefix) {
            Some(cidr) => Some(RangeEntry {
                cidr,
                region: p.region,
                service: p.service,
                network_border_group: p.network_border_group,
            }),
            None => {
                tracing::debug!(prefix = %p.ip_prefix, "skipping malformed prefix");
                skipped += 1;
                None
            }
        })
        .collect();

    if skipped > 0 {
        tracing::debug!(skipped, kept = entries.len(), "feed contained malformed prefixes");
    }
    if entries.is_empty() {
        return Err(RegistryError::Empty);
    }
    Ok(entries)
}

fn built_in_entries() -> Vec<RangeEntry> {
    BUILT_IN_RANGES
        .iter()
        .filter_map(|(prefix, region)| {
            Some(RangeEntry {
                cidr: Cidr::parse(prefix)?,
                region: region.to_string(),
                service: BUILT_IN_SERVICE.to_string(),
                network_border_group: None,
            })
        })
        .collect()
}

fn age(now: SystemTime, then: SystemTime) -> Duration {
    now.duration_since(then).unwrap_or(Duration::ZERO)
}

// ── Registry ──────────────────────────────────────────────────────────────────

pub struct RegistrySettings {
    /// `None` disables the disk cache.
    pub cache_path: Option<PathBuf>,
    pub ttl: Duration,
    pub fallback_retry: Duration,
}

impl From<&RegistryConfig> for RegistrySettings {
    fn from(config: &RegistryConfig) -> Self {
        Self {
            cache_path: Some(config.cache_path.clone()),
            ttl: config.ttl(),
            fallback_retry: config.fallback_retry(),
        }
    }
}

pub struct IpRangeRegistry {
    fetcher: Box<dyn RangeFetcher>,
    clock: Box<dyn Clock>,
    settings: RegistrySettings,
    data: RwLock<Arc<RangeSet>>,
    refresh_lock: Mutex<()>,
}

impl IpRangeRegistry {
    pub fn new(
        fetcher: impl RangeFetcher + 'static,
        clock: impl Clock + 'static,
        settings: RegistrySettings,
    ) -> Self {
        Self {
            fetcher: Box::new(fetcher),
            clock: Box::new(clock),
            settings,
            data: RwLock::new(Arc::new(RangeSet::unloaded())),
            refresh_lock: Mutex::new(()),
        }
    }

    /// Registry backed by the real network, disk and clock.
    pub fn from_config(config: &RegistryConfig) -> Result<Self, RegistryError> {
        let fetcher = HttpFetcher::new(config.url.clone(), config.fetch_timeout())?;
        Ok(Self::new(fetcher, SystemClock, RegistrySettings::from(config)))
    }

    pub async fn is_member(&self, ip: IpAddr) -> bool {
        self.lookup(ip).await.is_some()
    }

    pub async fn region_of(&self, ip: IpAddr) -> Option<String> {
        self.lookup(ip).await.map(|m| m.region)
    }

    pub async fn service_of(&self, ip: IpAddr) -> Option<String> {
        self.lookup(ip).await.map(|m| m.service)
    }

    /// Region and service in one pass.
    pub async fn lookup(&self, ip: IpAddr) -> Option<RangeMatch> {
        let set = self.ensure_fresh().await;
        set.lookup(ip).map(|e| RangeMatch {
            prefix: e.cidr.to_string(),
            region: e.region.clone(),
            service: e.service.clone(),
        })
    }

    /// Force a refresh, bypassing freshness checks.
    pub async fn refresh(&self) -> RangeSource {
        let _guard = self.refresh_lock.lock().await;
        let set = Arc::new(self.load(true).await);
        let source = set.source;
        *self.data.write().await = set;
        source
    }

    pub async fn source(&self) -> RangeSource {
        self.data.read().await.source
    }

    pub async fn len(&self) -> usize {
        self.data.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Current state without triggering a load.
    pub async fn status(&self) -> RegistryStatus {
        let set = self.data.read().await.clone();
        RegistryStatus {
            source: set.source,
            entries: set.entries.len(),
            age_secs: (set.source != RangeSource::Unloaded)
                .then(|| age(self.clock.now(), set.fetched_at).as_secs()),
        }
    }

    async fn ensure_fresh(&self) -> Arc<RangeSet> {
        {
            let set = self.data.read().await;
            if set.is_fresh(self.clock.now(), self.settings.ttl) {
                return set.clone();
            }
        }

        let _guard = self.refresh_lock.lock().await;

        // Another caller may have refreshed while we waited.
        {
            let set = self.data.read().await;
            if set.is_fresh(self.clock.now(), self.settings.ttl) {
                return set.clone();
            }
        }

        let set = Arc::new(self.load(false).await);
        *self.data.write().await = set.clone();
        set
    }

    async fn load(&self, force: bool) -> RangeSet {
        let now = self.clock.now();
        let cache = match &self.settings.cache_path {
            Some(path) => read_cache(path).await,
            None => None,
        };

        if !force {
            if let Some((entries, mtime)) = &cache {
                if age(now, *mtime) < self.settings.ttl {
                    tracing::debug!(entries = entries.len(), "ip ranges loaded from disk cache");
                    return RangeSet {
                        entries: entries.clone(),
                        source: RangeSource::DiskCache,
                        fetched_at: *mtime,
                        retry_at: None,
                    };
                }
            }
        }

        match self.fetch_remote().await {
            Ok(entries) => {
                tracing::info!(entries = entries.len(), "ip ranges fetched");
                return RangeSet {
                    entries,
                    source: RangeSource::Remote,
                    fetched_at: now,
                    retry_at: None,
                };
            }
            Err(e) => tracing::warn!(error = %e, "ip range fetch failed"),
        }

        let retry_at = Some(now + self.settings.fallback_retry);
        if let Some((entries, mtime)) = cache {
            tracing::info!(entries = entries.len(), "using stale ip range cache");
            return RangeSet {
                entries,
                source: RangeSource::StaleCache,
                fetched_at: mtime,
                retry_at,
            };
        }

        tracing::warn!("using built-in ip ranges");
        RangeSet {
            entries: built_in_entries(),
            source: RangeSource::BuiltIn,
            fetched_at: now,
            retry_at,
        }
    }

    async fn fetch_remote(&self) -> Result<Vec<RangeEntry>, RegistryError> {
        let text = self.fetcher.fetch().await?;
        let entries = parse_feed(&text)?;
        if let Some(path) = &self.settings.cache_path {
            if let Err(e) = write_cache(path, &text).await {
                tracing::warn!(error = %e, path = %path.display(), "failed to write ip range cache");
            }
        }
        Ok(entries)
    }
}

// ── Disk cache ────────────────────────────────────────────────────────────────

/// Read and parse the cache. Missing, unreadable or corrupt = `None`.
async fn read_cache(path: &Path) -> Option<(Vec<RangeEntry>, SystemTime)> {
    let mtime = tokio::fs::metadata(path).await.ok()?.modified().ok()?;
    let text = tokio::fs::read_to_string(path).await.ok()?;
    match parse_feed(&text) {
        Ok(entries) => Some((entries, mtime)),
        Err(e) => {
            tracing::debug!(error = %e, path = %path.display(), "ignoring corrupt ip range cache");
            None
        }
    }
}

/// Atomic write: tmp file → rename.
async fn write_cache(path: &Path, text: &str) -> Result<(), RegistryError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp_path = path.with_extension("tmp");
    tokio::fs::write(&tmp_path, text).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    tracing::trace!(path = %path.display(), "ip range cache written");
    Ok(())
}
