//! Connection classification.
//!
//! Turns a raw remote endpoint into a [`ClassifiedTarget`]:
//!
//!   1. drop records with no peer, and loopback/private/link-local peers
//!   2. drop public DNS resolvers and common infrastructure ports
//!   3. look the address up in the provider registry
//!   4. otherwise try the secondary provider tables
//!   5. build a display descriptor ("Unknown server" if nothing matched)
//!
//! Role assignment: established TCP connections to the provider are lobby
//! candidates; UDP flows and connected UDP sockets are game candidates.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use regionscope_core::config::{LobbyPriority, RegionScopeConfig};
use regionscope_core::types::SECURE_PORT;
use regionscope_core::{is_non_routable, normalize_ip, regions, ClassifiedTarget, Role, SocketRecord};

use crate::ip_ranges::IpRangeRegistry;
use crate::providers;

pub const PRIMARY_PROVIDER: &str = "AWS";
pub const UNKNOWN_SERVER: &str = "Unknown server";

#[derive(Debug, Clone)]
pub struct ClassifierSettings {
    pub excluded_ports: HashSet<u16>,
    pub excluded_resolvers: HashSet<IpAddr>,
    /// Registry service tag of the game's session service.
    pub session_service: String,
}

impl From<&RegionScopeConfig> for ClassifierSettings {
    fn from(config: &RegionScopeConfig) -> Self {
        Self {
            excluded_ports: config.discovery.excluded_ports.iter().copied().collect(),
            excluded_resolvers: config
                .discovery
                .excluded_resolvers
                .iter()
                .map(|ip| normalize_ip(*ip))
                .collect(),
            session_service: config.target.session_service.clone(),
        }
    }
}

pub struct Classifier {
    registry: Arc<IpRangeRegistry>,
    settings: ClassifierSettings,
}

impl Classifier {
    pub fn new(registry: Arc<IpRangeRegistry>, settings: ClassifierSettings) -> Self {
        Self { registry, settings }
    }

    pub fn registry(&self) -> &Arc<IpRangeRegistry> {
        &self.registry
    }

    /// Classify a socket's remote peer. `None` when the record has no peer
    /// or the peer is filtered out.
    pub async fn classify(&self, record: &SocketRecord, role: Role) -> Option<ClassifiedTarget> {
        self.classify_endpoint(record.peer()?, role).await
    }

    pub async fn classify_endpoint(&self, endpoint: SocketAddr, role: Role) -> Option<ClassifiedTarget> {
        let endpoint = SocketAddr::new(normalize_ip(endpoint.ip()), endpoint.port());
        if self.is_filtered(endpoint) {
            tracing::trace!(%endpoint, "endpoint filtered");
            return None;
        }

        if let Some(m) = self.registry.lookup(endpoint.ip()).await {
            let is_session_service = m.service.eq_ignore_ascii_case(&self.settings.session_service)
                && regions::is_operating_region(&m.region);
            let region_label = regions::display_name(&m.region)
                .map(str::to_string)
                .unwrap_or_else(|| m.region.clone());
            let descriptor = format!("{} {} {}", PRIMARY_PROVIDER, m.service, region_label);
            return Some(ClassifiedTarget {
                role,
                endpoint,
                region: Some(m.region),
                service: Some(m.service),
                provider: Some(PRIMARY_PROVIDER.to_string()),
                descriptor,
                is_cloud: true,
                is_session_service,
            });
        }

        let provider = providers::identify(endpoint.ip());
        Some(ClassifiedTarget {
            role,
            endpoint,
            region: None,
            service: None,
            provider: provider.map(str::to_string),
            descriptor: provider.unwrap_or(UNKNOWN_SERVER).to_string(),
            is_cloud: false,
            is_session_service: false,
        })
    }

    /// Steps 1 and 2: addresses and ports that are never game traffic.
    pub fn is_filtered(&self, endpoint: SocketAddr) -> bool {
        let ip = normalize_ip(endpoint.ip());
        is_non_routable(ip)
            || endpoint.port() == 0
            || self.settings.excluded_resolvers.contains(&ip)
            || self.settings.excluded_ports.contains(&endpoint.port())
    }
}

/// Order lobby candidates by the configured policy. Sorting is stable, so
/// enumeration order breaks ties.
pub fn rank_lobby(mut candidates: Vec<ClassifiedTarget>, policy: LobbyPriority) -> Vec<ClassifiedTarget> {
    if policy == LobbyPriority::SecurePortFirst {
        candidates.sort_by_key(|c| {
            if c.is_session_service {
                0
            } else if c.is_cloud && c.endpoint.port() == SECURE_PORT {
                1
            } else if c.is_cloud {
                2
            } else {
                3
            }
        });
    }
    candidates
}
