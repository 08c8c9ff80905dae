//! UDP flow table, shared between the capture thread and discovery.
//!
//! The capture thread calls [`FlowTable::observe`] for every in-scope
//! datagram; discovery reads [`FlowTable::active_flow`] each tick. Entries
//! quieter than the liveness window are ignored by readers and swept by
//! [`FlowTable::expire`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use regionscope_core::types::LIVENESS_WINDOW;
use regionscope_core::{Direction, FlowKey, FlowSnapshot, FlowStats};

#[derive(Clone)]
pub struct FlowTable {
    flows: Arc<DashMap<FlowKey, FlowStats>>,
    liveness: Duration,
}

impl Default for FlowTable {
    fn default() -> Self {
        Self::new(LIVENESS_WINDOW)
    }
}

impl FlowTable {
    pub fn new(liveness: Duration) -> Self {
        Self {
            flows: Arc::new(DashMap::new()),
            liveness,
        }
    }

    pub fn liveness(&self) -> Duration {
        self.liveness
    }

    /// Count one datagram. Returns true if this is the first sighting of the flow.
    pub fn observe(&self, key: FlowKey, direction: Direction, payload_len: usize, now: Instant) -> bool {
        let mut first = false;
        self.flows
            .entry(key)
            .or_insert_with(|| {
                first = true;
                FlowStats::new(now)
            })
            .record(direction, payload_len, now);
        first
    }

    /// Flow with the most packets among live flows; ties go to more bytes.
    pub fn active_flow(&self, now: Instant) -> Option<FlowSnapshot> {
        self.flows
            .iter()
            .filter(|e| e.value().is_live(now, self.liveness))
            .max_by_key(|e| (e.value().packets, e.value().total_bytes()))
            .map(|e| FlowSnapshot {
                key: *e.key(),
                stats: *e.value(),
            })
    }

    /// All live flows, busiest first.
    pub fn live_flows(&self, now: Instant) -> Vec<FlowSnapshot> {
        let mut flows: Vec<FlowSnapshot> = self
            .flows
            .iter()
            .filter(|e| e.value().is_live(now, self.liveness))
            .map(|e| FlowSnapshot {
                key: *e.key(),
                stats: *e.value(),
            })
            .collect();
        flows.sort_by(|a, b| {
            (b.stats.packets, b.stats.total_bytes()).cmp(&(a.stats.packets, a.stats.total_bytes()))
        });
        flows
    }

    /// Is the flow to this remote endpoint still live?
    pub fn is_live(&self, key: &FlowKey, now: Instant) -> bool {
        self.flows
            .get(key)
            .is_some_and(|s| s.is_live(now, self.liveness))
    }

    /// Is any flow to `endpoint` still live, whichever local port it uses?
    pub fn is_endpoint_live(&self, endpoint: std::net::SocketAddr, now: Instant) -> bool {
        self.flows.iter().any(|e| {
            e.key().remote_endpoint() == endpoint && e.value().is_live(now, self.liveness)
        })
    }

    /// Drop flows whose local port is no longer in scope.
    pub fn prune_scope(&self, scope: &HashSet<u16>) {
        let before = self.flows.len();
        self.flows.retain(|key, _| scope.contains(&key.local_port));
        let removed = before - self.flows.len();
        if removed > 0 {
            tracing::debug!(removed, "pruned out-of-scope flows");
        }
    }

    /// Drop flows that are past the liveness window.
    pub fn expire(&self, now: Instant) {
        let before = self.flows.len();
        self.flows.retain(|_, stats| stats.is_live(now, self.liveness));
        let removed = before - self.flows.len();
        if removed > 0 {
            tracing::debug!(removed, "expired idle flows");
        }
    }

    pub fn clear(&self) {
        self.flows.clear();
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}
