//! Per-role target pinning.
//!
//! Discovery produces a fresh candidate list every tick, and candidates come
//! and go (a quiet second of UDP, a socket table read that raced a
//! reconnect). The tracker keeps one pinned target per role and only moves
//! it when the evidence says so:
//!
//!   pinned endpoint among candidates      → keep
//!   other candidates                      → adopt the first, new generation
//!   no candidates, source says pin alive  → keep, marked stale
//!   no candidates, pin gone               → clear
//!
//! Pure state; the caller supplies the clock and does the logging.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use regionscope_core::{ClassifiedTarget, Role};

use crate::latency::ProbeHost;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinnedTarget {
    pub target: ClassifiedTarget,
    pub probe_host: ProbeHost,
    pub pinned_at: Instant,
    pub last_confirmed: Instant,
    pub stale: bool,
    /// Bumped on every adoption; latency samples carry it.
    pub generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinChange {
    /// Same endpoint confirmed.
    Kept,
    /// Nothing was pinned; now something is.
    Adopted,
    Replaced { previous: SocketAddr },
    /// No candidates, but the pinned flow/socket is still alive.
    RetainedStale,
    Cleared { previous: SocketAddr },
    /// Nothing pinned before or after.
    Empty,
}

impl PinChange {
    /// True when the prober must be pointed somewhere new.
    pub fn is_new_target(&self) -> bool {
        matches!(self, PinChange::Adopted | PinChange::Replaced { .. } | PinChange::Cleared { .. })
    }
}

pub struct TargetTracker {
    pins: HashMap<Role, PinnedTarget>,
    next_generation: u64,
    use_ping_hosts: bool,
}

impl TargetTracker {
    pub fn new(use_ping_hosts: bool) -> Self {
        Self {
            pins: HashMap::new(),
            next_generation: 1,
            use_ping_hosts,
        }
    }

    pub fn pinned(&self, role: Role) -> Option<&PinnedTarget> {
        self.pins.get(&role)
    }

    /// Apply one tick of evidence for `role`. `candidates` must already be
    /// ranked best-first.
    pub fn update(
        &mut self,
        role: Role,
        candidates: &[ClassifiedTarget],
        pinned_alive: bool,
        now: Instant,
    ) -> PinChange {
        if let Some(pin) = self.pins.get_mut(&role) {
            if let Some(fresh) = candidates.iter().find(|c| c.endpoint == pin.target.endpoint) {
                pin.target = fresh.clone();
                pin.last_confirmed = now;
                pin.stale = false;
                return PinChange::Kept;
            }
        }

        if let Some(first) = candidates.first() {
            let previous = self.pins.get(&role).map(|p| p.target.endpoint);
            let generation = self.next_generation;
            self.next_generation += 1;
            self.pins.insert(
                role,
                PinnedTarget {
                    target: first.clone(),
                    probe_host: ProbeHost::for_target(first, self.use_ping_hosts),
                    pinned_at: now,
                    last_confirmed: now,
                    stale: false,
                    generation,
                },
            );
            return match previous {
                Some(previous) => PinChange::Replaced { previous },
                None => PinChange::Adopted,
            };
        }

        match self.pins.get_mut(&role) {
            Some(pin) if pinned_alive => {
                pin.stale = true;
                PinChange::RetainedStale
            }
            Some(_) => {
                let previous = self.pins.remove(&role).map(|p| p.target.endpoint);
                match previous {
                    Some(previous) => PinChange::Cleared { previous },
                    None => PinChange::Empty,
                }
            }
            None => PinChange::Empty,
        }
    }

    pub fn clear(&mut self) {
        self.pins.clear();
    }
}
