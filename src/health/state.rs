//! Backend health flags and snapshot bookkeeping.
//!
//! # States
//! - Up: backend answered its probe and may receive traffic
//! - Down: backend failed its probe
//!
//! # State Transitions
//! ```text
//! Up → Down: one failed probe round
//! Down → Up: one successful probe round
//! ```
//!
//! # Design Decisions
//! - No hysteresis: the scheduler already absorbs dial failures between rounds
//! - State changes logged for observability

use std::collections::{HashMap, HashSet};

/// Probe verdict for one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthFlag {
    Up,
    Down,
}

impl HealthFlag {
    pub fn is_up(self) -> bool {
        self == HealthFlag::Up
    }
}

/// Healthy backends at one point in time, keyed by address.
pub type HealthSnapshot = HashMap<String, HealthFlag>;

/// Remembers the previous round to log up/down transitions.
#[derive(Debug, Default)]
pub struct HealthState {
    up: HashSet<String>,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a round of results and log every change.
    ///
    /// Returns the snapshot of backends that are up.
    pub fn observe(&mut self, results: impl IntoIterator<Item = (String, HealthFlag)>) -> HealthSnapshot {
        let mut snapshot = HealthSnapshot::new();
        let mut up = HashSet::new();

        for (addr, flag) in results {
            if flag.is_up() {
                if !self.up.contains(&addr) {
                    tracing::info!(backend = %addr, "Backend is up");
                }
                up.insert(addr.clone());
                snapshot.insert(addr, flag);
            } else if self.up.contains(&addr) {
                tracing::warn!(backend = %addr, "Backend is down");
            }
        }

        self.up = up;
        snapshot
    }

    pub fn up_count(&self) -> usize {
        self.up.len()
    }
}
