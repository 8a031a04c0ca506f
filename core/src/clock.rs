// Vector clocks — per-device monotone counters that order events without a
// global clock. Pure algebra, no I/O.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Causal relationship between two vector clocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Causality {
    /// Every component of `a` is <= `b`, at least one strictly
    Before,
    /// Every component of `b` is <= `a`, at least one strictly
    After,
    /// Identical clocks
    Equal,
    /// Neither dominates — a conflict candidate
    Concurrent,
}

/// A vector clock: `{device_id -> counter}`.
///
/// Stored as a BTreeMap so serialization is deterministic — two replicas
/// holding the same clock produce byte-identical blobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    entries: BTreeMap<String, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Counter for a device (0 if never seen)
    pub fn get(&self, device: &str) -> u64 {
        self.entries.get(device).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Devices with a non-zero counter
    pub fn devices(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|k| k.as_str())
    }

    /// Sum of all counters — first tie-breaker for concurrent clocks
    pub fn sum(&self) -> u64 {
        self.entries.values().sum()
    }

    /// Bump this device's counter by one
    pub fn increment(&mut self, device: &str) {
        *self.entries.entry(device.to_string()).or_insert(0) += 1;
    }

    /// `increment` that returns the new clock
    pub fn incremented(mut self, device: &str) -> Self {
        self.increment(device);
        self
    }

    /// Pointwise maximum over the union of device ids.
    ///
    /// This is the idempotent half of `merge`; `merge` adds the local bump
    /// on top.
    pub fn pointwise_max(a: &VectorClock, b: &VectorClock) -> VectorClock {
        let mut out = a.entries.clone();
        for (device, &counter) in &b.entries {
            let slot = out.entry(device.clone()).or_insert(0);
            if counter > *slot {
                *slot = counter;
            }
        }
        VectorClock { entries: out }
    }

    /// Merge a remote clock into the local one: pointwise max over the union,
    /// then bump the local device. Used whenever the core *observes* a remote
    /// clock. The local bump is unconditional — every observation is an event.
    pub fn merge(local: &VectorClock, remote: &VectorClock, local_device: &str) -> VectorClock {
        Self::pointwise_max(local, remote).incremented(local_device)
    }

    /// Causal comparison over the union of device ids
    pub fn compare(&self, other: &VectorClock) -> Causality {
        let mut less = false;
        let mut greater = false;

        for device in self.entries.keys().chain(other.entries.keys()) {
            let a = self.get(device);
            let b = other.get(device);
            if a < b {
                less = true;
            } else if a > b {
                greater = true;
            }
        }

        match (less, greater) {
            (false, false) => Causality::Equal,
            (true, false) => Causality::Before,
            (false, true) => Causality::After,
            (true, true) => Causality::Concurrent,
        }
    }

    /// True if every component of `self` is >= the matching component of
    /// `other`. Equal clocks dominate each other.
    pub fn dominates(&self, other: &VectorClock) -> bool {
        matches!(self.compare(other), Causality::After | Causality::Equal)
    }
}

/// Deterministic total order for *concurrent* clocks.
///
/// Tie-breakers, in order: larger clock sum, larger wall-clock timestamp,
/// larger device id (lexicographic). Both replicas evaluate the same inputs,
/// so both pick the same winner. Returns `Greater` when `a` wins.
pub fn concurrent_tiebreak(
    a: (&VectorClock, u64, &str),
    b: (&VectorClock, u64, &str),
) -> std::cmp::Ordering {
    let (a_vc, a_created_at, a_device) = a;
    let (b_vc, b_created_at, b_device) = b;

    a_vc.sum()
        .cmp(&b_vc.sum())
        .then(a_created_at.cmp(&b_created_at))
        .then(a_device.cmp(b_device))
}
