//! Ephemeral countdown overrides (zone -> end instant). Never persisted; a
//! restart starts with an empty set.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Default)]
pub struct TimerSet {
    ends: BTreeMap<usize, Instant>,
}

impl TimerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace the override for `zone`.
    pub fn insert(&mut self, zone: usize, end: Instant) -> Option<Instant> {
        self.ends.insert(zone, end)
    }

    pub fn remove(&mut self, zone: usize) -> bool {
        self.ends.remove(&zone).is_some()
    }

    #[cfg(test)]
    pub fn contains(&self, zone: usize) -> bool {
        self.ends.contains_key(&zone)
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.ends.is_empty()
    }

    /// Remove and return every zone whose end instant is at or before `now`.
    pub fn take_expired(&mut self, now: Instant) -> Vec<usize> {
        let expired: Vec<usize> = self
            .ends
            .iter()
            .filter(|(_, end)| **end <= now)
            .map(|(zone, _)| *zone)
            .collect();
        for zone in &expired {
            self.ends.remove(zone);
        }
        expired
    }

    /// (zone, time left) for every active override, in zone order.
    pub fn remaining(&self, now: Instant) -> Vec<(usize, Duration)> {
        self.ends
            .iter()
            .map(|(zone, end)| (*zone, end.saturating_duration_since(now)))
            .collect()
    }
}
