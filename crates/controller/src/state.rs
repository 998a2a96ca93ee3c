use serde::Serialize;
use std::collections::VecDeque;
use time::OffsetDateTime;

use crate::relay::RelayBank;
use crate::schedule::ZoneSchedule;
use crate::supervisor::Mode;
use crate::timers::TimerSet;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Everything the control core mutates. Owned by `Controller` behind a single
/// lock; nothing else holds a reference to the relays.
pub struct ControllerState {
    pub(crate) relays: Box<dyn RelayBank>,
    pub(crate) schedules: Vec<ZoneSchedule>,
    pub(crate) timers: TimerSet,
    pub(crate) rain_delay: u32,
    pub(crate) last_rollover: Option<time::Date>,
    pub(crate) last_changed: Vec<Option<OffsetDateTime>>,
    pub(crate) events: VecDeque<SystemEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Relay,
    Schedule,
    Timer,
    RainDelay,
    Suppressed,
    Link,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ZoneStatus {
    pub zone: usize,
    pub on: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_changed: Option<OffsetDateTime>,
    pub timer_remaining_secs: Option<u64>,
    pub schedule: ZoneSchedule,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mode: Mode,
    pub rain_delay_days: u32,
    pub zones: Vec<ZoneStatus>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl ControllerState {
    pub fn new(
        mut relays: Box<dyn RelayBank>,
        schedules: Vec<ZoneSchedule>,
        rain_delay: u32,
        last_rollover: Option<time::Date>,
    ) -> Self {
        relays.all_off();
        let zones = relays.len();
        Self {
            relays,
            schedules,
            timers: TimerSet::new(),
            rain_delay,
            last_rollover,
            last_changed: vec![None; zones],
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn relay_states(&self) -> Vec<bool> {
        (0..self.relays.len()).map(|z| self.relays.get_zone(z)).collect()
    }

    /// Record a relay state change.
    pub fn record_relay(&mut self, zone: usize, on: bool, origin: &str) {
        if let Some(ts) = self.last_changed.get_mut(zone) {
            *ts = Some(OffsetDateTime::now_utc());
        }
        let state_str = if on { "ON" } else { "OFF" };
        self.push_event(
            EventKind::Relay,
            format!("zone {zone} set {state_str} ({origin})"),
        );
    }

    pub fn record(&mut self, kind: EventKind, detail: String) {
        self.push_event(kind, detail);
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    #[cfg(test)]
    pub fn events_of(&self, kind: EventKind) -> impl Iterator<Item = &SystemEvent> {
        self.events.iter().filter(move |e| e.kind == kind)
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
