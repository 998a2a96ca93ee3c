//! The single writer of relay state.
//!
//! Every relay change, whether from an HTTP toggle, a remote MQTT command, the
//! schedule engine or an expiring timer, goes through [`Controller`]. It holds
//! the one lock around [`ControllerState`], skips no-op requests, drives the
//! relay board and then publishes the new state best-effort. Schedule and
//! rain-delay edits are persisted inside the same critical section.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::db::Db;
use crate::error::ControllerError;
use crate::mqtt::StatePublisher;
use crate::relay::RelayBank;
use crate::schedule::{parse_days, ClockTime, ZoneSchedule};
use crate::state::{ControllerState, EventKind, StatusResponse, ZoneStatus};
use crate::supervisor::Mode;

pub type SharedController = Arc<Controller>;

/// Who asked for a relay change. Logged only; never affects the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Manual,
    Remote,
    Schedule,
    Timer,
    System,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Origin::Manual => "manual",
            Origin::Remote => "remote",
            Origin::Schedule => "schedule",
            Origin::Timer => "timer",
            Origin::System => "system",
        })
    }
}

/// Limits applied to caller input.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_timer_min: u32,
    pub max_rain_delay_days: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_timer_min: 24 * 60,
            max_rain_delay_days: 365,
        }
    }
}

pub struct Controller {
    state: Mutex<ControllerState>,
    store: Db,
    publisher: Arc<dyn StatePublisher>,
    zone_count: usize,
    limits: Limits,
    started_at: Instant,
}

impl Controller {
    /// Build the controller from persisted state. Relays start OFF and the
    /// timer set starts empty regardless of what was running before.
    pub async fn open(
        relays: Box<dyn RelayBank>,
        store: Db,
        publisher: Arc<dyn StatePublisher>,
        limits: Limits,
    ) -> Self {
        let zone_count = relays.len();
        let schedules = store.load_schedules(zone_count).await;
        let rain_delay = store.load_rain_delay().await;
        let last_rollover = store.load_last_rollover().await;

        info!(
            zones = zone_count,
            enabled = schedules.iter().filter(|s| s.enabled).count(),
            rain_delay,
            "controller state loaded"
        );

        let mut st = ControllerState::new(relays, schedules, rain_delay, last_rollover);
        st.record(EventKind::System, "controller started".to_string());

        Self {
            state: Mutex::new(st),
            store,
            publisher,
            zone_count,
            limits,
            started_at: Instant::now(),
        }
    }

    pub(crate) fn store(&self) -> &Db {
        &self.store
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().await
    }

    fn check_zone(&self, zone: usize) -> Result<(), ControllerError> {
        if zone < self.zone_count {
            Ok(())
        } else {
            Err(ControllerError::InvalidZone {
                zone,
                zone_count: self.zone_count,
            })
        }
    }

    // -----------------------------------------------------------------------
    // Relay arbitration
    // -----------------------------------------------------------------------

    /// Drive `zone` to `on`. Returns `false` when the relay already had
    /// that state, in which case neither the board nor the broker is touched.
    pub async fn request_state(
        &self,
        zone: usize,
        on: bool,
        origin: Origin,
    ) -> Result<bool, ControllerError> {
        self.check_zone(zone)?;
        let mut st = self.lock().await;
        Ok(self.apply(&mut st, zone, on, origin))
    }

    /// Arbitration body; callers already hold the lock and validated `zone`.
    pub(crate) fn apply(
        &self,
        st: &mut ControllerState,
        zone: usize,
        on: bool,
        origin: Origin,
    ) -> bool {
        if st.relays.get_zone(zone) == on {
            debug!(zone, on, %origin, "relay already in requested state");
            return false;
        }

        st.relays.set_zone(zone, on);
        st.record_relay(zone, on, &origin.to_string());
        info!(zone, state = if on { "ON" } else { "OFF" }, %origin, "relay switched");

        if let Err(e) = self.publisher.publish_state(zone, on) {
            warn!(zone, "state publish failed: {e}");
            st.record_error(format!("zone {zone}: state publish failed: {e}"));
        }
        true
    }

    /// HTTP-style toggle: `state` is "on" or "off" (case-insensitive).
    pub async fn toggle_relay(&self, zone: usize, state: &str) -> Result<bool, ControllerError> {
        let on = match state.trim().to_ascii_lowercase().as_str() {
            "on" => true,
            "off" => false,
            other => {
                return Err(ControllerError::InvalidCommand(format!(
                    "unknown relay state '{other}' (use on/off)"
                )))
            }
        };
        self.request_state(zone, on, Origin::Manual).await
    }

    /// Force every zone OFF and drop all overrides.
    pub async fn all_off(&self, origin: Origin) {
        let mut st = self.lock().await;
        for zone in 0..self.zone_count {
            self.apply(&mut st, zone, false, origin);
        }
        st.timers = crate::timers::TimerSet::new();
    }

    // -----------------------------------------------------------------------
    // Countdown overrides
    // -----------------------------------------------------------------------

    /// Switch `zone` ON and schedule it OFF `minutes` after `now`.
    pub async fn start_timer(
        &self,
        zone: usize,
        minutes: u32,
        now: Instant,
        origin: Origin,
    ) -> Result<Instant, ControllerError> {
        self.check_zone(zone)?;
        if minutes == 0 || minutes > self.limits.max_timer_min {
            return Err(ControllerError::InvalidCommand(format!(
                "timer minutes must be 1..={}, got {minutes}",
                self.limits.max_timer_min
            )));
        }

        let end = now + Duration::from_secs(u64::from(minutes) * 60);
        let mut st = self.lock().await;
        self.apply(&mut st, zone, true, origin);
        st.timers.insert(zone, end);
        st.record(EventKind::Timer, format!("zone {zone}: run for {minutes} min"));
        info!(zone, minutes, %origin, "timer started");
        Ok(end)
    }

    /// Drop the override for `zone` and switch it OFF. Returns whether an
    /// override existed.
    pub async fn cancel_timer(&self, zone: usize) -> Result<bool, ControllerError> {
        self.check_zone(zone)?;
        let mut st = self.lock().await;
        let existed = st.timers.remove(zone);
        if existed {
            st.record(EventKind::Timer, format!("zone {zone}: timer cancelled"));
            info!(zone, "timer cancelled");
        }
        self.apply(&mut st, zone, false, Origin::Manual);
        Ok(existed)
    }

    // -----------------------------------------------------------------------
    // Schedule & rain delay edits
    // -----------------------------------------------------------------------

    /// Replace days/on/off for `zone`, keeping its enabled flag.
    pub async fn set_schedule<S: AsRef<str>>(
        &self,
        zone: usize,
        days: &[S],
        on_time: Option<&str>,
        off_time: Option<&str>,
    ) -> Result<ZoneSchedule, ControllerError> {
        self.check_zone(zone)?;
        let days = parse_days(days)?;
        let on_time = ClockTime::parse_field("onTime", on_time)?;
        let off_time = ClockTime::parse_field("offTime", off_time)?;

        let mut st = self.lock().await;
        let entry = &mut st.schedules[zone];
        entry.days = days;
        entry.on_time = on_time;
        entry.off_time = off_time;
        let updated = entry.clone();

        st.record(
            EventKind::Schedule,
            format!("zone {zone}: schedule set ({})", describe(&updated)),
        );
        info!(zone, schedule = %describe(&updated), "schedule updated");
        self.persist_schedules(&mut st).await;
        Ok(updated)
    }

    pub async fn set_schedule_enabled(
        &self,
        zone: usize,
        enabled: bool,
        origin: Origin,
    ) -> Result<(), ControllerError> {
        self.check_zone(zone)?;
        let mut st = self.lock().await;
        if st.schedules[zone].enabled == enabled {
            return Ok(());
        }
        st.schedules[zone].enabled = enabled;
        let word = if enabled { "enabled" } else { "disabled" };
        st.record(EventKind::Schedule, format!("zone {zone}: schedule {word} ({origin})"));
        info!(zone, enabled, %origin, "schedule enable flag changed");
        self.persist_schedules(&mut st).await;

        if let Err(e) = self.publisher.publish_schedule_enabled(zone, enabled) {
            warn!(zone, "schedule-enabled publish failed: {e}");
            st.record_error(format!("zone {zone}: schedule publish failed: {e}"));
        }
        Ok(())
    }

    pub async fn set_rain_delay(&self, days: u32) -> Result<u32, ControllerError> {
        if days > self.limits.max_rain_delay_days {
            return Err(ControllerError::InvalidCommand(format!(
                "rain delay must be at most {} days, got {days}",
                self.limits.max_rain_delay_days
            )));
        }
        let mut st = self.lock().await;
        st.rain_delay = days;
        st.record(EventKind::RainDelay, format!("rain delay set to {days} day(s)"));
        info!(days, "rain delay set");
        self.persist_rain_delay(&mut st).await;
        Ok(days)
    }

    /// Write the schedules; on failure the in-memory copy stays authoritative.
    async fn persist_schedules(&self, st: &mut ControllerState) {
        if let Err(e) = self.store.save_schedules(&st.schedules).await {
            warn!("persistence failure: {e:#}");
            st.record_error(format!("schedules not persisted: {e:#}"));
        }
    }

    pub(crate) async fn persist_rain_delay(&self, st: &mut ControllerState) {
        if let Err(e) = self.store.save_rain_delay(st.rain_delay).await {
            warn!("persistence failure: {e:#}");
            st.record_error(format!("rain delay not persisted: {e:#}"));
        }
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub async fn relay_states(&self) -> Vec<bool> {
        self.lock().await.relay_states()
    }

    pub async fn schedules(&self) -> Vec<ZoneSchedule> {
        self.lock().await.schedules.clone()
    }

    #[cfg(test)]
    pub async fn rain_delay(&self) -> u32 {
        self.lock().await.rain_delay
    }

    pub async fn record(&self, kind: EventKind, detail: String) {
        self.lock().await.record(kind, detail);
    }

    /// Push every zone's state and schedule flag to the broker (after a
    /// messaging reconnect).
    pub async fn republish(&self) {
        let st = self.lock().await;
        for zone in 0..self.zone_count {
            let results = [
                self.publisher.publish_state(zone, st.relays.get_zone(zone)),
                self.publisher
                    .publish_schedule_enabled(zone, st.schedules[zone].enabled),
            ];
            for r in results {
                if let Err(e) = r {
                    warn!(zone, "republish failed: {e}");
                }
            }
        }
    }

    pub async fn status(&self, mode: Mode, now: Instant) -> StatusResponse {
        let st = self.lock().await;
        let remaining = st.timers.remaining(now);
        let zones = (0..self.zone_count)
            .map(|zone| ZoneStatus {
                zone,
                on: st.relays.get_zone(zone),
                last_changed: st.last_changed[zone],
                timer_remaining_secs: remaining
                    .iter()
                    .find(|(z, _)| *z == zone)
                    .map(|(_, d)| d.as_secs()),
                schedule: st.schedules[zone].clone(),
            })
            .collect();

        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mode,
            rain_delay_days: st.rain_delay,
            zones,
            events: st.events.iter().rev().cloned().collect(),
        }
    }
}

fn describe(s: &ZoneSchedule) -> String {
    let days: Vec<&str> = s.days.iter().map(|d| d.as_str()).collect();
    let fmt_time = |t: Option<ClockTime>| t.map_or_else(|| "-".to_string(), |t| t.to_string());
    format!(
        "days=[{}] on={} off={}",
        days.join(","),
        fmt_time(s.on_time),
        fmt_time(s.off_time)
    )
}

// ===========================================================================
// Tests
// ===========================================================================
