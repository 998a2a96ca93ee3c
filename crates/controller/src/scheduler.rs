//! Time-of-day schedule engine: decides once per tick which relays the weekly
//! schedule, the countdown overrides and the rain delay require, and routes
//! every change through the controller.
//!
//! ## Tick order
//!
//! ```text
//! day rollover ──▶ minute-edge schedule evaluation ──▶ timer expiry sweep
//! (rain delay -1)   (on wins over off, rain delay       (every tick, second
//!                    suppresses both edges)              granularity)
//! ```
//!
//! The whole tick runs under the controller lock, so the rain delay consulted
//! in step two is the value step one just wrote.
//!
//! The first two steps need a trustworthy wall clock and are skipped while the
//! operating mode says otherwise. The expiry sweep runs in every mode.

use std::time::Duration;

use time::{Date, OffsetDateTime, PrimitiveDateTime, UtcOffset};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::arbiter::{Origin, SharedController};
use crate::schedule::{ClockTime, Day, Trigger};
use crate::state::{ControllerState, EventKind};
use crate::supervisor::Mode;

/// Largest forward gap whose skipped minutes are still evaluated. A 60 s
/// period delayed by a busy lock can step over one minute; longer jumps are
/// clock corrections and only the current minute counts.
const MAX_CATCH_UP: time::Duration = time::Duration::minutes(2);

/// What a single tick did, for logging and tests.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub rain_delay_decremented: bool,
    pub fired_on: Vec<usize>,
    pub fired_off: Vec<usize>,
    pub suppressed: Vec<usize>,
    pub expired: Vec<usize>,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub struct ScheduleEngine {
    controller: SharedController,
    fallback: Duration,
    /// Start of the last evaluated wall-clock minute.
    last_minute: Option<PrimitiveDateTime>,
    mode: Option<watch::Receiver<Mode>>,
}

impl ScheduleEngine {
    /// `fallback` is the override created on every schedule-driven ON.
    pub fn new(controller: SharedController, fallback: Duration) -> Self {
        Self {
            controller,
            fallback,
            last_minute: None,
            mode: None,
        }
    }

    /// Only roll days and evaluate schedules while `mode` trusts the wall
    /// clock. Without it the clock is always trusted.
    pub fn gated_by(mut self, mode: watch::Receiver<Mode>) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Run the tick loop forever. Intended to be `tokio::spawn`-ed.
    pub async fn run(mut self, period: Duration, offset: UtcOffset) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            tick_ms = period.as_millis() as u64,
            fallback_min = self.fallback.as_secs() / 60,
            %offset,
            "schedule engine started"
        );
        self.controller
            .record(EventKind::System, "schedule engine started".to_string())
            .await;

        loop {
            ticker.tick().await;
            let wall = OffsetDateTime::now_utc().to_offset(offset);
            let report = self
                .tick(PrimitiveDateTime::new(wall.date(), wall.time()), Instant::now())
                .await;
            if !report.is_empty() {
                debug!(?report, "tick");
            }
        }
    }

    fn clock_trusted(&self) -> bool {
        self.mode.as_ref().map_or(true, |m| m.borrow().clock_trusted())
    }

    /// One evaluation at local wall time `wall` and monotonic time `now`.
    pub async fn tick(&mut self, wall: PrimitiveDateTime, now: Instant) -> TickReport {
        let controller = SharedController::clone(&self.controller);
        let mut st = controller.lock().await;
        let mut report = TickReport::default();

        if self.clock_trusted() {
            report.rain_delay_decremented = self.roll_day(&mut st, wall.date()).await;
            self.evaluate_minutes(&mut st, wall, now, &mut report);
        }

        for zone in st.timers.take_expired(now) {
            info!(zone, "timer expired");
            st.record(EventKind::Timer, format!("zone {zone}: timer expired"));
            controller.apply(&mut st, zone, false, Origin::Timer);
            report.expired.push(zone);
        }

        report
    }

    async fn roll_day(&self, st: &mut ControllerState, today: Date) -> bool {
        if st.last_rollover == Some(today) {
            return false;
        }
        let decrement = st.last_rollover.is_some() && st.rain_delay > 0;
        st.last_rollover = Some(today);

        if decrement {
            st.rain_delay -= 1;
            info!(remaining = st.rain_delay, "day rollover: rain delay decremented");
            st.record(
                EventKind::RainDelay,
                format!("day rollover: rain delay now {} day(s)", st.rain_delay),
            );
        }
        if let Err(e) = self.controller.store().save_rollover(today, st.rain_delay).await {
            warn!("persistence failure: {e:#}");
            st.record_error(format!("day rollover not persisted: {e:#}"));
        }
        decrement
    }

    /// Evaluate every minute after the last evaluated one, up to the minute
    /// containing `wall`.
    fn evaluate_minutes(
        &mut self,
        st: &mut ControllerState,
        wall: PrimitiveDateTime,
        now: Instant,
        report: &mut TickReport,
    ) {
        let current = minute_of(wall);
        let mut minute = match self.last_minute {
            None => current,
            // Same minute, or the clock stepped backwards: never fire twice.
            Some(last) if current <= last => return,
            Some(last) if current - last <= MAX_CATCH_UP => last + time::Duration::MINUTE,
            Some(last) => {
                info!(from = %last, to = %current, "wall clock jumped; skipped minutes ignored");
                current
            }
        };
        if minute < current {
            debug!(from = %minute, to = %current, "catching up skipped minutes");
        }
        self.last_minute = Some(current);

        while minute <= current {
            self.evaluate_minute(st, minute, now, report);
            minute += time::Duration::MINUTE;
        }
    }

    fn evaluate_minute(
        &self,
        st: &mut ControllerState,
        minute: PrimitiveDateTime,
        now: Instant,
        report: &mut TickReport,
    ) {
        let day = Day::from_weekday(minute.weekday());
        let at = ClockTime::of(minute.time());

        for zone in 0..st.schedules.len() {
            let Some(trigger) = st.schedules[zone].trigger_at(day, at) else {
                continue;
            };

            if st.rain_delay > 0 {
                info!(
                    zone,
                    ?trigger,
                    rain_delay = st.rain_delay,
                    "schedule suppressed by rain delay"
                );
                st.record(
                    EventKind::Suppressed,
                    format!(
                        "zone {zone}: scheduled {} at {at} suppressed (rain delay {} day(s))",
                        if trigger == Trigger::On { "ON" } else { "OFF" },
                        st.rain_delay
                    ),
                );
                report.suppressed.push(zone);
                continue;
            }

            match trigger {
                Trigger::On => {
                    self.controller.apply(st, zone, true, Origin::Schedule);
                    st.timers.insert(zone, now + self.fallback);
                    report.fired_on.push(zone);
                }
                Trigger::Off => {
                    self.controller.apply(st, zone, false, Origin::Schedule);
                    st.timers.remove(zone);
                    report.fired_off.push(zone);
                }
            }
        }
    }
}

/// Start of the minute containing `wall`.
fn minute_of(wall: PrimitiveDateTime) -> PrimitiveDateTime {
    wall - time::Duration::new(i64::from(wall.second()), wall.nanosecond() as i32)
}

// ===========================================================================
// Tests
// ===========================================================================
