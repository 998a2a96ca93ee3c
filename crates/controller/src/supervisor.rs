//! Connectivity ladder: network bring-up, then the messaging link, each rung
//! with its own retry budget and exponential backoff.
//!
//! ```text
//!            network ok              messaging ok
//! STARTING ─────────────▶ (net up) ─────────────────▶ FULL ◀─┐
//!    │                         │                        │    │ reconnect ok
//!    │ retries exhausted       │ retries exhausted      │ poll error
//!    ▼                         ▼                        ▼    │
//! ISOLATED               NETWORK_ONLY ◀──────────── reconnecting
//! (relays off,           (schedules run,   exhausted
//!  restart later)         publishes no-op, optional re-probe)
//! ```
//!
//! The schedule engine is spawned before the first rung and watches the mode:
//! schedules and day rollover run only in FULL and NETWORK_ONLY, where the
//! wall clock has been synced. Countdown timers expire in every mode.
//!
//! Link failures never leave this module: they become mode transitions and
//! `link` events, and the schedule engine keeps ticking in its own task.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::UtcOffset;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use crate::arbiter::{Origin, SharedController};
use crate::error::LinkError;
use crate::mqtt::{self, Message, Topics};
use crate::scheduler::ScheduleEngine;
use crate::state::EventKind;

// ---------------------------------------------------------------------------
// Operating mode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mode {
    Starting,
    Full,
    NetworkOnly,
    Isolated,
}

impl Mode {
    /// Whether outbound notifications should reach the broker.
    pub fn messaging_active(self) -> bool {
        self == Mode::Full
    }

    /// The network came up, so the wall clock has been synced.
    pub fn clock_trusted(self) -> bool {
        matches!(self, Mode::Full | Mode::NetworkOnly)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Starting => "STARTING",
            Mode::Full => "FULL",
            Mode::NetworkOnly => "NETWORK_ONLY",
            Mode::Isolated => "ISOLATED",
        })
    }
}

// ---------------------------------------------------------------------------
// Retry policy & backoff
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total connection attempts before the rung is given up.
    pub attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_secs: u64,
    pub attempt_timeout_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            base_delay_ms: 2_000,
            max_delay_secs: 60,
            attempt_timeout_secs: 10,
        }
    }
}

impl RetryPolicy {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }
}

/// Doubling delay with a ceiling and a finite attempt budget.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    ceiling: Duration,
    attempts: u32,
    failures: u32,
}

impl Backoff {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            base: Duration::from_millis(policy.base_delay_ms),
            ceiling: Duration::from_secs(policy.max_delay_secs),
            attempts: policy.attempts.max(1),
            failures: 0,
        }
    }

    /// Register a failed attempt. Returns the wait before the next one, or
    /// `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.failures >= self.attempts {
            return None;
        }
        let shift = (self.failures - 1).min(20);
        Some(self.base.saturating_mul(1 << shift).min(self.ceiling))
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

// ---------------------------------------------------------------------------
// Links
// ---------------------------------------------------------------------------

/// One rung of the ladder.
pub trait Link: Send {
    /// A single connection attempt. Callers bound it with a timeout.
    fn connect(&mut self) -> impl Future<Output = Result<(), LinkError>> + Send;
}

/// A connected link that delivers inbound commands.
pub trait MessageLink: Link {
    /// Next inbound event; `Ok(None)` for traffic that carries no command.
    fn poll(&mut self) -> impl Future<Output = Result<Option<Message>, LinkError>> + Send;
}

/// Network readiness check: a connected UDP socket needs a route to
/// `addr` but sends nothing.
pub struct RouteProbe {
    addr: SocketAddr,
}

impl RouteProbe {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

impl Link for RouteProbe {
    async fn connect(&mut self) -> Result<(), LinkError> {
        let bind = if self.addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind)
            .await
            .map_err(|e| LinkError::Network(format!("bind {bind}: {e}")))?;
        socket
            .connect(self.addr)
            .await
            .map_err(|e| LinkError::Network(format!("no route to {}: {e}", self.addr)))?;
        let local = socket
            .local_addr()
            .map_err(|e| LinkError::Network(e.to_string()))?;
        if local.ip().is_unspecified() {
            return Err(LinkError::Network("no local address assigned".into()));
        }
        info!(local = %local.ip(), "network up");
        Ok(())
    }
}

/// Connect `link`, retrying per `policy`. Returns the last error once the
/// budget is exhausted.
pub async fn establish<L: Link>(
    link: &mut L,
    policy: &RetryPolicy,
    what: &'static str,
) -> Result<(), LinkError> {
    let mut backoff = Backoff::new(policy);
    let per_attempt = policy.attempt_timeout();

    loop {
        let result = match timeout(per_attempt, link.connect()).await {
            Ok(r) => r,
            Err(_) => Err(LinkError::Timeout {
                what,
                after: per_attempt,
            }),
        };

        match result {
            Ok(()) => {
                info!(link = what, attempt = backoff.failures() + 1, "link established");
                return Ok(());
            }
            Err(e) => match backoff.next_delay() {
                Some(delay) => {
                    warn!(
                        link = what,
                        attempt = backoff.failures(),
                        retry_in_ms = delay.as_millis() as u64,
                        "link attempt failed: {e}"
                    );
                    sleep(delay).await;
                }
                None => {
                    warn!(link = what, attempts = backoff.failures(), "retries exhausted: {e}");
                    return Err(e);
                }
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Timing knobs for the ladder.
#[derive(Debug, Clone)]
pub struct LadderConfig {
    pub network: RetryPolicy,
    pub messaging: RetryPolicy,
    /// NETWORK_ONLY re-probe period; `None` stays there for the session.
    pub messaging_retry_after: Option<Duration>,
    pub isolated_restart_after: Duration,
}

struct PendingEngine {
    engine: ScheduleEngine,
    period: Duration,
    offset: UtcOffset,
}

pub struct Supervisor<N, M> {
    controller: SharedController,
    network: N,
    messaging: M,
    topics: Topics,
    mode: watch::Sender<Mode>,
    ladder: LadderConfig,
    engine: Option<PendingEngine>,
}

impl<N: Link, M: MessageLink> Supervisor<N, M> {
    pub fn new(
        controller: SharedController,
        network: N,
        messaging: M,
        topics: Topics,
        mode: watch::Sender<Mode>,
        ladder: LadderConfig,
    ) -> Self {
        Self {
            controller,
            network,
            messaging,
            topics,
            mode,
            ladder,
            engine: None,
        }
    }

    /// Schedule engine to spawn when the ladder starts, gated on the mode.
    pub fn with_engine(
        mut self,
        engine: ScheduleEngine,
        period: Duration,
        offset: UtcOffset,
    ) -> Self {
        self.engine = Some(PendingEngine {
            engine,
            period,
            offset,
        });
        self
    }

    /// Drive the ladder. Returns only from ISOLATED, once the restart period
    /// has elapsed; the caller is expected to exit and be restarted.
    pub async fn run(&mut self) {
        self.set_mode(Mode::Starting).await;
        self.start_engine();

        if let Err(e) = establish(&mut self.network, &self.ladder.network, "network").await {
            self.isolate(e).await;
            return;
        }

        loop {
            match establish(&mut self.messaging, &self.ladder.messaging, "messaging").await {
                Ok(()) => {
                    self.set_mode(Mode::Full).await;
                    self.controller.republish().await;
                    let e = self.serve_messaging().await;
                    warn!("messaging link lost: {e}; reconnecting");
                    self.controller
                        .record(EventKind::Link, format!("messaging link lost: {e}"))
                        .await;
                }
                Err(e) => {
                    self.set_mode(Mode::NetworkOnly).await;
                    self.controller
                        .record(EventKind::Link, format!("messaging disabled: {e}"))
                        .await;
                    match self.ladder.messaging_retry_after {
                        Some(after) => {
                            info!(retry_after_secs = after.as_secs(), "messaging will be retried");
                            sleep(after).await;
                        }
                        None => std::future::pending::<()>().await,
                    }
                }
            }
        }
    }

    async fn serve_messaging(&mut self) -> LinkError {
        loop {
            match self.messaging.poll().await {
                Ok(Some(msg)) => mqtt::dispatch(&self.controller, &self.topics, &msg).await,
                Ok(None) => {}
                Err(e) => return e,
            }
        }
    }

    async fn isolate(&mut self, cause: LinkError) {
        self.set_mode(Mode::Isolated).await;
        self.controller
            .record(EventKind::Link, format!("network bring-up failed: {cause}"))
            .await;
        self.controller.all_off(Origin::System).await;

        let after = self.ladder.isolated_restart_after;
        warn!(
            restart_after_secs = after.as_secs(),
            "isolated: relays off, schedules paused, local interface only"
        );
        sleep(after).await;
        info!("isolated session over; requesting restart");
    }

    fn start_engine(&mut self) {
        if let Some(p) = self.engine.take() {
            let engine = p.engine.gated_by(self.mode.subscribe());
            tokio::spawn(engine.run(p.period, p.offset));
        }
    }

    async fn set_mode(&self, mode: Mode) {
        let prev = self.mode.send_replace(mode);
        if prev != mode {
            info!(from = %prev, to = %mode, "operating mode changed");
            self.controller
                .record(EventKind::Link, format!("mode {prev} -> {mode}"))
                .await;
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
