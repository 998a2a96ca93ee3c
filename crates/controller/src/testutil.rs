//! Test doubles shared by the module tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::arbiter::{Controller, Limits, SharedController};
use crate::db::Db;
use crate::error::LinkError;
use crate::mqtt::StatePublisher;
use crate::relay::RelayBank;

/// Relay bank that counts hardware writes.
pub struct RecordingRelays {
    states: Vec<bool>,
    writes: Arc<AtomicUsize>,
}

impl RecordingRelays {
    pub fn new(zones: usize) -> (Self, Arc<AtomicUsize>) {
        let writes = Arc::new(AtomicUsize::new(0));
        (
            Self {
                states: vec![false; zones],
                writes: Arc::clone(&writes),
            },
            writes,
        )
    }
}

impl RelayBank for RecordingRelays {
    fn len(&self) -> usize {
        self.states.len()
    }

    fn set_zone(&mut self, zone: usize, on: bool) {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if let Some(s) = self.states.get_mut(zone) {
            *s = on;
        }
    }

    fn get_zone(&self, zone: usize) -> bool {
        self.states.get(zone).copied().unwrap_or(false)
    }
}

/// Publisher that records every notification and can be told to fail.
#[derive(Default)]
pub struct RecordingPublisher {
    states: Mutex<Vec<(usize, bool)>>,
    flags: Mutex<Vec<(usize, bool)>>,
    failing: AtomicBool,
}

impl RecordingPublisher {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn states(&self) -> Vec<(usize, bool)> {
        self.states.lock().unwrap().clone()
    }

    pub fn schedule_flags(&self) -> Vec<(usize, bool)> {
        self.flags.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.states.lock().unwrap().clear();
        self.flags.lock().unwrap().clear();
    }

    fn check(&self) -> Result<(), LinkError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(LinkError::Messaging("broker unreachable".into()))
        } else {
            Ok(())
        }
    }
}

impl StatePublisher for RecordingPublisher {
    fn publish_state(&self, zone: usize, on: bool) -> Result<(), LinkError> {
        self.check()?;
        self.states.lock().unwrap().push((zone, on));
        Ok(())
    }

    fn publish_schedule_enabled(&self, zone: usize, enabled: bool) -> Result<(), LinkError> {
        self.check()?;
        self.flags.lock().unwrap().push((zone, enabled));
        Ok(())
    }
}

/// Store timeout for tests. A paused clock auto-advances while the SQLite
/// worker thread is busy, so anything short would expire spuriously.
const STORE_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Connects on the real clock; tests that pause time do so afterwards.
pub async fn memory_db() -> Db {
    let db = Db::connect("sqlite::memory:", STORE_TIMEOUT)
        .await
        .unwrap();
    db.migrate().await.unwrap();
    db
}

pub struct Harness {
    pub ctl: SharedController,
    pub writes: Arc<AtomicUsize>,
    pub publisher: Arc<RecordingPublisher>,
    pub db: Db,
}

/// Controller over `zones` recording relays and an in-memory store. The write
/// counter starts at zero after the start-up all-off pass.
pub async fn controller(zones: usize) -> Harness {
    let db = memory_db().await;
    let (relays, writes) = RecordingRelays::new(zones);
    let publisher = RecordingPublisher::shared();
    let ctl = controller_on(db.clone(), relays, Arc::clone(&publisher)).await;
    writes.store(0, Ordering::SeqCst);
    Harness {
        ctl,
        writes,
        publisher,
        db,
    }
}

pub async fn controller_on(
    db: Db,
    relays: RecordingRelays,
    publisher: Arc<RecordingPublisher>,
) -> SharedController {
    Arc::new(Controller::open(Box::new(relays), db, publisher, Limits::default()).await)
}
