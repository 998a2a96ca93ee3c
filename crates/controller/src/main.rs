mod arbiter;
mod config;
mod db;
mod error;
mod mqtt;
mod relay;
mod schedule;
mod scheduler;
mod state;
mod supervisor;
#[cfg(test)]
mod testutil;
mod timers;
mod web;

use anyhow::{Context, Result};
use std::{env, process, sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use arbiter::{Controller, Origin};
use db::Db;
use mqtt::{MqttLink, MqttPublisher};
use relay::RelayBoard;
use scheduler::ScheduleEngine;
use supervisor::{Mode, RouteProbe, Supervisor};
use web::AppState;

/// EX_TEMPFAIL: tells the service manager to start us again.
const EXIT_RESTART: i32 = 75;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config file + env overrides ─────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "controller.toml".to_string());
    let mut cfg = config::load(&config_path)?;
    cfg.apply_env();
    cfg.validate()
        .with_context(|| format!("invalid config: {config_path}"))?;
    let offset = cfg.utc_offset()?;
    let probe_addr = cfg.probe_addr()?;

    // ── Database ────────────────────────────────────────────────────
    let db = open_store(&cfg.storage.db_url, cfg.storage_timeout()).await?;

    // ── Relay board ─────────────────────────────────────────────────
    let relays = RelayBoard::new(&cfg.controller.relay_pins, cfg.controller.polarity)?;
    info!(
        zones = cfg.zone_count(),
        polarity = ?cfg.controller.polarity,
        "relay board ready"
    );

    // ── Controller + MQTT publisher ─────────────────────────────────
    let (mode_tx, mode_rx) = watch::channel(Mode::Starting);
    let topics = cfg.topics();
    let (link, client) = MqttLink::new(cfg.mqtt_options(), topics.clone(), cfg.zone_count());
    let publisher = Arc::new(MqttPublisher::new(client, topics.clone(), mode_rx.clone()));
    let controller =
        Arc::new(Controller::open(Box::new(relays), db, publisher, cfg.limits()).await);

    // ── Web server ──────────────────────────────────────────────────
    let web_state = AppState {
        controller: Arc::clone(&controller),
        mode: mode_rx,
    };
    let web_port = cfg.web.port;
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_state, web_port).await {
            error!("{e:#}");
        }
    });

    // ── Connectivity ladder (starts the schedule engine) ────────────
    let engine = ScheduleEngine::new(Arc::clone(&controller), cfg.fallback_timer());
    let mut supervisor = Supervisor::new(
        Arc::clone(&controller),
        RouteProbe::new(probe_addr),
        link,
        topics,
        mode_tx,
        cfg.ladder(),
    )
    .with_engine(engine, cfg.tick(), offset);

    supervisor.run().await;

    controller.all_off(Origin::System).await;
    info!(code = EXIT_RESTART, "exiting for restart");
    process::exit(EXIT_RESTART);
}

/// Open and migrate the configured database, or fall back to an in-memory
/// one so the controller still runs (edits are then lost on restart).
async fn open_store(db_url: &str, timeout: Duration) -> Result<Db> {
    let opened = async {
        let db = Db::connect(db_url, timeout).await?;
        db.migrate().await?;
        anyhow::Ok(db)
    }
    .await;

    match opened {
        Ok(db) => {
            info!(db_url, "db ready");
            Ok(db)
        }
        Err(e) => {
            warn!("persistence failure: {e:#}; using an in-memory store");
            let db = Db::connect("sqlite::memory:", timeout).await?;
            db.migrate().await?;
            Ok(db)
        }
    }
}
