//! Durable zone store: weekly schedules and the rain-delay counter, kept in
//! SQLite. Loads never fail; anything missing or unreadable comes back as the
//! default value so startup always proceeds.

use anyhow::{bail, Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use time::macros::format_description;
use time::Date;
use tracing::warn;

use crate::schedule::{ClockTime, ZoneSchedule};

const RAIN_DELAY_KEY: &str = "rain_delay_days";
const LAST_ROLLOVER_KEY: &str = "rain_delay_last_day";

const UPSERT_SETTING: &str = r#"
    INSERT INTO settings (key, value) VALUES (?, ?)
    ON CONFLICT(key) DO UPDATE SET value=excluded.value
"#;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
    timeout: Duration,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/sprinkler/controller.db?mode=rwc"
    /// - "sqlite::memory:" (tests, and the fallback when the file is unusable)
    pub async fn connect(db_url: &str, timeout: Duration) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal);

        // Every connection to ":memory:" is its own database, so keep exactly
        // one alive for the lifetime of the pool.
        let in_memory = db_url.contains(":memory:");
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 4 })
            .idle_timeout(if in_memory { None } else { Some(Duration::from_secs(600)) })
            .max_lifetime(if in_memory { None } else { Some(Duration::from_secs(1800)) })
            .acquire_timeout(timeout)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool, timeout })
    }

    #[cfg(test)]
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(res) => res.with_context(|| format!("{op} failed")),
            Err(_) => bail!("{op} timed out after {:?}", self.timeout),
        }
    }

    // ----------------------------
    // Zone schedules
    // ----------------------------

    /// One entry per configured zone, in zone order.
    pub async fn load_schedules(&self, zone_count: usize) -> Vec<ZoneSchedule> {
        let mut schedules = vec![ZoneSchedule::default(); zone_count];

        let rows = match self
            .bounded(
                "load_schedules",
                sqlx::query(
                    "SELECT zone, enabled, days, on_time, off_time \
                     FROM zone_schedules ORDER BY zone",
                )
                .fetch_all(&self.pool),
            )
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!("{e:#}; starting with disabled schedules");
                return schedules;
            }
        };

        for row in rows {
            match decode_schedule(&row) {
                Ok((zone, s)) if zone < zone_count => schedules[zone] = s,
                Ok((zone, _)) => {
                    warn!(zone, zone_count, "stored schedule for unconfigured zone ignored")
                }
                Err(e) => warn!("malformed schedule row ignored: {e:#}"),
            }
        }
        schedules
    }

    /// Replace every stored schedule in one transaction.
    pub async fn save_schedules(&self, schedules: &[ZoneSchedule]) -> Result<()> {
        let encoded = schedules
            .iter()
            .map(|s| {
                let days: Vec<&str> = s.days.iter().map(|d| d.as_str()).collect();
                serde_json::to_string(&days).map(|days| (s, days))
            })
            .collect::<Result<Vec<_>, _>>()
            .context("failed to encode schedule days")?;

        self.bounded("save_schedules", async {
            let mut tx = self.pool.begin().await?;
            for (zone, (s, days)) in encoded.iter().enumerate() {
                sqlx::query(
                    r#"
                    INSERT INTO zone_schedules (zone, enabled, days, on_time, off_time)
                    VALUES (?, ?, ?, ?, ?)
                    ON CONFLICT(zone) DO UPDATE SET
                      enabled=excluded.enabled,
                      days=excluded.days,
                      on_time=excluded.on_time,
                      off_time=excluded.off_time
                    "#,
                )
                .bind(zone as i64)
                .bind(s.enabled)
                .bind(days)
                .bind(s.on_time.map(|t| t.to_string()))
                .bind(s.off_time.map(|t| t.to_string()))
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await
        })
        .await
    }

    // ----------------------------
    // Rain delay
    // ----------------------------

    pub async fn load_rain_delay(&self) -> u32 {
        match self.get_setting(RAIN_DELAY_KEY).await {
            Ok(Some(v)) => v.parse().unwrap_or_else(|_| {
                warn!(value = %v, "malformed rain delay ignored");
                0
            }),
            Ok(None) => 0,
            Err(e) => {
                warn!("{e:#}; rain delay defaults to 0");
                0
            }
        }
    }

    pub async fn save_rain_delay(&self, days: u32) -> Result<()> {
        self.put_setting(RAIN_DELAY_KEY, &days.to_string()).await
    }

    /// Date of the last day rollover applied to the rain delay.
    pub async fn load_last_rollover(&self) -> Option<Date> {
        match self.get_setting(LAST_ROLLOVER_KEY).await {
            Ok(Some(v)) => Date::parse(&v, format_description!("[year]-[month]-[day]"))
                .map_err(|e| warn!(value = %v, "malformed rollover date ignored: {e}"))
                .ok(),
            Ok(None) => None,
            Err(e) => {
                warn!("{e:#}");
                None
            }
        }
    }

    /// Record the rollover date together with the rain delay it left behind,
    /// so a day's decrement is either fully stored or not at all.
    pub async fn save_rollover(&self, day: Date, rain_delay: u32) -> Result<()> {
        let day = day
            .format(format_description!("[year]-[month]-[day]"))
            .context("failed to format rollover date")?;
        let days = rain_delay.to_string();

        self.bounded("save_rollover", async {
            let mut tx = self.pool.begin().await?;
            let rows = [(LAST_ROLLOVER_KEY, day.as_str()), (RAIN_DELAY_KEY, days.as_str())];
            for (key, value) in rows {
                sqlx::query(UPSERT_SETTING)
                    .bind(key)
                    .bind(value)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await
        })
        .await
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let row = self
            .bounded(
                "get_setting",
                sqlx::query("SELECT value FROM settings WHERE key = ?")
                    .bind(key)
                    .fetch_optional(&self.pool),
            )
            .await?;
        row.map(|r| r.try_get::<String, _>("value"))
            .transpose()
            .context("settings value is not text")
    }

    async fn put_setting(&self, key: &str, value: &str) -> Result<()> {
        self.bounded(
            "put_setting",
            sqlx::query(UPSERT_SETTING)
                .bind(key)
                .bind(value)
                .execute(&self.pool),
        )
        .await?;
        Ok(())
    }
}

fn decode_schedule(row: &SqliteRow) -> Result<(usize, ZoneSchedule)> {
    let zone: i64 = row.try_get("zone")?;
    let zone = usize::try_from(zone).with_context(|| format!("negative zone index {zone}"))?;

    let days_json: String = row.try_get("days")?;
    let day_names: Vec<String> =
        serde_json::from_str(&days_json).with_context(|| format!("zone {zone}: bad days json"))?;
    let days = crate::schedule::parse_days(&day_names)?;

    let on: Option<String> = row.try_get("on_time")?;
    let off: Option<String> = row.try_get("off_time")?;

    Ok((
        zone,
        ZoneSchedule {
            enabled: row.try_get("enabled")?,
            days,
            on_time: ClockTime::parse_field("onTime", on.as_deref())?,
            off_time: ClockTime::parse_field("offTime", off.as_deref())?,
        },
    ))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::Day;
    use time::macros::date;

    async fn memory_db() -> Db {
        let db = Db::connect("sqlite::memory:", Duration::from_secs(2))
            .await
            .unwrap();
        db.migrate().await.unwrap();
        db
    }

    fn watered_tuesday() -> ZoneSchedule {
        ZoneSchedule {
            enabled: true,
            days: [Day::Tue, Day::Thu].into_iter().collect(),
            on_time: ClockTime::new(7, 0),
            off_time: ClockTime::new(7, 30),
        }
    }

    #[tokio::test]
    async fn empty_store_loads_defaults() {
        let db = memory_db().await;
        let schedules = db.load_schedules(4).await;
        assert_eq!(schedules, vec![ZoneSchedule::default(); 4]);
        assert_eq!(db.load_rain_delay().await, 0);
        assert_eq!(db.load_last_rollover().await, None);
    }

    #[tokio::test]
    async fn schedules_persist_across_loads() {
        let db = memory_db().await;
        let mut schedules = vec![ZoneSchedule::default(); 3];
        schedules[1] = watered_tuesday();
        db.save_schedules(&schedules).await.unwrap();

        let loaded = db.load_schedules(3).await;
        assert_eq!(loaded, schedules);
    }

    #[tokio::test]
    async fn save_overwrites_previous_entry() {
        let db = memory_db().await;
        let mut schedules = vec![watered_tuesday()];
        db.save_schedules(&schedules).await.unwrap();
        schedules[0].enabled = false;
        schedules[0].on_time = None;
        db.save_schedules(&schedules).await.unwrap();

        assert_eq!(db.load_schedules(1).await, schedules);
    }

    #[tokio::test]
    async fn extra_stored_zones_are_ignored_when_zone_count_shrinks() {
        let db = memory_db().await;
        db.save_schedules(&vec![watered_tuesday(); 4]).await.unwrap();
        let loaded = db.load_schedules(2).await;
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1], watered_tuesday());
    }

    #[tokio::test]
    async fn malformed_row_falls_back_to_default() {
        let db = memory_db().await;
        sqlx::query(
            "INSERT INTO zone_schedules (zone, enabled, days, on_time) \
             VALUES (0, 1, 'not json', '07:00')",
        )
        .execute(db.pool())
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO zone_schedules (zone, enabled, days, on_time) \
             VALUES (1, 1, '[\"Mon\"]', '25:99')",
        )
        .execute(db.pool())
        .await
        .unwrap();

        let loaded = db.load_schedules(2).await;
        assert_eq!(loaded, vec![ZoneSchedule::default(); 2]);
    }

    #[tokio::test]
    async fn rain_delay_round_trips() {
        let db = memory_db().await;
        db.save_rain_delay(3).await.unwrap();
        db.save_rain_delay(2).await.unwrap();
        assert_eq!(db.load_rain_delay().await, 2);
    }

    #[tokio::test]
    async fn malformed_rain_delay_reads_as_zero() {
        let db = memory_db().await;
        db.put_setting(RAIN_DELAY_KEY, "lots").await.unwrap();
        assert_eq!(db.load_rain_delay().await, 0);
    }

    #[tokio::test]
    async fn rollover_stores_date_and_rain_delay_together() {
        let db = memory_db().await;
        db.save_rain_delay(3).await.unwrap();
        db.save_rollover(date!(2024 - 06 - 04), 2).await.unwrap();
        assert_eq!(db.load_last_rollover().await, Some(date!(2024 - 06 - 04)));
        assert_eq!(db.load_rain_delay().await, 2);
    }

    #[tokio::test]
    async fn failed_rollover_leaves_previous_values() {
        let db = memory_db().await;
        db.save_rollover(date!(2024 - 06 - 04), 3).await.unwrap();
        // Make the rain-delay half of the write fail after the date half ran.
        sqlx::query(
            "CREATE TRIGGER reject_rain_delay BEFORE UPDATE ON settings \
             WHEN NEW.key = 'rain_delay_days' BEGIN SELECT RAISE(ABORT, 'rejected'); END",
        )
        .execute(db.pool())
        .await
        .unwrap();

        assert!(db.save_rollover(date!(2024 - 06 - 05), 2).await.is_err());
        assert_eq!(db.load_last_rollover().await, Some(date!(2024 - 06 - 04)));
        assert_eq!(db.load_rain_delay().await, 3);
    }

    #[tokio::test]
    async fn closed_pool_reports_errors_and_loads_defaults() {
        let db = memory_db().await;
        db.save_rain_delay(5).await.unwrap();
        db.pool().close().await;

        assert!(db.save_rain_delay(1).await.is_err());
        assert!(db.save_schedules(&[watered_tuesday()]).await.is_err());
        assert_eq!(db.load_rain_delay().await, 0);
        assert_eq!(db.load_schedules(1).await, vec![ZoneSchedule::default()]);
    }
}
