use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::phase::PhaseState;
use crate::sensor::{SensorSnapshot, SnapshotMap};
use crate::store::{SensorSource, StateStore};

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

fn ts_to_utc(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

fn snapshot_from_row(r: &SqliteRow) -> Result<(String, SensorSnapshot)> {
    let sensor_id: String = r.try_get("sensor_id")?;
    let snap = SensorSnapshot {
        temperature: r.try_get("temperature")?,
        humidity: r.try_get("humidity")?,
        vpd: r.try_get("vpd")?,
        timestamp: ts_to_utc(r.try_get("ts")?),
    };
    Ok((sensor_id, snap))
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/growbox/growbox.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal);

        // every connection to :memory: is its own database
        let max = if db_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Readings
    // ----------------------------

    pub async fn insert_climate(&self, ts: i64, sensor_id: &str, s: &SensorSnapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO climate_readings (ts, sensor_id, temperature, humidity, vpd)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(ts)
        .bind(sensor_id)
        .bind(s.temperature)
        .bind(s.humidity)
        .bind(s.vpd)
        .execute(&self.pool)
        .await
        .context("insert_climate failed")?;
        Ok(())
    }

    pub async fn insert_moisture(&self, ts: i64, sensor_id: &str, moisture: f64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO moisture_readings (ts, sensor_id, moisture)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(ts)
        .bind(sensor_id)
        .bind(moisture)
        .execute(&self.pool)
        .await
        .context("insert_moisture failed")?;
        Ok(())
    }

    /// Newest moisture reading at or after `since` (unix seconds).
    pub async fn latest_moisture_since(&self, sensor_id: &str, since: i64) -> Result<Option<f64>> {
        let row = sqlx::query(
            r#"
            SELECT moisture
            FROM moisture_readings
            WHERE sensor_id = ? AND ts >= ?
            ORDER BY ts DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(sensor_id)
        .bind(since)
        .fetch_optional(&self.pool)
        .await
        .context("latest_moisture_since failed")?;

        row.map(|r| r.try_get::<f64, _>("moisture"))
            .transpose()
            .context("bad moisture row")
    }
}

// ----------------------------
// Snapshot provider
// ----------------------------

impl SensorSource for Db {
    async fn latest_all(&self) -> Result<SnapshotMap> {
        let rows = sqlx::query(
            r#"
            SELECT c.sensor_id, c.ts, c.temperature, c.humidity, c.vpd
            FROM climate_readings c
            WHERE c.id = (
              SELECT id FROM climate_readings
              WHERE sensor_id = c.sensor_id
              ORDER BY ts DESC, id DESC
              LIMIT 1
            )
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("latest_all climate query failed")?;

        rows.iter().map(snapshot_from_row).collect()
    }

    async fn latest_moisture(&self, sensor: &str, max_age: Duration) -> Result<Option<f64>> {
        let since = Utc::now().timestamp() - max_age.as_secs() as i64;
        self.latest_moisture_since(sensor, since).await
    }
}

// ----------------------------
// Phase state
// ----------------------------

impl StateStore for Db {
    async fn load(&self) -> Result<HashMap<String, PhaseState>> {
        let rows = sqlx::query(
            r#"
            SELECT phase, last_trigger, daily_volume_ml, daily_reset_date,
                   daily_count, moisture_readings, summary_sent
            FROM phase_state
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("load phase_state failed")?;

        let mut out = HashMap::with_capacity(rows.len());
        for r in rows {
            let phase: String = r.try_get("phase")?;
            let date: String = r.try_get("daily_reset_date")?;
            let readings: String = r.try_get("moisture_readings")?;
            let state = PhaseState {
                last_trigger: r.try_get::<Option<i64>, _>("last_trigger")?.map(ts_to_utc),
                daily_volume_ml: r.try_get("daily_volume_ml")?,
                daily_reset_date: NaiveDate::from_str(&date)
                    .with_context(|| format!("phase {phase}: bad daily_reset_date '{date}'"))?,
                daily_count: r.try_get::<i64, _>("daily_count")?.max(0) as u32,
                moisture_readings: serde_json::from_str(&readings)
                    .with_context(|| format!("phase {phase}: bad moisture_readings"))?,
                summary_sent: r.try_get("summary_sent")?,
            };
            out.insert(phase, state);
        }
        Ok(out)
    }

    async fn save(&self, states: &HashMap<String, PhaseState>) -> Result<()> {
        let mut tx = self.pool.begin().await.context("begin failed")?;
        for (phase, s) in states {
            let readings =
                serde_json::to_string(&s.moisture_readings).context("encode readings failed")?;
            sqlx::query(
                r#"
                INSERT INTO phase_state (
                  phase, last_trigger, daily_volume_ml, daily_reset_date,
                  daily_count, moisture_readings, summary_sent
                ) VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(phase) DO UPDATE SET
                  last_trigger=excluded.last_trigger,
                  daily_volume_ml=excluded.daily_volume_ml,
                  daily_reset_date=excluded.daily_reset_date,
                  daily_count=excluded.daily_count,
                  moisture_readings=excluded.moisture_readings,
                  summary_sent=excluded.summary_sent
                "#,
            )
            .bind(phase)
            .bind(s.last_trigger.map(|t| t.timestamp()))
            .bind(s.daily_volume_ml)
            .bind(s.daily_reset_date.to_string())
            .bind(i64::from(s.daily_count))
            .bind(readings)
            .bind(s.summary_sent)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("save phase_state '{phase}' failed"))?;
        }
        tx.commit().await.context("commit failed")?;
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
