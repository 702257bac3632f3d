use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::db::Db;
use crate::sensor::SensorSnapshot;
use crate::state::SharedState;

// ---------------------------------------------------------------------------
// MQTT message types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct ClimateMsg {
    pub(crate) ts: Option<i64>,
    pub(crate) temperature: Option<f64>,
    pub(crate) humidity: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MoistureMsg {
    pub(crate) ts: Option<i64>,
    pub(crate) moisture: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Channel {
    Climate,
    Moisture,
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// Split "tele/<sensor_id>/climate" or "tele/<sensor_id>/moisture".
pub(crate) fn parse_topic(topic: &str) -> Option<(&str, Channel)> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() != 3 || parts[0] != "tele" || parts[1].is_empty() {
        return None;
    }
    let channel = match parts[2] {
        "climate" => Channel::Climate,
        "moisture" => Channel::Moisture,
        _ => return None,
    };
    Some((parts[1], channel))
}

/// Store one telemetry message. Payload problems are errors for the caller
/// to log; they never stop the intake loop.
pub(crate) async fn ingest(db: &Db, state: &SharedState, topic: &str, payload: &[u8]) -> Result<()> {
    let Some((sensor_id, channel)) = parse_topic(topic) else {
        bail!("unexpected topic '{topic}'");
    };
    let now = Utc::now().timestamp();

    match channel {
        Channel::Climate => {
            let msg: ClimateMsg =
                serde_json::from_slice(payload).context("bad climate payload")?;
            let temperature = msg.temperature.filter(|v| v.is_finite());
            let humidity = msg.humidity.filter(|v| (0.0..=100.0).contains(v));
            if temperature.is_none() && humidity.is_none() {
                bail!("{sensor_id}: climate payload without usable values");
            }
            let ts = msg.ts.unwrap_or(now);
            let at = DateTime::from_timestamp(ts, 0).unwrap_or_else(Utc::now);
            let snap = SensorSnapshot::from_climate(temperature, humidity, at);
            db.insert_climate(ts, sensor_id, &snap).await?;
            tracing::debug!(
                sensor = sensor_id,
                temperature = ?snap.temperature,
                humidity = ?snap.humidity,
                vpd = ?snap.vpd,
                "climate sample stored"
            );
        }
        Channel::Moisture => {
            let msg: MoistureMsg =
                serde_json::from_slice(payload).context("bad moisture payload")?;
            if !(0.0..=100.0).contains(&msg.moisture) {
                bail!("{sensor_id}: moisture {} out of range [0, 100]", msg.moisture);
            }
            db.insert_moisture(msg.ts.unwrap_or(now), sensor_id, msg.moisture)
                .await?;
            tracing::debug!(sensor = sensor_id, moisture = msg.moisture, "moisture sample stored");
        }
    }

    state.write().await.record_sample(sensor_id);
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
