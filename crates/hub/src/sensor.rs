//! Climate snapshots as seen by the rule engine, plus derived VPD.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Latest sample per sensor id, taken once per rule-engine tick.
pub type SnapshotMap = HashMap<String, SensorSnapshot>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSnapshot {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub vpd: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl SensorSnapshot {
    /// Build a snapshot from a raw climate sample, deriving VPD when both
    /// temperature and humidity are present.
    pub fn from_climate(
        temperature: Option<f64>,
        humidity: Option<f64>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let vpd = match (temperature, humidity) {
            (Some(t), Some(rh)) => Some(vpd_kpa(t, rh)),
            _ => None,
        };
        Self {
            temperature,
            humidity,
            vpd,
            timestamp,
        }
    }

    /// Look up a rule parameter by name. Unknown parameters read as missing.
    pub fn get(&self, param: &str) -> Option<f64> {
        match param {
            "temperature" => self.temperature,
            "humidity" => self.humidity,
            "vpd" => self.vpd,
            _ => None,
        }
        .filter(|v| v.is_finite())
    }
}

/// Vapour pressure deficit in kPa (Tetens), rounded to three decimals.
pub fn vpd_kpa(temperature_c: f64, humidity_pct: f64) -> f64 {
    let es = 0.6108 * ((17.27 * temperature_c) / (temperature_c + 237.3)).exp();
    let ea = es * (humidity_pct / 100.0);
    ((es - ea) * 1000.0).round() / 1000.0
}

// ===========================================================================
// Tests
// ===========================================================================
