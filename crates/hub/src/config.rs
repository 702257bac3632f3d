//! TOML config file loading and validation: engine timing, actuator policy,
//! file locations, the drip system and the irrigation phases.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::actuator::RetryPolicy;
use crate::window::{TimeOfDay, TimeWindow};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub actuator: ActuatorConfig,
    #[serde(default)]
    pub files: FilesConfig,
    pub irrigation: IrrigationConfig,
    #[serde(default)]
    pub phases: Vec<PhaseConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub rule_tick_sec: u64,
    pub phase_check_min: u64,
    pub state_save_sec: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rule_tick_sec: 5,
            phase_check_min: 5,
            state_save_sec: 300,
        }
    }
}

impl EngineConfig {
    pub fn rule_tick(&self) -> Duration {
        Duration::from_secs(self.rule_tick_sec)
    }

    pub fn phase_check(&self) -> Duration {
        Duration::from_secs(self.phase_check_min * 60)
    }

    pub fn state_save(&self) -> Duration {
        Duration::from_secs(self.state_save_sec)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ActuatorConfig {
    pub timeout_sec: u64,
    pub retries: u32,
    pub backoff_ms: u64,
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            timeout_sec: 5,
            retries: 2,
            backoff_ms: 1000,
        }
    }
}

impl ActuatorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_sec)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.retries,
            backoff: Duration::from_millis(self.backoff_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FilesConfig {
    pub rules: PathBuf,
    pub relays: PathBuf,
    pub audit_log: PathBuf,
    pub audit_capacity: usize,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            rules: "data/relay_rules.json".into(),
            relays: "data/relays.json".into(),
            audit_log: "data/relay_log.json".into(),
            audit_capacity: 5000,
        }
    }
}

/// The drip system shared by every phase.
#[derive(Debug, Clone, Deserialize)]
pub struct IrrigationConfig {
    /// Relay name (from the relay registry) that opens the drip line.
    pub relay: String,
    pub moisture_sensor: String,
    #[serde(default = "default_max_data_age_min")]
    pub max_data_age_min: u64,
    #[serde(default = "default_flow_rate")]
    pub flow_rate_ml_per_min: f64,
    #[serde(default = "default_drippers")]
    pub drippers_per_pot: u32,
    #[serde(default = "default_pots")]
    pub pot_count: u32,
    /// 0 disables the cap.
    #[serde(default = "default_daily_cap")]
    pub daily_cap_ml: Option<f64>,
}

fn default_max_data_age_min() -> u64 {
    60
}
fn default_flow_rate() -> f64 {
    60.0
}
fn default_drippers() -> u32 {
    6
}
fn default_pots() -> u32 {
    5
}
fn default_daily_cap() -> Option<f64> {
    Some(6000.0)
}

impl IrrigationConfig {
    pub fn max_data_age(&self) -> Duration {
        Duration::from_secs(self.max_data_age_min * 60)
    }

    pub fn daily_cap(&self) -> Option<f64> {
        self.daily_cap_ml.filter(|c| *c > 0.0)
    }

    /// Water delivered by one pulse of `duration_min` across all pots.
    pub fn pulse_volume_ml(&self, duration_min: f64) -> f64 {
        self.flow_rate_ml_per_min
            * duration_min
            * f64::from(self.drippers_per_pot)
            * f64::from(self.pot_count)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PhaseConfig {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub start: TimeOfDay,
    pub end: TimeOfDay,
    /// Water at or below this moisture (%).
    pub lower_moisture: f64,
    /// Substrate counts as wet at or above this moisture (%).
    pub upper_moisture: f64,
    pub duration_min: f64,
    pub min_time_between_cycles_min: f64,
}

fn default_enabled() -> bool {
    true
}

impl PhaseConfig {
    pub fn window(&self) -> TimeWindow {
        TimeWindow::new(self.start, self.end)
    }

    pub fn duration_secs(&self) -> u64 {
        (self.duration_min * 60.0).round().max(0.0) as u64
    }

    pub fn cooldown(&self) -> chrono::Duration {
        let secs = (self.min_time_between_cycles_min * 60.0).round() as i64;
        chrono::Duration::try_seconds(secs).unwrap_or(chrono::Duration::MAX)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Upper bound on actuation retries; more would stall a tick for minutes.
const MAX_RETRIES: u32 = 10;

/// Longest allowed gap between pulses of one phase: a full day.
const MAX_COOLDOWN_MIN: f64 = 1440.0;

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_engine(&mut errors);
        self.validate_irrigation(&mut errors);
        self.validate_phases(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_engine(&self, errors: &mut Vec<String>) {
        let e = &self.engine;
        if e.rule_tick_sec == 0 {
            errors.push("engine: rule_tick_sec must be positive".into());
        }
        if e.phase_check_min == 0 {
            errors.push("engine: phase_check_min must be positive".into());
        }
        if e.state_save_sec == 0 {
            errors.push("engine: state_save_sec must be positive".into());
        }

        let a = &self.actuator;
        if a.timeout_sec == 0 {
            errors.push("actuator: timeout_sec must be positive".into());
        }
        if a.retries > MAX_RETRIES {
            errors.push(format!(
                "actuator: retries {} exceeds maximum of {MAX_RETRIES}",
                a.retries
            ));
        }
        if self.files.audit_capacity == 0 {
            errors.push("files: audit_capacity must be positive".into());
        }
    }

    fn validate_irrigation(&self, errors: &mut Vec<String>) {
        let i = &self.irrigation;
        if i.relay.trim().is_empty() {
            errors.push("irrigation: relay is empty".into());
        }
        if i.moisture_sensor.trim().is_empty() {
            errors.push("irrigation: moisture_sensor is empty".into());
        }
        if i.max_data_age_min == 0 {
            errors.push("irrigation: max_data_age_min must be positive".into());
        }
        if !(i.flow_rate_ml_per_min > 0.0) {
            errors.push(format!(
                "irrigation: flow_rate_ml_per_min must be positive, got {}",
                i.flow_rate_ml_per_min
            ));
        }
        if i.drippers_per_pot == 0 {
            errors.push("irrigation: drippers_per_pot must be positive".into());
        }
        if i.pot_count == 0 {
            errors.push("irrigation: pot_count must be positive".into());
        }
        if let Some(cap) = i.daily_cap_ml {
            if !(cap >= 0.0) {
                errors.push(format!("irrigation: daily_cap_ml must not be negative, got {cap}"));
            }
        }
    }

    fn validate_phases(&self, errors: &mut Vec<String>) {
        let mut seen: HashSet<&str> = HashSet::new();

        for (i, p) in self.phases.iter().enumerate() {
            let ctx = || {
                if p.name.trim().is_empty() {
                    format!("phases[{i}]")
                } else {
                    format!("phase '{}'", p.name)
                }
            };

            // ── Identity ────────────────────────────────────────
            if p.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            } else if !seen.insert(&p.name) {
                errors.push(format!("{}: duplicate phase name", ctx()));
            }

            // ── Moisture bands ──────────────────────────────────
            if !(0.0..=100.0).contains(&p.lower_moisture) {
                errors.push(format!(
                    "{}: lower_moisture {} out of range [0, 100]",
                    ctx(),
                    p.lower_moisture
                ));
            }
            if !(0.0..=100.0).contains(&p.upper_moisture) {
                errors.push(format!(
                    "{}: upper_moisture {} out of range [0, 100]",
                    ctx(),
                    p.upper_moisture
                ));
            }
            if p.upper_moisture <= p.lower_moisture {
                errors.push(format!(
                    "{}: upper_moisture ({}) must be greater than lower_moisture ({})",
                    ctx(),
                    p.upper_moisture,
                    p.lower_moisture
                ));
            }

            // ── Timing ──────────────────────────────────────────
            if !(p.duration_min > 0.0) {
                errors.push(format!(
                    "{}: duration_min must be positive, got {}",
                    ctx(),
                    p.duration_min
                ));
            }
            if !(p.min_time_between_cycles_min > 0.0) {
                errors.push(format!(
                    "{}: min_time_between_cycles_min must be positive, got {}",
                    ctx(),
                    p.min_time_between_cycles_min
                ));
            } else if p.min_time_between_cycles_min > MAX_COOLDOWN_MIN {
                errors.push(format!(
                    "{}: min_time_between_cycles_min {} exceeds maximum {MAX_COOLDOWN_MIN}",
                    ctx(),
                    p.min_time_between_cycles_min
                ));
            }
            if p.start == p.end {
                errors.push(format!("{}: start and end are both {}", ctx(), p.start));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
