//! Irrigation phase controller.
//!
//! Each configured phase (P1, P2, ...) owns a daily time window, a pair of
//! moisture bounds and a cooldown. On every check a phase walks a fixed
//! sequence of gates; the first one that fails ends that phase's turn:
//!
//! 1. enabled and inside its window
//! 2. cooldown since the last pulse has elapsed
//! 3. the actuation lock is free (never waits)
//! 4. moisture is at or below the lower bound (wet and dead-zone skip)
//! 5. the pulse fits under the daily volume cap
//!
//! A pulse is a timed "on" sent to the drip relay; the controller then holds
//! the lock and sleeps for the whole pulse before recording it. The first
//! check of a new calendar day resets every phase's daily counters, and the
//! first check after a window has closed sends that phase's daily summary.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::actuator::{Actuator, Command};
use crate::config::{IrrigationConfig, PhaseConfig};
use crate::lock::ActuationLock;
use crate::notify::Notifier;
use crate::state::SharedState;
use crate::store::{RelayStore, SensorSource, StateStore};

// ---------------------------------------------------------------------------
// Persisted state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseState {
    pub last_trigger: Option<DateTime<Utc>>,
    pub daily_volume_ml: f64,
    pub daily_reset_date: NaiveDate,
    #[serde(default)]
    pub daily_count: u32,
    /// Moisture values the phase observed today, in order.
    #[serde(default)]
    pub moisture_readings: Vec<f64>,
    #[serde(default)]
    pub summary_sent: bool,
}

impl PhaseState {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            last_trigger: None,
            daily_volume_ml: 0.0,
            daily_reset_date: today,
            daily_count: 0,
            moisture_readings: Vec::new(),
            summary_sent: false,
        }
    }

    /// Reset the daily counters if `today` is a new day. Returns true if it did.
    pub fn roll_over(&mut self, today: NaiveDate) -> bool {
        if self.daily_reset_date == today {
            return false;
        }
        self.daily_volume_ml = 0.0;
        self.daily_count = 0;
        self.moisture_readings.clear();
        self.summary_sent = false;
        self.daily_reset_date = today;
        true
    }
}

// ---------------------------------------------------------------------------
// Check outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Disabled,
    OutsideWindow,
    Cooldown { remaining_min: i64 },
    Busy,
    NoData,
    Wet { moisture: f64 },
    DeadZone { moisture: f64 },
    CapReached { planned_ml: f64, today_ml: f64, cap_ml: f64 },
    Failed,
    Watered { volume_ml: f64, moisture: f64 },
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => f.write_str("disabled"),
            Self::OutsideWindow => f.write_str("outside window"),
            Self::Cooldown { remaining_min } => write!(f, "cooldown ({remaining_min} min left)"),
            Self::Busy => f.write_str("actuation busy"),
            Self::NoData => f.write_str("no moisture data"),
            Self::Wet { moisture } => write!(f, "wet ({moisture}%)"),
            Self::DeadZone { moisture } => write!(f, "dead zone ({moisture}%)"),
            Self::CapReached {
                planned_ml,
                today_ml,
                cap_ml,
            } => write!(f, "daily cap ({today_ml} + {planned_ml} > {cap_ml} ml)"),
            Self::Failed => f.write_str("failed"),
            Self::Watered { volume_ml, moisture } => {
                write!(f, "watered {volume_ml} ml at {moisture}%")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

/// Daily report text, or `None` if the phase saw nothing today.
pub fn summary_text(phase: &str, state: &PhaseState) -> Option<String> {
    let readings = &state.moisture_readings;
    if state.daily_count == 0 && readings.is_empty() {
        return None;
    }

    let mut msg = format!(
        "[{phase}] daily report {}\n• pulses: {}\n• total volume: {:.1} ml",
        state.daily_reset_date, state.daily_count, state.daily_volume_ml
    );
    if let Some(last) = readings.last() {
        let min = readings.iter().copied().fold(f64::INFINITY, f64::min);
        let max = readings.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let avg = readings.iter().sum::<f64>() / readings.len() as f64;
        msg.push_str(&format!(
            "\n• last moisture: {last} %\n• moisture min/max: {min} % / {max} %\n• average moisture: {avg:.1} %"
        ));
    }
    Some(msg)
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct PhaseController<Y, S, A, T, N> {
    irrigation: IrrigationConfig,
    phases: Vec<PhaseConfig>,
    relays: Y,
    sensors: S,
    actuator: A,
    store: T,
    notifier: N,
    lock: ActuationLock,
    shared: SharedState,
    states: HashMap<String, PhaseState>,
}

impl<Y, S, A, T, N> PhaseController<Y, S, A, T, N>
where
    Y: RelayStore,
    S: SensorSource,
    A: Actuator,
    T: StateStore,
    N: Notifier,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        irrigation: IrrigationConfig,
        phases: Vec<PhaseConfig>,
        relays: Y,
        sensors: S,
        actuator: A,
        store: T,
        notifier: N,
        lock: ActuationLock,
        shared: SharedState,
    ) -> Self {
        Self {
            irrigation,
            phases,
            relays,
            sensors,
            actuator,
            store,
            notifier,
            lock,
            shared,
            states: HashMap::new(),
        }
    }

    #[cfg(test)]
    pub fn state(&self, phase: &str) -> Option<&PhaseState> {
        self.states.get(phase)
    }

    /// Load persisted state. A store failure falls back to fresh state, which
    /// also resets cooldowns.
    pub async fn restore(&mut self, today: NaiveDate) {
        self.states = match self.store.load().await {
            Ok(s) => {
                info!(phases = s.len(), "phase state restored");
                s
            }
            Err(e) => {
                warn!("loading phase state failed, starting fresh: {e:#}");
                HashMap::new()
            }
        };
        for p in &self.phases {
            self.states
                .entry(p.name.clone())
                .or_insert_with(|| PhaseState::new(today));
        }
        self.publish().await;
    }

    pub async fn persist(&self) {
        if let Err(e) = self.store.save(&self.states).await {
            error!("saving phase state failed: {e:#}");
        }
    }

    /// Run forever: phase checks and periodic state saves on their own timers.
    pub async fn run(mut self, check_every: Duration, save_every: Duration) {
        self.restore(Local::now().date_naive()).await;

        let mut check = tokio::time::interval(check_every);
        check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut save = tokio::time::interval(save_every);
        save.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            phases = self.phases.len(),
            check_min = check_every.as_secs() / 60,
            "phase controller started"
        );

        loop {
            tokio::select! {
                _ = check.tick() => {
                    self.check(Local::now().fixed_offset()).await;
                }
                _ = save.tick() => {
                    self.persist().await;
                }
            }
        }
    }

    /// Check every phase once, in configuration order.
    pub async fn check(&mut self, now: DateTime<FixedOffset>) -> Vec<(String, Outcome)> {
        let today = now.date_naive();

        // ── Daily rollover, before any gate ──────────────────────────
        let mut rolled = false;
        for p in &self.phases {
            let st = self
                .states
                .entry(p.name.clone())
                .or_insert_with(|| PhaseState::new(today));
            rolled |= st.roll_over(today);
        }
        if rolled {
            info!(%today, "new day, daily counters reset");
            self.persist().await;
        }

        let phases = self.phases.clone();
        let mut out = Vec::with_capacity(phases.len());
        for p in &phases {
            self.send_summary_if_due(p, now).await;

            let outcome = self.check_phase(p, now).await;
            match &outcome {
                Outcome::Watered { .. } | Outcome::CapReached { .. } => {
                    info!(phase = %p.name, "{outcome}")
                }
                Outcome::Failed => {}
                _ => debug!(phase = %p.name, "{outcome}"),
            }
            out.push((p.name.clone(), outcome));
        }

        self.publish().await;
        out
    }

    async fn check_phase(&mut self, p: &PhaseConfig, now: DateTime<FixedOffset>) -> Outcome {
        if !p.enabled {
            return Outcome::Disabled;
        }
        if !p.window().contains(now.time()) {
            return Outcome::OutsideWindow;
        }

        let now_utc = now.with_timezone(&Utc);
        if let Some(last) = self.states.get(&p.name).and_then(|s| s.last_trigger) {
            let elapsed = now_utc - last;
            if elapsed < p.cooldown() {
                return Outcome::Cooldown {
                    remaining_min: (p.cooldown() - elapsed).num_minutes(),
                };
            }
        }

        let Some(guard) = self.lock.try_acquire("phase") else {
            return Outcome::Busy;
        };
        debug!(phase = %p.name, holder = guard.holder(), "actuation lock taken");

        let moisture = match self
            .sensors
            .latest_moisture(&self.irrigation.moisture_sensor, self.irrigation.max_data_age())
            .await
        {
            Ok(Some(m)) => m,
            Ok(None) => {
                warn!(
                    phase = %p.name,
                    sensor = %self.irrigation.moisture_sensor,
                    "no recent moisture reading, skipping"
                );
                return Outcome::NoData;
            }
            Err(e) => {
                error!(phase = %p.name, "reading moisture failed: {e:#}");
                return Outcome::NoData;
            }
        };
        if let Some(st) = self.states.get_mut(&p.name) {
            st.moisture_readings.push(moisture);
        }

        if moisture >= p.upper_moisture {
            return Outcome::Wet { moisture };
        }
        if moisture > p.lower_moisture {
            return Outcome::DeadZone { moisture };
        }

        let volume_ml = self.irrigation.pulse_volume_ml(p.duration_min);
        // One drip line: the cap covers what every phase delivered today.
        let today = now.date_naive();
        let today_ml: f64 = self
            .states
            .values()
            .filter(|s| s.daily_reset_date == today)
            .map(|s| s.daily_volume_ml)
            .sum();
        if let Some(cap_ml) = self.irrigation.daily_cap() {
            if today_ml + volume_ml > cap_ml {
                return Outcome::CapReached {
                    planned_ml: volume_ml,
                    today_ml,
                    cap_ml,
                };
            }
        }

        let Some(endpoint) = self.relay_endpoint().await else {
            return Outcome::Failed;
        };

        // ── Pulse ────────────────────────────────────────────────────
        let secs = p.duration_secs();
        if let Err(e) = self.actuator.send(&endpoint, Command::timed_on(secs)).await {
            error!(phase = %p.name, relay = %self.irrigation.relay, "starting pulse failed: {e}");
            let mut st = self.shared.write().await;
            st.record_error(format!("{}: starting pulse failed: {e}", p.name));
            return Outcome::Failed;
        }
        info!(
            phase = %p.name,
            volume_ml,
            duration_sec = secs,
            moisture,
            "pulse started"
        );
        self.notify(&format!(
            "[{}] watering started: {volume_ml} ml ({} min, moisture {moisture}%)",
            p.name, p.duration_min
        ))
        .await;

        tokio::time::sleep(Duration::from_secs(secs)).await;

        if let Some(st) = self.states.get_mut(&p.name) {
            st.daily_volume_ml += volume_ml;
            st.daily_count += 1;
            st.last_trigger = Some(now_utc);
        }
        self.persist().await;
        drop(guard);

        let after = self
            .sensors
            .latest_moisture(&self.irrigation.moisture_sensor, self.irrigation.max_data_age())
            .await
            .ok()
            .flatten();
        let after = after.map_or_else(|| "n/a".to_string(), |m| format!("{m}%"));
        {
            let mut st = self.shared.write().await;
            st.record_irrigation(format!(
                "{}: {volume_ml} ml at {moisture}%, now {after}",
                p.name
            ));
        }
        self.notify(&format!(
            "[{}] watering finished: {volume_ml} ml, moisture before {moisture}%, now {after}",
            p.name
        ))
        .await;

        Outcome::Watered { volume_ml, moisture }
    }

    async fn send_summary_if_due(&mut self, p: &PhaseConfig, now: DateTime<FixedOffset>) {
        if !p.window().has_closed(now.time()) {
            return;
        }
        let Some(st) = self.states.get_mut(&p.name) else {
            return;
        };
        if st.summary_sent {
            return;
        }
        st.summary_sent = true;
        let text = summary_text(&p.name, st);

        match text {
            Some(text) => {
                info!(phase = %p.name, "sending daily report");
                self.notify(&text).await;
            }
            None => debug!(phase = %p.name, "no data for daily report"),
        }
        self.persist().await;
    }

    async fn relay_endpoint(&self) -> Option<String> {
        match self.relays.list().await {
            Ok(relays) => {
                let found = relays
                    .into_iter()
                    .find(|r| r.name == self.irrigation.relay)
                    .map(|r| r.endpoint);
                if found.is_none() {
                    error!(relay = %self.irrigation.relay, "irrigation relay not in registry");
                }
                found
            }
            Err(e) => {
                error!("loading relays failed: {e:#}");
                None
            }
        }
    }

    async fn notify(&self, text: &str) {
        if let Err(e) = self.notifier.send(text).await {
            warn!("notification failed: {e:#}");
        }
    }

    async fn publish(&self) {
        let snapshot: BTreeMap<String, PhaseState> = self
            .states
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        self.shared.write().await.phases = snapshot;
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FakeActuator, MemRelays, MemSensors, MemState, RecordingNotifier};
    use crate::relay::Relay;
    use crate::state::SystemState;
    use chrono::TimeZone;

    fn at(day: u32, h: u32, m: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(2 * 3600)
            .unwrap()
            .with_ymd_and_hms(2025, 6, day, h, m, 0)
            .unwrap()
    }

    fn irrigation() -> IrrigationConfig {
        IrrigationConfig {
            relay: "drip".into(),
            moisture_sensor: "substrate".into(),
            max_data_age_min: 60,
            flow_rate_ml_per_min: 60.0,
            drippers_per_pot: 6,
            pot_count: 5,
            daily_cap_ml: Some(6000.0),
        }
    }

    fn p1() -> PhaseConfig {
        PhaseConfig {
            name: "P1".into(),
            enabled: true,
            start: "06:00".parse().unwrap(),
            end: "10:00".parse().unwrap(),
            lower_moisture: 28.0,
            upper_moisture: 40.0,
            duration_min: 2.0,
            min_time_between_cycles_min: 60.0,
        }
    }

    struct Rig {
        ctl: PhaseController<MemRelays, MemSensors, FakeActuator, MemState, RecordingNotifier>,
        act: FakeActuator,
        sensors: MemSensors,
        store: MemState,
        notes: RecordingNotifier,
        lock: ActuationLock,
    }

    fn rig(phases: Vec<PhaseConfig>, irrigation: IrrigationConfig) -> Rig {
        let act = FakeActuator::default();
        let sensors = MemSensors::default();
        let store = MemState::default();
        let notes = RecordingNotifier::default();
        let lock = ActuationLock::new();
        let ctl = PhaseController::new(
            irrigation,
            phases,
            MemRelays::new(vec![Relay {
                name: "drip".into(),
                endpoint: "10.0.0.20".into(),
            }]),
            sensors.clone(),
            act.clone(),
            store.clone(),
            notes.clone(),
            lock.clone(),
            SystemState::shared(),
        );
        Rig {
            ctl,
            act,
            sensors,
            store,
            notes,
            lock,
        }
    }

    fn outcome(results: &[(String, Outcome)], phase: &str) -> Outcome {
        results
            .iter()
            .find(|(n, _)| n == phase)
            .map(|(_, o)| o.clone())
            .unwrap()
    }

    // -- End-to-end ----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn dry_substrate_triggers_full_pulse() {
        let mut r = rig(vec![p1()], irrigation());
        r.sensors.set_moisture(Some(25.0));
        r.ctl.restore(at(11, 0, 0).date_naive()).await;

        let now = at(11, 7, 0);
        let started = tokio::time::Instant::now();
        let res = r.ctl.check(now).await;

        assert_eq!(
            outcome(&res, "P1"),
            Outcome::Watered {
                volume_ml: 3600.0,
                moisture: 25.0
            }
        );
        assert!(started.elapsed() >= Duration::from_secs(120), "must block for the pulse");
        assert_eq!(
            r.act.commands(),
            vec![("10.0.0.20".to_string(), Command::timed_on(120))]
        );

        let st = r.ctl.state("P1").unwrap();
        assert_eq!(st.daily_volume_ml, 3600.0);
        assert_eq!(st.daily_count, 1);
        assert_eq!(st.last_trigger, Some(now.with_timezone(&Utc)));
        assert!(!r.lock.is_busy());

        let saved = r.store.saved().unwrap();
        assert_eq!(saved["P1"].daily_volume_ml, 3600.0);
        assert_eq!(r.notes.messages().len(), 2);
        assert!(r.notes.messages()[0].contains("3600 ml"));
    }

    #[tokio::test(start_paused = true)]
    async fn lock_is_held_for_the_whole_pulse() {
        let mut r = rig(vec![p1()], irrigation());
        r.sensors.set_moisture(Some(20.0));
        r.ctl.restore(at(11, 0, 0).date_naive()).await;

        let lock = r.lock.clone();
        let probe = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            lock.try_acquire("rules").is_none()
        });
        r.ctl.check(at(11, 7, 0)).await;
        assert!(probe.await.unwrap(), "lock must be held mid-pulse");
    }

    // -- Moisture bands ------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn dead_zone_sequence() {
        let mut phase = p1();
        phase.lower_moisture = 30.0;
        phase.upper_moisture = 40.0;
        let mut r = rig(vec![phase], irrigation());
        r.ctl.restore(at(11, 0, 0).date_naive()).await;

        r.sensors.set_moisture(Some(45.0));
        let res = r.ctl.check(at(11, 7, 0)).await;
        assert_eq!(outcome(&res, "P1"), Outcome::Wet { moisture: 45.0 });

        r.sensors.set_moisture(Some(35.0));
        let res = r.ctl.check(at(11, 7, 5)).await;
        assert_eq!(outcome(&res, "P1"), Outcome::DeadZone { moisture: 35.0 });

        r.sensors.set_moisture(Some(29.0));
        let res = r.ctl.check(at(11, 7, 10)).await;
        assert!(matches!(outcome(&res, "P1"), Outcome::Watered { .. }));
        assert_eq!(r.act.commands().len(), 1);
        assert_eq!(
            r.ctl.state("P1").unwrap().moisture_readings,
            vec![45.0, 35.0, 29.0]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn bounds_are_inclusive_on_the_outside() {
        let mut r = rig(vec![p1()], irrigation());
        r.ctl.restore(at(11, 0, 0).date_naive()).await;

        r.sensors.set_moisture(Some(40.0));
        let res = r.ctl.check(at(11, 7, 0)).await;
        assert_eq!(outcome(&res, "P1"), Outcome::Wet { moisture: 40.0 });

        r.sensors.set_moisture(Some(28.0));
        let res = r.ctl.check(at(11, 7, 5)).await;
        assert!(matches!(outcome(&res, "P1"), Outcome::Watered { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_moisture_skips() {
        let mut r = rig(vec![p1()], irrigation());
        r.ctl.restore(at(11, 0, 0).date_naive()).await;
        let res = r.ctl.check(at(11, 7, 0)).await;
        assert_eq!(outcome(&res, "P1"), Outcome::NoData);
        assert!(r.act.commands().is_empty());
        assert!(!r.lock.is_busy());
    }

    // -- Daily cap -----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn daily_cap_rejects_pulse_and_keeps_total() {
        let mut phase = p1();
        // 60 * 1 * 1 * 5 = 300 ml
        phase.duration_min = 1.0;
        let mut irr = irrigation();
        irr.drippers_per_pot = 1;
        let mut r = rig(vec![phase], irr);

        let mut st = PhaseState::new(at(11, 0, 0).date_naive());
        st.daily_volume_ml = 5800.0;
        r.store.preload(HashMap::from([("P1".to_string(), st)]));
        r.ctl.restore(at(11, 0, 0).date_naive()).await;
        r.sensors.set_moisture(Some(10.0));

        let res = r.ctl.check(at(11, 7, 0)).await;
        assert_eq!(
            outcome(&res, "P1"),
            Outcome::CapReached {
                planned_ml: 300.0,
                today_ml: 5800.0,
                cap_ml: 6000.0
            }
        );
        assert_eq!(r.ctl.state("P1").unwrap().daily_volume_ml, 5800.0);
        assert!(r.act.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn daily_cap_counts_every_phase() {
        let mut p2 = p1();
        p2.name = "P2".into();
        p2.start = "10:00".parse().unwrap();
        p2.end = "16:00".parse().unwrap();
        let mut r = rig(vec![p1(), p2], irrigation());
        r.ctl.restore(at(11, 0, 0).date_naive()).await;
        r.sensors.set_moisture(Some(20.0));

        let res = r.ctl.check(at(11, 7, 0)).await;
        assert!(matches!(outcome(&res, "P1"), Outcome::Watered { .. }));

        let res = r.ctl.check(at(11, 11, 0)).await;
        assert_eq!(
            outcome(&res, "P2"),
            Outcome::CapReached {
                planned_ml: 3600.0,
                today_ml: 3600.0,
                cap_ml: 6000.0
            }
        );
        assert_eq!(r.act.commands().len(), 1);
        assert_eq!(r.ctl.state("P2").unwrap().daily_volume_ml, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn no_cap_means_unlimited() {
        let mut irr = irrigation();
        irr.daily_cap_ml = None;
        let mut r = rig(vec![p1()], irr);
        let mut st = PhaseState::new(at(11, 0, 0).date_naive());
        st.daily_volume_ml = 1_000_000.0;
        r.store.preload(HashMap::from([("P1".to_string(), st)]));
        r.ctl.restore(at(11, 0, 0).date_naive()).await;
        r.sensors.set_moisture(Some(10.0));

        let res = r.ctl.check(at(11, 7, 0)).await;
        assert!(matches!(outcome(&res, "P1"), Outcome::Watered { .. }));
    }

    // -- Gates ---------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn cooldown_blocks_second_pulse() {
        let mut irr = irrigation();
        irr.daily_cap_ml = None;
        let mut r = rig(vec![p1()], irr);
        r.sensors.set_moisture(Some(20.0));
        r.ctl.restore(at(11, 0, 0).date_naive()).await;

        r.ctl.check(at(11, 7, 0)).await;
        let res = r.ctl.check(at(11, 7, 30)).await;
        assert_eq!(outcome(&res, "P1"), Outcome::Cooldown { remaining_min: 30 });

        let res = r.ctl.check(at(11, 8, 0)).await;
        assert!(matches!(outcome(&res, "P1"), Outcome::Watered { .. }));
        assert_eq!(r.act.commands().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn outside_window_and_disabled_skip() {
        let mut off = p1();
        off.name = "P2".into();
        off.enabled = false;
        let mut r = rig(vec![p1(), off], irrigation());
        r.sensors.set_moisture(Some(20.0));
        r.ctl.restore(at(11, 0, 0).date_naive()).await;

        let res = r.ctl.check(at(11, 5, 59)).await;
        assert_eq!(outcome(&res, "P1"), Outcome::OutsideWindow);
        assert_eq!(outcome(&res, "P2"), Outcome::Disabled);
        assert!(r.act.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn busy_lock_skips_without_waiting() {
        let mut r = rig(vec![p1()], irrigation());
        r.sensors.set_moisture(Some(20.0));
        r.ctl.restore(at(11, 0, 0).date_naive()).await;

        let _held = r.lock.try_acquire("rule-engine").unwrap();
        let res = r.ctl.check(at(11, 7, 0)).await;
        assert_eq!(outcome(&res, "P1"), Outcome::Busy);
        assert!(r.act.commands().is_empty());
        assert!(r.ctl.state("P1").unwrap().moisture_readings.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_actuation_changes_nothing() {
        let mut r = rig(vec![p1()], irrigation());
        r.sensors.set_moisture(Some(20.0));
        r.act.fail_commands_to("10.0.0.20");
        r.ctl.restore(at(11, 0, 0).date_naive()).await;

        let res = r.ctl.check(at(11, 7, 0)).await;
        assert_eq!(outcome(&res, "P1"), Outcome::Failed);
        let st = r.ctl.state("P1").unwrap();
        assert_eq!(st.daily_volume_ml, 0.0);
        assert_eq!(st.last_trigger, None);
        assert!(!r.lock.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_irrigation_relay_fails() {
        let mut irr = irrigation();
        irr.relay = "ghost".into();
        let mut r = rig(vec![p1()], irr);
        r.sensors.set_moisture(Some(20.0));
        r.ctl.restore(at(11, 0, 0).date_naive()).await;

        let res = r.ctl.check(at(11, 7, 0)).await;
        assert_eq!(outcome(&res, "P1"), Outcome::Failed);
        assert!(r.act.commands().is_empty());
    }

    // -- Day rollover & persistence ------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn new_day_resets_volume_but_keeps_last_trigger() {
        let mut r = rig(vec![p1()], irrigation());
        let mut st = PhaseState::new(at(10, 0, 0).date_naive());
        st.daily_volume_ml = 6000.0;
        st.daily_count = 2;
        st.last_trigger = Some(at(10, 9, 0).with_timezone(&Utc));
        r.store.preload(HashMap::from([("P1".to_string(), st)]));
        r.ctl.restore(at(10, 0, 0).date_naive()).await;
        r.sensors.set_moisture(Some(20.0));

        let res = r.ctl.check(at(11, 7, 0)).await;
        assert!(matches!(outcome(&res, "P1"), Outcome::Watered { .. }));
        let st = r.ctl.state("P1").unwrap();
        assert_eq!(st.daily_volume_ml, 3600.0);
        assert_eq!(st.daily_count, 1);
        assert_eq!(st.daily_reset_date, at(11, 0, 0).date_naive());
    }

    #[tokio::test(start_paused = true)]
    async fn unreadable_store_falls_back_to_defaults() {
        let mut r = rig(vec![p1()], irrigation());
        r.store.fail_load();
        r.ctl.restore(at(11, 0, 0).date_naive()).await;

        let st = r.ctl.state("P1").unwrap();
        assert_eq!(st.last_trigger, None);
        assert_eq!(st.daily_volume_ml, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn restored_cooldown_survives_restart() {
        let mut r = rig(vec![p1()], irrigation());
        let mut st = PhaseState::new(at(11, 0, 0).date_naive());
        st.last_trigger = Some(at(11, 6, 50).with_timezone(&Utc));
        r.store.preload(HashMap::from([("P1".to_string(), st)]));
        r.ctl.restore(at(11, 0, 0).date_naive()).await;
        r.sensors.set_moisture(Some(20.0));

        let res = r.ctl.check(at(11, 7, 0)).await;
        assert!(matches!(outcome(&res, "P1"), Outcome::Cooldown { .. }));
    }

    // -- Summary -------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn summary_sent_once_after_window_closes() {
        let mut r = rig(vec![p1()], irrigation());
        r.sensors.set_moisture(Some(20.0));
        r.ctl.restore(at(11, 0, 0).date_naive()).await;
        r.ctl.check(at(11, 7, 0)).await;
        let before = r.notes.messages().len();

        r.ctl.check(at(11, 10, 5)).await;
        r.ctl.check(at(11, 10, 10)).await;

        let msgs = r.notes.messages();
        assert_eq!(msgs.len(), before + 1);
        let report = msgs.last().unwrap();
        assert!(report.contains("pulses: 1"), "{report}");
        assert!(report.contains("3600.0 ml"), "{report}");
        assert!(r.ctl.state("P1").unwrap().summary_sent);
    }

    #[test]
    fn summary_statistics() {
        let mut st = PhaseState::new(NaiveDate::from_ymd_opt(2025, 6, 11).unwrap());
        assert_eq!(summary_text("P1", &st), None);

        st.daily_count = 2;
        st.daily_volume_ml = 7200.0;
        st.moisture_readings = vec![30.0, 25.0, 35.0];
        let text = summary_text("P1", &st).unwrap();
        assert!(text.contains("pulses: 2"));
        assert!(text.contains("last moisture: 35 %"));
        assert!(text.contains("min/max: 25 % / 35 %"));
        assert!(text.contains("average moisture: 30.0 %"));
    }

    #[test]
    fn state_reads_camel_case() {
        let st: PhaseState = serde_json::from_str(
            r#"{"lastTrigger":null,"dailyVolumeMl":1200,"dailyResetDate":"2025-06-11"}"#,
        )
        .unwrap();
        assert_eq!(st.daily_volume_ml, 1200.0);
        assert_eq!(st.daily_count, 0);
    }

    #[test]
    fn roll_over_only_on_new_day() {
        let d = NaiveDate::from_ymd_opt(2025, 6, 11).unwrap();
        let mut st = PhaseState::new(d);
        st.daily_volume_ml = 10.0;
        assert!(!st.roll_over(d));
        assert_eq!(st.daily_volume_ml, 10.0);
        assert!(st.roll_over(d.succ_opt().unwrap()));
        assert_eq!(st.daily_volume_ml, 0.0);
    }
}
