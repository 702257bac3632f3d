//! Rule engine: maps sensor snapshots to relay actions.
//!
//! Every tick loads the rule set, the relay registry and the latest sensor
//! snapshot, evaluates each enabled rule inside its time window, resolves
//! one desired state per relay, and only then reconciles that desired state
//! against what each relay reports. The device is the source of truth; the
//! engine keeps nothing between ticks.
//!
//! ## Conflict resolution
//!
//! When several rules fire for the same relay in one tick, `on` beats `off`
//! regardless of declaration order. Between two `off` proposals the first
//! one declared is kept.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Local, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::actuator::{Actuator, Command};
use crate::condition::{evaluate, Condition, Logic};
use crate::lock::ActuationLock;
use crate::relay::RelayState;
use crate::sensor::SnapshotMap;
use crate::state::SharedState;
use crate::store::{AuditSink, RelayStore, RuleStore, SensorSource};
use crate::window::in_window;

// ---------------------------------------------------------------------------
// Rule model
// ---------------------------------------------------------------------------

fn enabled_by_default() -> bool {
    true
}

/// A rule as written by the rule editor. Older rules name a single `relay`
/// and carry a rule-wide `logic`; both are still honoured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub relays: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay: Option<String>,
    pub action: RelayState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logic: Option<Logic>,
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub active_from: Option<String>,
    #[serde(default)]
    pub active_to: Option<String>,
}

impl Rule {
    /// Relay names this rule drives, in declaration order, without duplicates.
    pub fn targets(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        let single = self.relay.as_deref().into_iter();
        for name in self.relays.iter().map(String::as_str).chain(single) {
            if !name.trim().is_empty() && !out.contains(&name) {
                out.push(name);
            }
        }
        out
    }

    pub fn label(&self) -> String {
        match &self.name {
            Some(n) if !n.trim().is_empty() => n.clone(),
            _ => format!("[{}] {}", self.targets().join(", "), self.action),
        }
    }

    /// Reject rules the engine cannot act on.
    pub fn check(&self) -> Result<(), String> {
        if self.conditions.is_empty() {
            return Err("rule has no conditions".into());
        }
        if self.targets().is_empty() {
            return Err("rule targets no relay".into());
        }
        Ok(())
    }

    /// Split conditions into AND-groups. A condition whose join is OR starts
    /// a new group; conditions without their own flag use the rule-wide
    /// logic, which defaults to AND.
    pub fn groups(&self) -> Vec<&[Condition]> {
        let default = self.logic.unwrap_or(Logic::And);
        let mut groups = Vec::new();
        let mut start = 0;

        for (i, c) in self.conditions.iter().enumerate().skip(1) {
            if c.logic.unwrap_or(default) == Logic::Or {
                groups.push(&self.conditions[start..i]);
                start = i;
            }
        }
        if start < self.conditions.len() {
            groups.push(&self.conditions[start..]);
        }
        groups
    }

    fn source_sensors(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for c in &self.conditions {
            if !out.contains(&c.sensor) {
                out.push(c.sensor.clone());
            }
        }
        out
    }
}

/// Result of evaluating one rule against one snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub fired: bool,
    /// Passing groups, each rendered as "a AND b", joined with " OR ".
    pub explanation: String,
}

/// Evaluate a rule's condition groups. `current` selects the hysteresis
/// branch: `On` widens thresholds to hold a state the rule already produced,
/// `Off` is strict. Callers pass `Off` whenever the real state is unknown.
pub fn evaluate_rule(rule: &Rule, snapshot: &SnapshotMap, current: RelayState) -> Verdict {
    let mut passing = Vec::new();

    for group in rule.groups() {
        let mut descs = Vec::with_capacity(group.len());
        let mut all = true;
        for cond in group {
            let actual = snapshot.get(&cond.sensor).and_then(|s| s.get(&cond.param));
            if actual.is_none() {
                debug!(
                    rule = %rule.label(),
                    sensor = %cond.sensor,
                    param = %cond.param,
                    "no sensor value, condition is false"
                );
            }
            if evaluate(actual, cond, current) {
                descs.push(cond.describe(actual));
            } else {
                all = false;
                break;
            }
        }
        if all {
            passing.push(descs.join(" AND "));
        }
    }

    Verdict {
        fired: !passing.is_empty(),
        explanation: passing.join(" OR "),
    }
}

// ---------------------------------------------------------------------------
// Pending actuations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct PendingActuation {
    pub action: RelayState,
    pub rule: Rule,
    pub explanation: String,
}

/// Record a rule's proposal for `relay`, applying on-wins priority.
pub fn propose(
    pending: &mut BTreeMap<String, PendingActuation>,
    relay: &str,
    candidate: PendingActuation,
) {
    match pending.get(relay) {
        Some(existing) if existing.action == RelayState::On => {}
        Some(_) if candidate.action == RelayState::Off => {}
        _ => {
            pending.insert(relay.to_string(), candidate);
        }
    }
}

// ---------------------------------------------------------------------------
// Audit entries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub relay: String,
    pub ip: String,
    pub state: RelayState,
    pub source_sensors: Vec<String>,
    pub conditions: Vec<Condition>,
    pub active_from: Option<String>,
    pub active_to: Option<String>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub checked: usize,
    pub fired: usize,
    pub switched: usize,
    pub failed: usize,
    /// The actuation lock was held elsewhere; nothing was evaluated.
    pub busy: bool,
}

pub struct RuleEngine<R, Y, S, A, L> {
    rules: R,
    relays: Y,
    sensors: S,
    actuator: A,
    audit: L,
    lock: ActuationLock,
    shared: SharedState,
}

impl<R, Y, S, A, L> RuleEngine<R, Y, S, A, L>
where
    R: RuleStore,
    Y: RelayStore,
    S: SensorSource,
    A: Actuator,
    L: AuditSink,
{
    pub fn new(
        rules: R,
        relays: Y,
        sensors: S,
        actuator: A,
        audit: L,
        lock: ActuationLock,
        shared: SharedState,
    ) -> Self {
        Self {
            rules,
            relays,
            sensors,
            actuator,
            audit,
            lock,
            shared,
        }
    }

    /// Run forever on a fixed interval. Intended to be `tokio::spawn`-ed.
    pub async fn run(self, every: Duration) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(tick_sec = every.as_secs(), "rule engine started");
        {
            let mut st = self.shared.write().await;
            st.record_system(format!("rule engine started (every {}s)", every.as_secs()));
        }

        let mut n: u64 = 0;
        loop {
            ticker.tick().await;
            n += 1;
            let report = self.tick(Local::now().fixed_offset()).await;
            debug!(
                tick = n,
                checked = report.checked,
                fired = report.fired,
                switched = report.switched,
                failed = report.failed,
                busy = report.busy,
                "rule engine tick done"
            );
        }
    }

    /// One evaluation and reconciliation pass.
    pub async fn tick(&self, now: DateTime<FixedOffset>) -> TickReport {
        let mut report = TickReport::default();

        // ── Inputs (read-only) ───────────────────────────────────────
        let rules = match self.rules.list().await {
            Ok(r) => r,
            Err(e) => {
                error!("rule engine: loading rules failed: {e:#}");
                return report;
            }
        };
        let registry = match self.relays.list().await {
            Ok(r) => r,
            Err(e) => {
                error!("rule engine: loading relays failed: {e:#}");
                return report;
            }
        };
        let snapshot = match self.sensors.latest_all().await {
            Ok(s) => s,
            Err(e) => {
                error!("rule engine: loading sensor snapshot failed: {e:#}");
                return report;
            }
        };
        let endpoints: HashMap<&str, &str> = registry
            .iter()
            .map(|r| (r.name.as_str(), r.endpoint.as_str()))
            .collect();

        // ── Exclusive for the rest of the pass ───────────────────────
        let Some(guard) = self.lock.try_acquire("rule-engine") else {
            debug!("rule engine: actuation busy, skipping tick");
            report.busy = true;
            return report;
        };
        debug!(holder = guard.holder(), "actuation lock taken");

        // ── Evaluate ─────────────────────────────────────────────────
        let mut observed: HashMap<String, Option<RelayState>> = HashMap::new();
        let mut pending: BTreeMap<String, PendingActuation> = BTreeMap::new();

        for rule in &rules {
            if !rule.enabled {
                debug!(rule = %rule.label(), "rule disabled, skipped");
                continue;
            }
            if let Err(reason) = rule.check() {
                warn!(rule = %rule.label(), "skipping malformed rule: {reason}");
                continue;
            }
            if !in_window(
                now.time(),
                rule.active_from.as_deref(),
                rule.active_to.as_deref(),
            ) {
                debug!(rule = %rule.label(), "outside time window, skipped");
                continue;
            }
            report.checked += 1;

            // The band only widens while every target already holds the
            // state this rule drives toward.
            let targets = rule.targets();
            let mut holding = true;
            for name in &targets {
                let state = self.observe(&mut observed, &endpoints, name).await;
                holding &= state == Some(rule.action);
            }
            let current = if holding {
                RelayState::On
            } else {
                RelayState::Off
            };

            let verdict = evaluate_rule(rule, &snapshot, current);
            if !verdict.fired {
                debug!(rule = %rule.label(), action = %rule.action, "conditions not met");
                continue;
            }
            report.fired += 1;

            for name in targets {
                propose(
                    &mut pending,
                    name,
                    PendingActuation {
                        action: rule.action,
                        rule: rule.clone(),
                        explanation: verdict.explanation.clone(),
                    },
                );
            }
        }

        // ── Reconcile ────────────────────────────────────────────────
        for (name, p) in &pending {
            let Some(endpoint) = endpoints.get(name.as_str()).copied() else {
                warn!(relay = %name, "no endpoint registered for relay");
                continue;
            };

            let actual = self.observe(&mut observed, &endpoints, name).await;
            if actual == Some(p.action) {
                debug!(relay = %name, state = %p.action, "already in desired state");
                continue;
            }

            match self.actuator.send(endpoint, Command::set(p.action)).await {
                Ok(()) => {
                    report.switched += 1;
                    info!(
                        relay = %name,
                        state = %p.action,
                        rule = %p.rule.label(),
                        "switched: {}",
                        p.explanation
                    );
                    self.write_audit(name, endpoint, p, now).await;
                    let mut st = self.shared.write().await;
                    st.record_switch(name, p.action, format!("{}: {}", p.rule.label(), p.explanation));
                }
                Err(e) => {
                    report.failed += 1;
                    error!(relay = %name, state = %p.action, "switching failed: {e}");
                    let mut st = self.shared.write().await;
                    st.record_error(format!("{name}: switching {} failed: {e}", p.action));
                }
            }
        }

        report
    }

    /// Query a relay once per tick; `None` means unknown.
    async fn observe(
        &self,
        cache: &mut HashMap<String, Option<RelayState>>,
        endpoints: &HashMap<&str, &str>,
        name: &str,
    ) -> Option<RelayState> {
        if let Some(state) = cache.get(name) {
            return *state;
        }
        let state = match endpoints.get(name) {
            Some(endpoint) => match self.actuator.query_state(endpoint).await {
                Ok(s) => Some(s),
                Err(e) => {
                    warn!(relay = %name, "status query failed: {e}");
                    None
                }
            },
            None => None,
        };
        cache.insert(name.to_string(), state);
        state
    }

    async fn write_audit(
        &self,
        relay: &str,
        endpoint: &str,
        p: &PendingActuation,
        now: DateTime<FixedOffset>,
    ) {
        let entry = AuditEntry {
            timestamp: now.with_timezone(&Utc),
            relay: relay.to_string(),
            ip: endpoint.to_string(),
            state: p.action,
            source_sensors: p.rule.source_sensors(),
            conditions: p.rule.conditions.clone(),
            active_from: p.rule.active_from.clone(),
            active_to: p.rule.active_to.clone(),
        };
        if let Err(e) = self.audit.append(entry).await {
            error!(relay, "writing audit entry failed: {e:#}");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
