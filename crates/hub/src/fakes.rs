//! In-memory stand-ins for the stores, the actuator and the notifier.
//! Clones share their contents so tests can inspect what the engines did.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};

use crate::actuator::{Actuator, ActuatorError, Command};
use crate::notify::Notifier;
use crate::phase::PhaseState;
use crate::relay::{Relay, RelayState};
use crate::rules::{AuditEntry, Rule};
use crate::sensor::SnapshotMap;
use crate::store::{AuditSink, RelayStore, RuleStore, SensorSource, StateStore};

// -- Actuator ----------------------------------------------------------------

#[derive(Clone, Default)]
pub struct FakeActuator {
    states: Arc<Mutex<HashMap<String, RelayState>>>,
    commands: Arc<Mutex<Vec<(String, Command)>>>,
    failing: Arc<Mutex<HashSet<String>>>,
    unreachable: Arc<Mutex<HashSet<String>>>,
    queries: Arc<AtomicUsize>,
}

impl FakeActuator {
    pub fn set_state(&self, endpoint: &str, state: RelayState) {
        self.states.lock().unwrap().insert(endpoint.into(), state);
    }

    pub fn state(&self, endpoint: &str) -> Option<RelayState> {
        self.states.lock().unwrap().get(endpoint).copied()
    }

    pub fn fail_commands_to(&self, endpoint: &str) {
        self.failing.lock().unwrap().insert(endpoint.into());
    }

    pub fn set_unreachable(&self, endpoint: &str) {
        self.unreachable.lock().unwrap().insert(endpoint.into());
    }

    /// Commands that were accepted, in order.
    pub fn commands(&self) -> Vec<(String, Command)> {
        self.commands.lock().unwrap().clone()
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

impl Actuator for FakeActuator {
    async fn send(&self, endpoint: &str, cmd: Command) -> Result<(), ActuatorError> {
        if self.failing.lock().unwrap().contains(endpoint) {
            return Err(ActuatorError::Status(500));
        }
        self.commands.lock().unwrap().push((endpoint.into(), cmd));
        self.set_state(endpoint, cmd.state);
        Ok(())
    }

    async fn query_state(&self, endpoint: &str) -> Result<RelayState, ActuatorError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.lock().unwrap().contains(endpoint) {
            return Err(ActuatorError::Transport("unreachable".into()));
        }
        Ok(self.state(endpoint).unwrap_or(RelayState::Off))
    }
}

// -- Rule / relay stores -----------------------------------------------------

#[derive(Clone)]
pub struct MemRules(Arc<Vec<Rule>>);

impl MemRules {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self(Arc::new(rules))
    }
}

impl RuleStore for MemRules {
    async fn list(&self) -> Result<Vec<Rule>> {
        Ok(self.0.as_ref().clone())
    }
}

#[derive(Clone)]
pub struct MemRelays(Arc<Vec<Relay>>);

impl MemRelays {
    pub fn new(relays: Vec<Relay>) -> Self {
        Self(Arc::new(relays))
    }
}

impl RelayStore for MemRelays {
    async fn list(&self) -> Result<Vec<Relay>> {
        Ok(self.0.as_ref().clone())
    }
}

// -- Sensors -----------------------------------------------------------------

#[derive(Clone, Default)]
pub struct MemSensors {
    snapshot: Arc<Mutex<SnapshotMap>>,
    moisture: Arc<Mutex<Option<f64>>>,
}

impl MemSensors {
    pub fn with_snapshot(snapshot: SnapshotMap) -> Self {
        let s = Self::default();
        *s.snapshot.lock().unwrap() = snapshot;
        s
    }

    pub fn set_moisture(&self, value: Option<f64>) {
        *self.moisture.lock().unwrap() = value;
    }
}

impl SensorSource for MemSensors {
    async fn latest_all(&self) -> Result<SnapshotMap> {
        Ok(self.snapshot.lock().unwrap().clone())
    }

    async fn latest_moisture(&self, _sensor: &str, _max_age: Duration) -> Result<Option<f64>> {
        Ok(*self.moisture.lock().unwrap())
    }
}

// -- Audit -------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct MemAudit(Arc<Mutex<Vec<AuditEntry>>>);

impl MemAudit {
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.0.lock().unwrap().clone()
    }
}

impl AuditSink for MemAudit {
    async fn append(&self, entry: AuditEntry) -> Result<()> {
        self.0.lock().unwrap().insert(0, entry);
        Ok(())
    }
}

// -- Phase state ---------------------------------------------------------------

#[derive(Clone, Default)]
pub struct MemState {
    loaded: Arc<Mutex<HashMap<String, PhaseState>>>,
    saved: Arc<Mutex<Option<HashMap<String, PhaseState>>>>,
    fail_load: Arc<AtomicBool>,
}

impl MemState {
    pub fn preload(&self, states: HashMap<String, PhaseState>) {
        *self.loaded.lock().unwrap() = states;
    }

    pub fn fail_load(&self) {
        self.fail_load.store(true, Ordering::SeqCst);
    }

    /// The last map handed to `save`, if any.
    pub fn saved(&self) -> Option<HashMap<String, PhaseState>> {
        self.saved.lock().unwrap().clone()
    }
}

impl StateStore for MemState {
    async fn load(&self) -> Result<HashMap<String, PhaseState>> {
        if self.fail_load.load(Ordering::SeqCst) {
            bail!("state store unavailable");
        }
        Ok(self.loaded.lock().unwrap().clone())
    }

    async fn save(&self, states: &HashMap<String, PhaseState>) -> Result<()> {
        *self.saved.lock().unwrap() = Some(states.clone());
        Ok(())
    }
}

// -- Notifier ----------------------------------------------------------------

#[derive(Clone, Default)]
pub struct RecordingNotifier(Arc<Mutex<Vec<String>>>);

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    async fn send(&self, text: &str) -> Result<()> {
        self.0.lock().unwrap().push(text.to_string());
        Ok(())
    }
}
