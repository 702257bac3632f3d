use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

use crate::phase::PhaseState;
use crate::relay::RelayState;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub sensors: HashMap<String, DateTime<Utc>>,
    pub relays: HashMap<String, RelayView>,
    pub phases: BTreeMap<String, PhaseState>,
    pub events: VecDeque<SystemEvent>,
}

/// Last state the hub commanded. The device stays the source of truth.
#[derive(Clone, Serialize)]
pub struct RelayView {
    pub state: RelayState,
    pub last_changed: DateTime<Utc>,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    pub ts: DateTime<Utc>,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Rule,
    Irrigation,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub sensors_last_seen: HashMap<String, DateTime<Utc>>,
    pub relays: HashMap<String, RelayView>,
    pub phases: BTreeMap<String, PhaseState>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            sensors: HashMap::new(),
            relays: HashMap::new(),
            phases: BTreeMap::new(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared() -> SharedState {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Note that a sensor reported in.
    pub fn record_sample(&mut self, sensor_id: &str) {
        self.sensors.insert(sensor_id.to_string(), Utc::now());
    }

    /// Record a rule-driven relay switch.
    pub fn record_switch(&mut self, relay: &str, state: RelayState, detail: String) {
        self.relays.insert(
            relay.to_string(),
            RelayView {
                state,
                last_changed: Utc::now(),
            },
        );
        self.push_event(EventKind::Rule, format!("{relay} set {state}: {detail}"));
    }

    /// Record a completed watering pulse.
    pub fn record_irrigation(&mut self, detail: String) {
        self.push_event(EventKind::Irrigation, detail);
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            sensors_last_seen: self.sensors.clone(),
            relays: self.relays.clone(),
            phases: self.phases.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: Utc::now(),
            kind,
            detail,
        });
    }
}

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}
