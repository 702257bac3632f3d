//! Repository interfaces the engines depend on, and the JSON-file backends
//! shared with the rule/relay editor.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::phase::PhaseState;
use crate::relay::Relay;
use crate::rules::{AuditEntry, Rule};
use crate::sensor::SnapshotMap;

// ---------------------------------------------------------------------------
// Interfaces
// ---------------------------------------------------------------------------

pub trait RuleStore: Send + Sync {
    fn list(&self) -> impl Future<Output = Result<Vec<Rule>>> + Send;
}

pub trait RelayStore: Send + Sync {
    fn list(&self) -> impl Future<Output = Result<Vec<Relay>>> + Send;
}

/// Scheduling state of the irrigation phases, keyed by phase name.
pub trait StateStore: Send + Sync {
    fn load(&self) -> impl Future<Output = Result<HashMap<String, PhaseState>>> + Send;
    fn save(&self, states: &HashMap<String, PhaseState>)
        -> impl Future<Output = Result<()>> + Send;
}

pub trait SensorSource: Send + Sync {
    fn latest_all(&self) -> impl Future<Output = Result<SnapshotMap>> + Send;

    /// Most recent substrate moisture (%) no older than `max_age`.
    fn latest_moisture(
        &self,
        sensor: &str,
        max_age: Duration,
    ) -> impl Future<Output = Result<Option<f64>>> + Send;
}

pub trait AuditSink: Send + Sync {
    fn append(&self, entry: AuditEntry) -> impl Future<Output = Result<()>> + Send;
}

// ---------------------------------------------------------------------------
// JSON helpers
// ---------------------------------------------------------------------------

/// Read a JSON array, decoding each element on its own. A missing file is an
/// empty list; undecodable elements are skipped with a warning.
async fn read_entries<T: DeserializeOwned>(path: &Path, what: &str) -> Result<Vec<T>> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "{what} file missing, treating as empty");
            return Ok(Vec::new());
        }
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read {}", path.display()));
        }
    };
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }

    let values: Vec<serde_json::Value> = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not a JSON array", path.display()))?;

    let mut out = Vec::with_capacity(values.len());
    for (i, v) in values.into_iter().enumerate() {
        match serde_json::from_value::<T>(v) {
            Ok(item) => out.push(item),
            Err(e) => warn!(path = %path.display(), index = i, "skipping malformed {what}: {e}"),
        }
    }
    Ok(out)
}

/// Write via a sibling temp file and rename so readers never see a torn file.
async fn write_atomic(path: &Path, body: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, body)
        .await
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// File stores
// ---------------------------------------------------------------------------

pub struct JsonRuleStore {
    path: PathBuf,
}

impl JsonRuleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RuleStore for JsonRuleStore {
    async fn list(&self) -> Result<Vec<Rule>> {
        read_entries(&self.path, "rule").await
    }
}

pub struct JsonRelayStore {
    path: PathBuf,
}

impl JsonRelayStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RelayStore for JsonRelayStore {
    async fn list(&self) -> Result<Vec<Relay>> {
        read_entries(&self.path, "relay").await
    }
}

/// Append-only switch log, newest entry first, trimmed to `capacity`.
pub struct JsonAuditLog {
    path: PathBuf,
    capacity: usize,
    write: Mutex<()>,
}

impl JsonAuditLog {
    pub fn new(path: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            path: path.into(),
            capacity,
            write: Mutex::new(()),
        }
    }
}

impl AuditSink for JsonAuditLog {
    async fn append(&self, entry: AuditEntry) -> Result<()> {
        let _w = self.write.lock().await;

        let mut entries: Vec<serde_json::Value> = match read_entries(&self.path, "audit entry").await {
            Ok(v) => v,
            Err(e) => {
                warn!("audit log unreadable, starting a new one: {e:#}");
                Vec::new()
            }
        };
        entries.insert(0, serde_json::to_value(&entry).context("failed to encode audit entry")?);
        entries.truncate(self.capacity);

        let body = serde_json::to_vec_pretty(&entries).context("failed to encode audit log")?;
        write_atomic(&self.path, &body).await
    }
}

// ===========================================================================
// Tests
// ===========================================================================
