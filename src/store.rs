//! Fixture and prediction persistence, plus the on-disk JSON snapshot.

use crate::dispatch::subscriber::SubscriberState;
use crate::model::{Fixture, PredictionRecord};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::RwLock;

/// Fixtures whose kickoff is older than this fall out of the active window.
pub const ACTIVE_WINDOW_DAYS: i64 = 7;

/// Superseded predictions kept per fixture.
const PREDICTION_HISTORY: usize = 8;

const SNAPSHOT_VERSION: u32 = 1;

pub trait FixtureStore: Send + Sync {
    fn upsert(&self, fixture: Fixture);
    fn get(&self, fixture_key: &str) -> Option<Fixture>;
    /// Fixtures with kickoff no older than `now - 7 days`, ordered by kickoff.
    fn get_active_window(&self, now: DateTime<Utc>) -> Vec<Fixture>;
}

pub trait PredictionStore: Send + Sync {
    fn put(&self, record: PredictionRecord);
    /// Most recent record for the fixture by `created_at`.
    fn latest_for(&self, fixture_key: &str) -> Option<PredictionRecord>;
}

/// In-memory implementation of both stores.
#[derive(Debug, Default)]
pub struct MemoryStore {
    fixtures: RwLock<BTreeMap<String, Fixture>>,
    predictions: RwLock<BTreeMap<String, Vec<PredictionRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        let store = Self::new();
        for fixture in &snapshot.fixtures {
            store.upsert(fixture.clone());
        }
        for record in &snapshot.predictions {
            store.put(record.clone());
        }
        store
    }

    /// Capture fixtures and predictions (history included) with the given
    /// subscriber state.
    pub fn to_snapshot(&self, subscribers: Vec<SubscriberState>) -> Snapshot {
        let fixtures = self
            .fixtures
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        let predictions = self
            .predictions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .flatten()
            .cloned()
            .collect();
        Snapshot {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            fixtures,
            predictions,
            subscribers,
        }
    }

    pub fn fixture_count(&self) -> usize {
        self.fixtures.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl FixtureStore for MemoryStore {
    fn upsert(&self, fixture: Fixture) {
        let mut fixtures = self.fixtures.write().unwrap_or_else(|e| e.into_inner());
        fixtures.insert(fixture.fixture_key.clone(), fixture);
    }

    fn get(&self, fixture_key: &str) -> Option<Fixture> {
        let fixtures = self.fixtures.read().unwrap_or_else(|e| e.into_inner());
        fixtures.get(fixture_key).cloned()
    }

    fn get_active_window(&self, now: DateTime<Utc>) -> Vec<Fixture> {
        let cutoff = now - Duration::days(ACTIVE_WINDOW_DAYS);
        let fixtures = self.fixtures.read().unwrap_or_else(|e| e.into_inner());
        let mut active: Vec<Fixture> = fixtures
            .values()
            .filter(|f| f.kickoff >= cutoff)
            .cloned()
            .collect();
        active.sort_by(|a, b| {
            a.kickoff
                .cmp(&b.kickoff)
                .then_with(|| a.fixture_key.cmp(&b.fixture_key))
        });
        active
    }
}

impl PredictionStore for MemoryStore {
    fn put(&self, record: PredictionRecord) {
        let mut predictions = self.predictions.write().unwrap_or_else(|e| e.into_inner());
        let history = predictions.entry(record.fixture_key.clone()).or_default();
        history.push(record);
        history.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        if history.len() > PREDICTION_HISTORY {
            let excess = history.len() - PREDICTION_HISTORY;
            history.drain(..excess);
        }
    }

    fn latest_for(&self, fixture_key: &str) -> Option<PredictionRecord> {
        let predictions = self.predictions.read().unwrap_or_else(|e| e.into_inner());
        predictions.get(fixture_key).and_then(|h| h.last()).cloned()
    }
}

// ── Snapshot file ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub fixtures: Vec<Fixture>,
    #[serde(default)]
    pub predictions: Vec<PredictionRecord>,
    #[serde(default)]
    pub subscribers: Vec<SubscriberState>,
}

/// Load a snapshot. A missing file is `Ok(None)`; anything unreadable or
/// from another version is an error.
pub fn load_snapshot(path: &Path) -> Result<Option<Snapshot>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read snapshot: {}", path.display()))?;
    let snapshot: Snapshot = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse snapshot: {}", path.display()))?;
    if snapshot.version != SNAPSHOT_VERSION {
        bail!(
            "snapshot {} has version {}, expected {}",
            path.display(),
            snapshot.version,
            SNAPSHOT_VERSION
        );
    }
    Ok(Some(snapshot))
}

/// Write via a temporary sibling and rename, so readers never see a torn file.
pub fn save_snapshot(path: &Path, snapshot: &Snapshot) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create snapshot dir: {}", dir.display()))?;
    }
    let tmp = path.with_extension("json.tmp");
    let raw = serde_json::to_string_pretty(snapshot)?;
    fs::write(&tmp, raw).with_context(|| format!("Failed to write snapshot: {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("Failed to move snapshot into place: {}", path.display()))?;
    Ok(())
}
