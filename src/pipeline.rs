//! Job scheduling: ingest, predict and dispatch on independent cadences.
//!
//! Each job runs in its own task on a `tokio::time::interval` with skipped
//! missed ticks, so a job never overlaps with itself. Ingest publishes the set
//! of changed fixture keys; Predict wakes on that event as well as on its own
//! interval. Configuration is read through a `watch` channel so a reload is
//! picked up by the next job run.

use crate::config::Config;
use crate::dispatch::adapter::{build_adapter, SharedAdapter};
use crate::dispatch::{DispatchReport, Dispatcher};
use crate::engine::{self, EngineSettings};
use crate::error::{EngineError, ProviderError};
use crate::feed::{build_providers, SharedProvider};
use crate::form_cache::{FormCache, FormSettings};
use crate::health::{self, Health, JobOutcome, PipelineCounters};
use crate::ingest::teams::TeamResolver;
use crate::ingest::{FixtureIngestor, IngestReport};
use crate::model::{Fixture, FixtureStatus, MarketOdds, PredictionRecord};
use crate::store::{load_snapshot, save_snapshot, FixtureStore, MemoryStore, PredictionStore, Snapshot};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

/// Pending `fixtures_refreshed` events; further events coalesce.
const EVENT_BUFFER: usize = 4;

pub const JOB_INGEST: &str = "ingest";
pub const JOB_PREDICT: &str = "predict";
pub const JOB_DISPATCH: &str = "dispatch";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PredictReport {
    pub candidates: usize,
    pub produced: usize,
    /// Identical to the latest stored record; not stored again.
    pub unchanged: usize,
    pub skipped: usize,
    pub degraded_forms: usize,
    pub market_odds: usize,
}

/// Maps a job's report onto the health/exit-code outcome.
pub trait JobReport {
    fn outcome(&self) -> JobOutcome;
}

impl JobReport for IngestReport {
    fn outcome(&self) -> JobOutcome {
        if !self.degraded {
            JobOutcome::Ok
        } else if self.calls > 0 && self.failed_calls == self.calls {
            JobOutcome::Failed
        } else {
            JobOutcome::Partial
        }
    }
}

impl JobReport for PredictReport {
    fn outcome(&self) -> JobOutcome {
        if self.degraded_forms > 0 {
            JobOutcome::Partial
        } else {
            JobOutcome::Ok
        }
    }
}

impl JobReport for DispatchReport {
    fn outcome(&self) -> JobOutcome {
        if self.failed == 0 {
            JobOutcome::Ok
        } else if self.sent > 0 {
            JobOutcome::Partial
        } else {
            JobOutcome::Failed
        }
    }
}

pub struct Orchestrator {
    config: watch::Receiver<Arc<Config>>,
    providers: Vec<SharedProvider>,
    store: Arc<MemoryStore>,
    form_cache: FormCache,
    ingestor: FixtureIngestor,
    dispatcher: Dispatcher,
    health: Arc<Health>,
    persist_lock: tokio::sync::Mutex<()>,
}

impl Orchestrator {
    /// Build providers, the messaging adapter and the stores from the current
    /// configuration. A configured snapshot that cannot be read is fatal.
    pub fn build(config: watch::Receiver<Arc<Config>>, health: Arc<Health>) -> Result<Self> {
        let current = config.borrow().clone();
        let providers = build_providers(&current, &health)?;
        let adapter = build_adapter(&current.messaging)?;
        let snapshot = match &current.storage.snapshot_path {
            Some(path) => load_snapshot(path)?,
            None => None,
        };
        if let Some(snapshot) = &snapshot {
            tracing::info!(
                fixtures = snapshot.fixtures.len(),
                predictions = snapshot.predictions.len(),
                subscribers = snapshot.subscribers.len(),
                saved_at = %snapshot.saved_at,
                "resumed from snapshot"
            );
        }
        Ok(Self::from_parts(config, providers, adapter, snapshot, health))
    }

    /// Assemble from ready-made parts. `providers` must be sorted by precedence.
    pub fn from_parts(
        config: watch::Receiver<Arc<Config>>,
        providers: Vec<SharedProvider>,
        adapter: SharedAdapter,
        snapshot: Option<Snapshot>,
        health: Arc<Health>,
    ) -> Self {
        let current = config.borrow().clone();
        let (store, states) = match snapshot {
            Some(snapshot) => (MemoryStore::from_snapshot(&snapshot), snapshot.subscribers),
            None => (MemoryStore::new(), Vec::new()),
        };
        let store = Arc::new(store);
        health.attach_providers(&providers);
        let form_cache = FormCache::new(
            providers.clone(),
            TeamResolver::new(&current.teams),
            health.clone(),
        );
        let ingestor = FixtureIngestor::new(providers.clone(), store.clone(), health.clone());
        let dispatcher = Dispatcher::with_states(adapter, health.clone(), states);
        Self {
            config,
            providers,
            store,
            form_cache,
            ingestor,
            dispatcher,
            health,
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.borrow().clone()
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn health(&self) -> &Arc<Health> {
        &self.health
    }

    pub fn form_cache(&self) -> &FormCache {
        &self.form_cache
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    // ── Jobs ─────────────────────────────────────────────────────────

    pub async fn ingest_once(&self, now: DateTime<Utc>) -> IngestReport {
        let config = self.config();
        let report = self.ingestor.run(&config, now).await;
        self.health.record_job(JOB_INGEST, report.outcome());
        report
    }

    /// Predict every SCHEDULED fixture whose kickoff falls in
    /// `[now + lead, now + horizon]`. Records are stored only once every
    /// fixture has been processed.
    pub async fn predict_once(&self, now: DateTime<Utc>) -> PredictReport {
        let config = self.config();
        let lead = now + chrono::Duration::minutes(config.predict_lead_minutes);
        let horizon = now + chrono::Duration::hours(config.predict_horizon_hours);
        let fixtures: Vec<Fixture> = self
            .store
            .get_active_window(now)
            .into_iter()
            .filter(|f| f.status == FixtureStatus::Scheduled)
            .filter(|f| f.kickoff >= lead && f.kickoff <= horizon)
            .filter(|f| config.competition(&f.competition_id).is_some())
            .collect();

        let settings = FormSettings::new(config.form_ttl_seconds, config.form_window);
        let tasks = fixtures
            .iter()
            .map(|fixture| self.predict_fixture(&config, fixture, &settings, now));
        let results = join_all(tasks).await;

        let mut report = PredictReport {
            candidates: fixtures.len(),
            ..PredictReport::default()
        };
        let mut records = Vec::new();
        for result in results {
            match result {
                Ok(prediction) => {
                    report.degraded_forms += prediction.degraded_forms;
                    if prediction.record.market_odds.is_some() {
                        report.market_odds += 1;
                    }
                    let latest = self.store.latest_for(&prediction.record.fixture_key);
                    if latest.is_some_and(|l| same_prediction(&l, &prediction.record)) {
                        report.unchanged += 1;
                    } else {
                        records.push(prediction.record);
                    }
                }
                Err(e) => {
                    report.skipped += 1;
                    tracing::warn!(error = %e, "fixture skipped by engine");
                }
            }
        }
        report.produced = records.len();
        for record in records {
            self.store.put(record);
        }

        let counters = &self.health.counters;
        PipelineCounters::add(&counters.predictions_made, report.produced as u64);
        PipelineCounters::add(&counters.predictions_skipped, report.skipped as u64);
        tracing::info!(
            candidates = report.candidates,
            produced = report.produced,
            unchanged = report.unchanged,
            skipped = report.skipped,
            degraded_forms = report.degraded_forms,
            "predict run complete"
        );
        self.health.record_job(JOB_PREDICT, report.outcome());
        report
    }

    async fn predict_fixture(
        &self,
        config: &Config,
        fixture: &Fixture,
        settings: &FormSettings,
        now: DateTime<Utc>,
    ) -> Result<FixturePrediction, EngineError> {
        let mut fixture = fixture.clone();
        if config.fetch_market_odds {
            if let Some(odds) = self.market_odds(&fixture).await {
                fixture.market_odds = Some(odds);
            }
        }
        let (home, away) = futures_util::join!(
            self.form_cache.get(&fixture.home, settings, now),
            self.form_cache.get(&fixture.away, settings, now)
        );
        let engine_settings = EngineSettings::for_competition(config, &fixture.competition_id);
        let record = engine::predict(&fixture, &home, &away, &engine_settings, now)?;
        Ok(FixturePrediction {
            record,
            degraded_forms: usize::from(home.degraded) + usize::from(away.degraded),
        })
    }

    /// First provider, in precedence order, with a complete 1X2 market.
    async fn market_odds(&self, fixture: &Fixture) -> Option<MarketOdds> {
        for provider in &self.providers {
            if !provider.supports_competition(&fixture.competition_id) {
                continue;
            }
            match provider.get_market_odds(fixture).await {
                Ok(Some(odds)) => return Some(odds),
                Ok(None) | Err(ProviderError::Unsupported { .. }) => {}
                Err(e) if e.is_rejection() => {
                    tracing::error!(provider = provider.name(), fixture_key = %fixture.fixture_key, error = %e, "odds request rejected");
                }
                Err(e) => {
                    tracing::debug!(provider = provider.name(), fixture_key = %fixture.fixture_key, error = %e, "market odds unavailable");
                }
            }
        }
        None
    }

    /// Hand the latest record of every upcoming SCHEDULED fixture to the
    /// dispatcher.
    pub async fn dispatch_once(&self, now: DateTime<Utc>) -> DispatchReport {
        let config = self.config();
        let records: Vec<PredictionRecord> = self
            .store
            .get_active_window(now)
            .into_iter()
            .filter(|f| f.status == FixtureStatus::Scheduled && f.kickoff > now)
            .filter_map(|f| self.store.latest_for(&f.fixture_key))
            .collect();
        let report = self.dispatcher.dispatch(&config, &records, now).await;
        self.health.record_job(JOB_DISPATCH, report.outcome());
        report
    }

    /// Write the snapshot file, when one is configured.
    pub async fn persist(&self) -> Result<()> {
        let config = self.config();
        let Some(path) = config.storage.snapshot_path.clone() else {
            return Ok(());
        };
        let _guard = self.persist_lock.lock().await;
        let snapshot = self.store.to_snapshot(self.dispatcher.states().await);
        tokio::task::spawn_blocking(move || save_snapshot(&path, &snapshot))
            .await
            .context("snapshot writer panicked")??;
        Ok(())
    }

    async fn persist_logged(&self) {
        if let Err(e) = self.persist().await {
            tracing::error!("snapshot save failed: {:#}", e);
        }
    }

    // ── Scheduling ───────────────────────────────────────────────────

    /// Run all jobs until `shutdown` flips to true, then give running jobs
    /// the grace period before cancelling them.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<()> {
        let config = self.config();
        let (refreshed_tx, refreshed_rx) = mpsc::channel(EVENT_BUFFER);

        let mut handles = vec![
            tokio::spawn(self.clone().ingest_loop(
                seconds(config.ingest_interval_seconds),
                refreshed_tx,
                shutdown.clone(),
            )),
            tokio::spawn(self.clone().predict_loop(
                seconds(config.predict_interval_seconds),
                refreshed_rx,
                shutdown.clone(),
            )),
            tokio::spawn(self.clone().dispatch_loop(
                seconds(config.dispatch_interval_seconds),
                shutdown.clone(),
            )),
        ];
        if let Some(listen) = config.health.listen.clone() {
            let health = self.health.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = health::serve(&listen, health, shutdown).await {
                    tracing::error!("health endpoint: {:#}", e);
                }
            }));
        }
        tracing::info!(
            providers = self.providers.len(),
            subscribers = config.subscribers.len(),
            ingest_every = config.ingest_interval_seconds,
            predict_every = config.predict_interval_seconds,
            dispatch_every = config.dispatch_interval_seconds,
            "orchestrator started"
        );

        let mut shutdown = shutdown;
        stopped(&mut shutdown).await;
        let grace = seconds(self.config().shutdown_grace_seconds);
        tracing::info!(grace_seconds = grace.as_secs(), "shutdown requested, waiting for running jobs");

        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        if tokio::time::timeout(grace, join_all(handles)).await.is_err() {
            tracing::warn!("grace period elapsed, cancelling in-flight jobs");
            for abort in aborts {
                abort.abort();
            }
        }
        self.persist_logged().await;
        tracing::info!("orchestrator stopped");
        Ok(())
    }

    async fn ingest_loop(
        self: Arc<Self>,
        every: Duration,
        events: mpsc::Sender<BTreeSet<String>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = stopped(&mut shutdown) => break,
                _ = interval.tick() => {}
            }
            let report = self.ingest_once(Utc::now()).await;
            self.persist_logged().await;
            if report.changed_keys.is_empty() {
                continue;
            }
            match events.try_send(report.changed_keys) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::debug!("predict already has refresh events pending");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            }
        }
    }

    async fn predict_loop(
        self: Arc<Self>,
        every: Duration,
        mut events: mpsc::Receiver<BTreeSet<String>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = stopped(&mut shutdown) => break,
                Some(keys) = events.recv() => {
                    let mut changed = keys.len();
                    while let Ok(more) = events.try_recv() {
                        changed += more.len();
                    }
                    tracing::debug!(changed, "fixtures refreshed, predicting");
                }
                _ = interval.tick() => {}
            }
            self.predict_once(Utc::now()).await;
            self.persist_logged().await;
        }
    }

    async fn dispatch_loop(self: Arc<Self>, every: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = stopped(&mut shutdown) => break,
                _ = interval.tick() => {}
            }
            self.dispatch_once(Utc::now()).await;
            self.persist_logged().await;
        }
    }
}

struct FixturePrediction {
    record: PredictionRecord,
    degraded_forms: usize,
}

/// Same inputs and outputs, ignoring `created_at`.
fn same_prediction(a: &PredictionRecord, b: &PredictionRecord) -> bool {
    a.engine_version == b.engine_version
        && a.kickoff == b.kickoff
        && a.home_form_hash == b.home_form_hash
        && a.away_form_hash == b.away_form_hash
        && a.market_odds == b.market_odds
        && a.probabilities == b.probabilities
}

fn seconds(n: u64) -> Duration {
    Duration::from_secs(n.max(1))
}

/// Resolves once shutdown is requested. A dropped sender counts as a request.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

// ── Configuration reload ─────────────────────────────────────────────

/// Re-read `path` and publish it. An invalid file leaves the current
/// configuration in place.
pub fn reload_config(path: &Path, config: &watch::Sender<Arc<Config>>) -> Result<()> {
    let next = Config::load(path)?;
    let current = config.borrow().clone();
    let names = |c: &Config| c.providers.iter().map(|p| p.name.clone()).collect::<BTreeSet<_>>();
    if names(&current) != names(&next) {
        tracing::warn!("provider set changed; takes effect after restart");
    }
    if current.ingest_interval_seconds != next.ingest_interval_seconds
        || current.predict_interval_seconds != next.predict_interval_seconds
        || current.dispatch_interval_seconds != next.dispatch_interval_seconds
    {
        tracing::warn!("job intervals changed; take effect after restart");
    }
    config.send_replace(Arc::new(next));
    tracing::info!(path = %path.display(), "configuration reloaded");
    Ok(())
}

/// Reload the configuration on every SIGHUP until shutdown.
#[cfg(unix)]
pub async fn reload_on_hangup(
    path: PathBuf,
    config: watch::Sender<Arc<Config>>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;
    loop {
        tokio::select! {
            _ = stopped(&mut shutdown) => return Ok(()),
            received = hangup.recv() => {
                if received.is_none() {
                    return Ok(());
                }
            }
        }
        if let Err(e) = reload_config(&path, &config) {
            tracing::error!("config reload rejected, keeping previous: {:#}", e);
        }
    }
}

#[cfg(not(unix))]
pub async fn reload_on_hangup(
    _path: PathBuf,
    _config: watch::Sender<Arc<Config>>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    stopped(&mut shutdown).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SAMPLE_CONFIG;
    use crate::dispatch::SubscriberReport;
    use std::collections::BTreeMap;

    #[test]
    fn test_ingest_outcome() {
        let mut report = IngestReport::default();
        assert_eq!(report.outcome(), JobOutcome::Ok);
        report.calls = 4;
        report.failed_calls = 1;
        report.degraded = true;
        assert_eq!(report.outcome(), JobOutcome::Partial);
        report.failed_calls = 4;
        assert_eq!(report.outcome(), JobOutcome::Failed);
    }

    #[test]
    fn test_dispatch_outcome() {
        let mut report = DispatchReport {
            sent: 2,
            failed: 0,
            subscribers: BTreeMap::from([("a".to_string(), SubscriberReport::default())]),
        };
        assert_eq!(report.outcome(), JobOutcome::Ok);
        report.failed = 1;
        assert_eq!(report.outcome(), JobOutcome::Partial);
        report.sent = 0;
        assert_eq!(report.outcome(), JobOutcome::Failed);
    }

    #[test]
    fn test_reload_replaces_config_and_keeps_it_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("matchcast.toml");
        let initial = Config::from_toml_str(SAMPLE_CONFIG).unwrap();
        let (tx, rx) = watch::channel(Arc::new(initial));

        let edited = SAMPLE_CONFIG.replace("value_threshold = 0.05", "value_threshold = 0.08");
        std::fs::write(&path, edited).unwrap();
        reload_config(&path, &tx).unwrap();
        assert_eq!(rx.borrow().value_threshold, 0.08);

        std::fs::write(&path, "form_window = 0").unwrap();
        assert!(reload_config(&path, &tx).is_err());
        assert_eq!(rx.borrow().value_threshold, 0.08);
    }

    #[tokio::test]
    async fn test_stopped_resolves_when_sender_dropped() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        stopped(&mut rx).await;
    }
}
