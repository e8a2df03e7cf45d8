// Shared fakes for the integration tests: an in-process provider and a
// recording messaging adapter.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use matchcast::config::Config;
use matchcast::dispatch::adapter::{MessagingAdapter, SendError};
use matchcast::error::ProviderError;
use matchcast::feed::rate_limit::QuotaSnapshot;
use matchcast::feed::{Batch, ProviderClient};
use matchcast::model::{
    Fixture, FixtureStatus, MarketOdds, Outcome, PredictionRecord, RawFixture, RawTeam, Score,
    TeamForm, TeamRef, Triple,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub const BASE_CONFIG: &str = r#"
[[providers]]
name = "p1"
kind = "football-data"
base_url = "http://localhost:1"
requests_per_minute = 10
precedence = 0
competition_ids = { X = "XL" }

[[providers]]
name = "p2"
kind = "api-football"
base_url = "http://localhost:2"
requests_per_minute = 10
precedence = 1
competition_ids = { X = "99" }

[[competitions]]
id = "X"
name = "League X"
country = "England"

[teams.aliases]
"Team A" = "team-a"
"Team A FC" = "team-a"
"Team B" = "team-b"
"B United" = "team-b"
"#;

/// `extra` TOML followed by `BASE_CONFIG`; top-level keys in `extra` must
/// precede its tables.
pub fn config(extra: &str) -> Config {
    Config::from_toml_str(&format!("{extra}\n{BASE_CONFIG}")).unwrap()
}

pub fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
}

/// A scheduled fixture in competition X. Teams are `(provider id, name)`.
pub fn raw(
    provider: &str,
    id: &str,
    home: (&str, &str),
    away: (&str, &str),
    kickoff: DateTime<Utc>,
) -> RawFixture {
    RawFixture {
        provider: provider.into(),
        provider_fixture_id: id.into(),
        kickoff,
        competition_id: "X".into(),
        competition_name: "League X".into(),
        country: Some("England".into()),
        home: RawTeam { id: home.0.into(), name: home.1.into() },
        away: RawTeam { id: away.0.into(), name: away.1.into() },
        venue: None,
        status: FixtureStatus::Scheduled,
        score: None,
    }
}

pub fn finished(
    provider: &str,
    id: &str,
    home: (&str, &str),
    away: (&str, &str),
    kickoff: DateTime<Utc>,
    goals: (u16, u16),
) -> RawFixture {
    RawFixture {
        status: FixtureStatus::Finished,
        score: Some(Score { home: goals.0, away: goals.1 }),
        ..raw(provider, id, home, away, kickoff)
    }
}

pub fn team(key: &str) -> TeamRef {
    TeamRef {
        key: key.into(),
        name: key.into(),
        provider_ids: BTreeMap::new(),
    }
}

pub fn fixture(key: &str, kickoff: DateTime<Utc>) -> Fixture {
    Fixture {
        fixture_key: key.into(),
        provider: "p1".into(),
        provider_fixture_id: key.into(),
        provider_fixture_ids: BTreeMap::new(),
        kickoff,
        competition_id: "X".into(),
        competition_name: "League X".into(),
        country: "England".into(),
        home: team("home"),
        away: team("away"),
        venue: None,
        status: FixtureStatus::Scheduled,
        score: None,
        source_providers: BTreeSet::from(["p1".to_string()]),
        market_odds: None,
        updated_at: kickoff,
    }
}

/// Aggregated form with the given rates; `matches` stays empty.
pub fn form(key: &str, n: usize, rates: (f64, f64, f64), gf: f64, ga: f64) -> TeamForm {
    let mut f = TeamForm::neutral(key, at(2025, 3, 1, 0, 0));
    f.win_rate = rates.0;
    f.draw_rate = rates.1;
    f.loss_rate = rates.2;
    f.avg_gf = gf;
    f.avg_ga = ga;
    f.sample_size = n;
    f
}

pub fn record(key: &str, confidence: f64, reliability: f64, kickoff: DateTime<Utc>) -> PredictionRecord {
    PredictionRecord {
        fixture_key: key.into(),
        engine_version: "1.0.0".into(),
        competition_id: "X".into(),
        competition_name: "League X".into(),
        home_name: format!("{key} home"),
        away_name: format!("{key} away"),
        kickoff,
        probabilities: Triple { home: confidence, draw: (1.0 - confidence) / 2.0, away: (1.0 - confidence) / 2.0 },
        fair_odds: Triple { home: 1.0 / confidence, draw: 4.0, away: 4.0 },
        label: Outcome::Home,
        confidence,
        reliability,
        market_odds: None,
        values: None,
        home_form_hash: String::new(),
        away_form_hash: String::new(),
        home_sample_size: 10,
        away_sample_size: 10,
        created_at: kickoff - chrono::Duration::hours(6),
    }
}

// ── Provider ─────────────────────────────────────────────────────────

pub struct FakeProvider {
    name: String,
    precedence: i32,
    pub fixtures: Mutex<Vec<RawFixture>>,
    pub live: Mutex<Vec<RawFixture>>,
    /// provider team id -> finished matches
    pub recent: Mutex<HashMap<String, Vec<RawFixture>>>,
    pub odds: Mutex<Option<MarketOdds>>,
    pub fail_fixtures: AtomicBool,
    pub fail_recent: AtomicBool,
    pub recent_delay: Mutex<Duration>,
    pub fixture_calls: AtomicUsize,
    pub recent_calls: AtomicUsize,
}

impl FakeProvider {
    pub fn new(name: &str, precedence: i32) -> Self {
        Self {
            name: name.into(),
            precedence,
            fixtures: Mutex::new(Vec::new()),
            live: Mutex::new(Vec::new()),
            recent: Mutex::new(HashMap::new()),
            odds: Mutex::new(None),
            fail_fixtures: AtomicBool::new(false),
            fail_recent: AtomicBool::new(false),
            recent_delay: Mutex::new(Duration::ZERO),
            fixture_calls: AtomicUsize::new(0),
            recent_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_fixtures(self, fixtures: Vec<RawFixture>) -> Self {
        *self.fixtures.lock().unwrap() = fixtures;
        self
    }

    pub fn with_recent(self, team_id: &str, results: Vec<RawFixture>) -> Self {
        self.recent.lock().unwrap().insert(team_id.into(), results);
        self
    }

    fn transient(&self) -> ProviderError {
        ProviderError::Transient {
            provider: self.name.clone(),
            detail: "simulated outage".into(),
        }
    }
}

#[async_trait]
impl ProviderClient for FakeProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn precedence(&self) -> i32 {
        self.precedence
    }

    fn supports_competition(&self, competition_id: &str) -> bool {
        competition_id == "X"
    }

    async fn list_fixtures(
        &self,
        competition_id: &str,
        _date_from: NaiveDate,
        _date_to: NaiveDate,
        _statuses: &[FixtureStatus],
    ) -> Result<Batch<RawFixture>, ProviderError> {
        self.fixture_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_fixtures.load(Ordering::SeqCst) {
            return Err(self.transient());
        }
        let items = self
            .fixtures
            .lock()
            .unwrap()
            .iter()
            .filter(|f| f.competition_id == competition_id)
            .cloned()
            .collect();
        Ok(Batch { items, malformed: 0 })
    }

    async fn list_recent_finished(&self, team: &TeamRef, limit: usize) -> Result<Batch<RawFixture>, ProviderError> {
        self.recent_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.recent_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_recent.load(Ordering::SeqCst) {
            return Err(self.transient());
        }
        let Some(team_id) = team.provider_id(&self.name) else {
            return Err(ProviderError::UnknownTeam {
                provider: self.name.clone(),
                team_key: team.key.clone(),
            });
        };
        let mut items = self.recent.lock().unwrap().get(team_id).cloned().unwrap_or_default();
        items.truncate(limit);
        Ok(Batch { items, malformed: 0 })
    }

    async fn list_live(&self) -> Result<Batch<RawFixture>, ProviderError> {
        if self.fail_fixtures.load(Ordering::SeqCst) {
            return Err(self.transient());
        }
        Ok(Batch {
            items: self.live.lock().unwrap().clone(),
            malformed: 0,
        })
    }

    async fn get_market_odds(&self, _fixture: &Fixture) -> Result<Option<MarketOdds>, ProviderError> {
        Ok(self.odds.lock().unwrap().clone())
    }

    fn quota(&self) -> QuotaSnapshot {
        QuotaSnapshot::default()
    }
}

// ── Messaging ────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingAdapter {
    pub sent: Mutex<Vec<(String, String)>>,
    pub failing: Mutex<HashSet<String>>,
    pub attempts: AtomicUsize,
    /// Every send from this attempt index on fails.
    pub fail_from_attempt: Mutex<Option<usize>>,
    /// Overrides the 4096-char message limit.
    pub max_len: Mutex<Option<usize>>,
}

impl RecordingAdapter {
    pub fn fail_for(&self, handle: &str) {
        self.failing.lock().unwrap().insert(handle.into());
    }

    pub fn recover(&self, handle: &str) {
        self.failing.lock().unwrap().remove(handle);
    }

    pub fn sent_to(&self, handle: &str) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(h, _)| h == handle)
            .map(|(_, text)| text.clone())
            .collect()
    }
}

#[async_trait]
impl MessagingAdapter for RecordingAdapter {
    fn name(&self) -> &str {
        "recording"
    }

    fn max_message_len(&self) -> usize {
        self.max_len.lock().unwrap().unwrap_or(4096)
    }

    async fn send(&self, handle: &str, text: &str) -> Result<(), SendError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        let cut_off = self.fail_from_attempt.lock().unwrap().is_some_and(|n| attempt >= n);
        if cut_off || self.failing.lock().unwrap().contains(handle) {
            return Err(SendError {
                handle: handle.into(),
                detail: "simulated 503".into(),
                retryable: true,
            });
        }
        self.sent.lock().unwrap().push((handle.into(), text.into()));
        Ok(())
    }
}
